// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Flutware

//! System package installer launch.
//!
//! [`InstallIntent`] is a plain description of the VIEW intent; the
//! [`PackageInstaller`] implementation turns it into a real
//! `android.content.Intent` and starts the installer activity.

use std::path::{Path, PathBuf};

use jni::objects::{GlobalRef, JObject, JString, JValue};
use jni::{JNIEnv, JavaVM};
use log::{debug, info};
use thiserror::Error;

pub const ACTION_VIEW: &str = "android.intent.action.VIEW";
pub const APK_MIME_TYPE: &str = "application/vnd.android.package-archive";
pub const FLAG_GRANT_READ_URI_PERMISSION: i32 = 0x0000_0001;
pub const FLAG_ACTIVITY_NEW_TASK: i32 = 0x1000_0000;
/// First API level (Android 7.0) that rejects `file://` URIs crossing app boundaries.
pub const CONTENT_URI_MIN_SDK: i32 = 24;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("JNI error: {0}")]
    Jni(#[from] jni::errors::Error),

    #[error("{0}")]
    Java(String),

    #[error("Path is not valid UTF-8: {0:?}")]
    InvalidPath(PathBuf),
}

pub type Result<T> = std::result::Result<T, InstallError>;

/// Where the intent's data URI comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriSource {
    /// `FileProvider.getUriForFile(context, authority, file)`
    ContentProvider { authority: String, file: PathBuf },
    /// `Uri.fromFile(file)`
    File { file: PathBuf },
}

impl UriSource {
    pub fn file(&self) -> &Path {
        match self {
            UriSource::ContentProvider { file, .. } | UriSource::File { file } => file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallIntent {
    pub action: String,
    pub data: UriSource,
    pub mime_type: String,
    pub flags: i32,
}

impl InstallIntent {
    /// Intent that opens `file` in the platform installer.
    ///
    /// From API 24 on the file is shared through the app's `FileProvider`
    /// with a read grant; older releases get a plain file URI.
    pub fn for_file(file: impl Into<PathBuf>, authority: &str, sdk_int: i32) -> Self {
        let file = file.into();
        let (data, flags) = if sdk_int >= CONTENT_URI_MIN_SDK {
            (
                UriSource::ContentProvider {
                    authority: authority.to_string(),
                    file,
                },
                FLAG_GRANT_READ_URI_PERMISSION | FLAG_ACTIVITY_NEW_TASK,
            )
        } else {
            (UriSource::File { file }, FLAG_ACTIVITY_NEW_TASK)
        };

        Self {
            action: ACTION_VIEW.to_string(),
            data,
            mime_type: APK_MIME_TYPE.to_string(),
            flags,
        }
    }

    pub fn grants_read_permission(&self) -> bool {
        self.flags & FLAG_GRANT_READ_URI_PERMISSION != 0
    }
}

/// Launches install intents on the device.
pub trait PackageInstaller {
    /// `Build.VERSION.SDK_INT` of the running device.
    fn sdk_int(&self) -> Result<i32>;

    fn launch(&self, intent: &InstallIntent) -> Result<()>;
}

/// [`PackageInstaller`] backed by the application `Context`.
pub struct JniPackageInstaller {
    vm: JavaVM,
    context: GlobalRef,
}

impl JniPackageInstaller {
    pub fn new(env: &mut JNIEnv, context: &JObject) -> Result<Self> {
        let vm = env.get_java_vm()?;
        let context = env.new_global_ref(context)?;
        Ok(Self { vm, context })
    }

    fn build_uri<'local>(env: &mut JNIEnv<'local>, context: &JObject, source: &UriSource) -> Result<JObject<'local>> {
        let path = source
            .file()
            .to_str()
            .ok_or_else(|| InstallError::InvalidPath(source.file().to_path_buf()))?;
        let path = env.new_string(path)?;
        let file = env.new_object("java/io/File", "(Ljava/lang/String;)V", &[(&path).into()])?;

        let uri = match source {
            UriSource::ContentProvider { authority, .. } => {
                let authority = env.new_string(authority)?;
                env.call_static_method(
                    "androidx/core/content/FileProvider",
                    "getUriForFile",
                    "(Landroid/content/Context;Ljava/lang/String;Ljava/io/File;)Landroid/net/Uri;",
                    &[context.into(), (&authority).into(), (&file).into()],
                )?
                .l()?
            }
            UriSource::File { .. } => env
                .call_static_method(
                    "android/net/Uri",
                    "fromFile",
                    "(Ljava/io/File;)Landroid/net/Uri;",
                    &[(&file).into()],
                )?
                .l()?,
        };
        Ok(uri)
    }

    fn start_activity(&self, env: &mut JNIEnv, intent: &InstallIntent) -> Result<()> {
        let context = self.context.as_obj();
        let uri = Self::build_uri(env, context, &intent.data)?;
        if let Ok(text) = java_to_string(env, &uri) {
            info!("Install URI: {}", text);
        }

        let action = env.new_string(&intent.action)?;
        let mime_type = env.new_string(&intent.mime_type)?;
        let java_intent = env.new_object("android/content/Intent", "(Ljava/lang/String;)V", &[(&action).into()])?;
        env.call_method(
            &java_intent,
            "setDataAndType",
            "(Landroid/net/Uri;Ljava/lang/String;)Landroid/content/Intent;",
            &[(&uri).into(), (&mime_type).into()],
        )?;
        env.call_method(
            &java_intent,
            "addFlags",
            "(I)Landroid/content/Intent;",
            &[JValue::Int(intent.flags)],
        )?;
        env.call_method(
            context,
            "startActivity",
            "(Landroid/content/Intent;)V",
            &[(&java_intent).into()],
        )?;
        Ok(())
    }
}

impl PackageInstaller for JniPackageInstaller {
    fn sdk_int(&self) -> Result<i32> {
        let mut env = self.vm.attach_current_thread()?;
        let sdk = env
            .get_static_field("android/os/Build$VERSION", "SDK_INT", "I")
            .and_then(|value| value.i());
        sdk.map_err(|err| take_exception(&mut env).map(InstallError::Java).unwrap_or(err.into()))
    }

    fn launch(&self, intent: &InstallIntent) -> Result<()> {
        let mut env = self.vm.attach_current_thread()?;
        debug!("Launching {:?}", intent);
        match self.start_activity(&mut env, intent) {
            Ok(()) => Ok(()),
            Err(err) => Err(take_exception(&mut env).map(InstallError::Java).unwrap_or(err)),
        }
    }
}

/// Clears a pending Java exception and returns its `toString()`.
pub(crate) fn take_exception(env: &mut JNIEnv) -> Option<String> {
    if !env.exception_check().unwrap_or(false) {
        return None;
    }
    let throwable = env.exception_occurred().ok()?;
    env.exception_clear().ok()?;
    java_to_string(env, &throwable).ok()
}

fn java_to_string(env: &mut JNIEnv, object: &JObject) -> jni::errors::Result<String> {
    let text = env
        .call_method(object, "toString", "()Ljava/lang/String;", &[])?
        .l()?;
    let text = JString::from(text);
    let text: String = env.get_string(&text)?.into();
    Ok(text)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const AUTHORITY: &str = "uz.flutware.builder.app.fileprovider";

    #[test]
    fn test_content_uri_from_nougat() {
        let intent = InstallIntent::for_file("/storage/emulated/0/app.apk", AUTHORITY, 24);
        assert_eq!(intent.action, "android.intent.action.VIEW");
        assert_eq!(intent.mime_type, "application/vnd.android.package-archive");
        assert_eq!(
            intent.data,
            UriSource::ContentProvider {
                authority: AUTHORITY.to_string(),
                file: PathBuf::from("/storage/emulated/0/app.apk"),
            }
        );
        assert_eq!(intent.flags, 0x1000_0001);
        assert!(intent.grants_read_permission());
    }

    #[rstest]
    #[case(19)]
    #[case(21)]
    #[case(23)]
    fn test_file_uri_before_nougat(#[case] sdk_int: i32) {
        let intent = InstallIntent::for_file("/sdcard/app.apk", AUTHORITY, sdk_int);
        assert_eq!(
            intent.data,
            UriSource::File {
                file: PathBuf::from("/sdcard/app.apk")
            }
        );
        assert_eq!(intent.flags, FLAG_ACTIVITY_NEW_TASK);
        assert!(!intent.grants_read_permission());
    }

    #[rstest]
    #[case(24)]
    #[case(29)]
    #[case(34)]
    fn test_new_task_always_set(#[case] sdk_int: i32) {
        let intent = InstallIntent::for_file("/sdcard/app.apk", AUTHORITY, sdk_int);
        assert_ne!(intent.flags & FLAG_ACTIVITY_NEW_TASK, 0);
        assert!(intent.grants_read_permission());
    }

    #[test]
    fn test_uri_source_file() {
        let intent = InstallIntent::for_file("/data/app.apk", AUTHORITY, 34);
        assert_eq!(intent.data.file(), Path::new("/data/app.apk"));
    }
}
