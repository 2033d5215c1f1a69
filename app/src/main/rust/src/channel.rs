// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Flutware

//! Method-call dispatcher for the `com.flutware.builder/installer` channel.

use std::path::Path;

use flutware_signing::{ApkSigner, LocalKeystore};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::BridgeConfig;
use crate::installer::{InstallIntent, PackageInstaller};

pub const METHOD_INSTALL_APK: &str = "installApk";
pub const METHOD_SIGN_APK: &str = "signApk";

pub const INVALID_PATH: &str = "INVALID_PATH";
pub const INVALID_ARGS: &str = "INVALID_ARGS";
/// `installApk` on a path that is not a file. Reported, never thrown: the
/// Kotlin host must resolve the Dart call with this as a plain value (or
/// log it) instead of turning it into a `PlatformException`.
pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
pub const INSTALL_ERROR: &str = "INSTALL_ERROR";
pub const SIGN_ERROR: &str = "SIGN_ERROR";
pub const NOT_INITIALIZED: &str = "NOT_INITIALIZED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    /// Decodes the arguments object sent alongside `method`.
    ///
    /// A missing or `null` payload means no arguments.
    pub fn from_json(method: &str, arguments: Option<&str>) -> serde_json::Result<Self> {
        let arguments = match arguments.map(str::trim) {
            None | Some("") => Map::new(),
            Some(json) => match serde_json::from_str::<Value>(json)? {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "arguments must be a JSON object, got {}",
                        other
                    )))
                }
            },
        };
        Ok(Self::new(method, arguments))
    }

    /// String argument `name`; absent, `null` and non-string values are all null.
    pub fn string_argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MethodResponse {
    Success {
        result: Value,
    },
    Error {
        code: String,
        message: Option<String>,
        details: Option<Value>,
    },
    NotImplemented,
}

impl MethodResponse {
    pub fn success(result: impl Into<Value>) -> Self {
        MethodResponse::Success {
            result: result.into(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        MethodResponse::Error {
            code: code.to_string(),
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MethodResponse::Success { .. })
    }

    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => format!(
                r#"{{"status":"error","code":"INTERNAL_ERROR","message":"Failed to serialize response: {}","details":null}}"#,
                e.to_string().replace('"', "'")
            ),
        }
    }
}

/// Handles `installApk` and `signApk` against the local keystore and a
/// [`PackageInstaller`].
pub struct InstallerChannel<I> {
    config: BridgeConfig,
    keystore: LocalKeystore,
    installer: I,
}

impl<I: PackageInstaller> InstallerChannel<I> {
    pub fn new(config: BridgeConfig, installer: I) -> Self {
        let keystore = LocalKeystore::new(config.keystore_config());
        Self {
            config,
            keystore,
            installer,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn keystore(&self) -> &LocalKeystore {
        &self.keystore
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    pub fn handle(&self, call: &MethodCall) -> MethodResponse {
        match call.method.as_str() {
            METHOD_INSTALL_APK => self.install_apk(call),
            METHOD_SIGN_APK => self.sign_apk(call),
            other => {
                warn!("Unknown method on {}: {}", self.config.channel_name, other);
                MethodResponse::NotImplemented
            }
        }
    }

    /// Decodes and dispatches a raw call; malformed arguments are an
    /// `INVALID_ARGS` error.
    pub fn handle_json(&self, method: &str, arguments: Option<&str>) -> MethodResponse {
        match MethodCall::from_json(method, arguments) {
            Ok(call) => self.handle(&call),
            Err(e) => MethodResponse::error(INVALID_ARGS, e.to_string()),
        }
    }

    fn install_apk(&self, call: &MethodCall) -> MethodResponse {
        let Some(path) = call.string_argument("path") else {
            return MethodResponse::error(INVALID_PATH, "Path is null");
        };
        let path = Path::new(path);
        info!("InstallApk: {}", path.display());

        if !path.is_file() {
            warn!("InstallApk: file does not exist: {}", path.display());
            return MethodResponse::error(FILE_NOT_FOUND, format!("File not found: {}", path.display()));
        }

        let launched = self.installer.sdk_int().and_then(|sdk_int| {
            let intent = InstallIntent::for_file(path, &self.config.file_provider_authority(), sdk_int);
            self.installer.launch(&intent)
        });

        match launched {
            Ok(()) => MethodResponse::success(Value::Null),
            Err(e) => {
                error!("InstallApk failed: {}", e);
                MethodResponse::error(INSTALL_ERROR, e.to_string())
            }
        }
    }

    fn sign_apk(&self, call: &MethodCall) -> MethodResponse {
        let (Some(input), Some(output)) = (
            call.string_argument("inputPath"),
            call.string_argument("outputPath"),
        ) else {
            return MethodResponse::error(INVALID_ARGS, "Args are null");
        };

        match self.sign(Path::new(input), Path::new(output)) {
            Ok(()) => MethodResponse::success(output),
            Err(e) => {
                error!("SignApk failed: {}", e);
                MethodResponse::error(SIGN_ERROR, e.to_string())
            }
        }
    }

    fn sign(&self, input: &Path, output: &Path) -> flutware_signing::Result<()> {
        let identity = self.keystore.load_or_create()?;
        let schemes = self.config.signing;
        ApkSigner::new(&identity)
            .v1_signing_enabled(schemes.v1)
            .v2_signing_enabled(schemes.v2)
            .v3_signing_enabled(schemes.v3)
            .sign_file(input, output)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use flutware_signing::{verify, SchemeStatus};
    use serde_json::json;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    use super::*;
    use crate::installer::{InstallError, UriSource};

    #[derive(Default)]
    struct RecordingInstaller {
        sdk_int: i32,
        fail_with: Option<String>,
        launched: RefCell<Vec<InstallIntent>>,
    }

    impl PackageInstaller for RecordingInstaller {
        fn sdk_int(&self) -> crate::installer::Result<i32> {
            Ok(self.sdk_int)
        }

        fn launch(&self, intent: &InstallIntent) -> crate::installer::Result<()> {
            if let Some(message) = &self.fail_with {
                return Err(InstallError::Java(message.clone()));
            }
            self.launched.borrow_mut().push(intent.clone());
            Ok(())
        }
    }

    fn channel(dir: &Path, installer: RecordingInstaller) -> InstallerChannel<RecordingInstaller> {
        InstallerChannel::new(BridgeConfig::new(dir.join("files"), "uz.flutware.builder.app"), installer)
    }

    fn call(method: &str, arguments: Value) -> MethodCall {
        match arguments {
            Value::Object(map) => MethodCall::new(method, map),
            _ => MethodCall::new(method, Map::new()),
        }
    }

    fn unsigned_apk() -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("AndroidManifest.xml", FileOptions::default()).unwrap();
        writer.write_all(&[0x03, 0x00, 0x08, 0x00, 0x10, 0x00]).unwrap();
        writer.start_file("classes.dex", FileOptions::default()).unwrap();
        writer.write_all(b"dex\n035\0").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_install_null_path() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());

        let response = channel.handle(&call("installApk", json!({})));
        assert_eq!(response, MethodResponse::error("INVALID_PATH", "Path is null"));

        let response = channel.handle(&call("installApk", json!({ "path": null })));
        assert_eq!(response, MethodResponse::error("INVALID_PATH", "Path is null"));
        assert!(channel.installer().launched.borrow().is_empty());
    }

    #[test]
    fn test_install_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());
        let missing = dir.path().join("missing.apk");

        let response = channel.handle(&call("installApk", json!({ "path": missing })));
        assert_matches!(response, MethodResponse::Error { ref code, .. } if code == FILE_NOT_FOUND);
        assert!(channel.installer().launched.borrow().is_empty());
    }

    #[test]
    fn test_install_launches_content_uri_intent() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        fs::write(&apk, unsigned_apk()).unwrap();
        let channel = channel(
            dir.path(),
            RecordingInstaller {
                sdk_int: 33,
                ..Default::default()
            },
        );

        let response = channel.handle(&call("installApk", json!({ "path": apk })));
        assert_eq!(response, MethodResponse::Success { result: Value::Null });

        let launched = channel.installer().launched.borrow();
        assert_eq!(launched.len(), 1);
        assert_eq!(
            launched[0].data,
            UriSource::ContentProvider {
                authority: "uz.flutware.builder.app.fileprovider".to_string(),
                file: apk.clone(),
            }
        );
        assert!(launched[0].grants_read_permission());
    }

    #[test]
    fn test_install_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        fs::write(&apk, unsigned_apk()).unwrap();
        let channel = channel(
            dir.path(),
            RecordingInstaller {
                sdk_int: 30,
                fail_with: Some("android.content.ActivityNotFoundException".to_string()),
                ..Default::default()
            },
        );

        let response = channel.handle(&call("installApk", json!({ "path": apk })));
        assert_eq!(
            response,
            MethodResponse::error("INSTALL_ERROR", "android.content.ActivityNotFoundException")
        );
    }

    #[test]
    fn test_sign_null_args() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());

        for arguments in [
            json!({}),
            json!({ "inputPath": "/tmp/in.apk" }),
            json!({ "outputPath": "/tmp/out.apk" }),
            json!({ "inputPath": null, "outputPath": "/tmp/out.apk" }),
        ] {
            let response = channel.handle(&call("signApk", arguments));
            assert_eq!(response, MethodResponse::error("INVALID_ARGS", "Args are null"));
        }
        assert!(!channel.keystore().exists());
    }

    #[test]
    fn test_sign_creates_keystore_and_signs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("app-unsigned.apk");
        let output = dir.path().join("app-signed.apk");
        fs::write(&input, unsigned_apk()).unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());

        let response = channel.handle(&call(
            "signApk",
            json!({ "inputPath": input, "outputPath": output }),
        ));
        assert_eq!(response, MethodResponse::success(output.to_str().unwrap()));
        assert!(channel.keystore().exists());

        let verification = verify(&fs::read(&output).unwrap()).unwrap();
        assert_eq!(verification.v1, SchemeStatus::Verified);
        assert_eq!(verification.v2, SchemeStatus::Verified);
        assert_eq!(verification.v3, SchemeStatus::Verified);
    }

    #[test]
    fn test_sign_reuses_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.apk");
        fs::write(&input, unsigned_apk()).unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());

        let first = dir.path().join("first.apk");
        let second = dir.path().join("second.apk");
        assert!(channel
            .handle(&call("signApk", json!({ "inputPath": input, "outputPath": first })))
            .is_success());
        let keystore_bytes = fs::read(channel.keystore().path()).unwrap();
        assert!(channel
            .handle(&call("signApk", json!({ "inputPath": input, "outputPath": second })))
            .is_success());

        assert_eq!(fs::read(channel.keystore().path()).unwrap(), keystore_bytes);
        let first = verify(&fs::read(first).unwrap()).unwrap();
        let second = verify(&fs::read(second).unwrap()).unwrap();
        assert_eq!(first.certificates, second.certificates);
    }

    #[test]
    fn test_sign_failure_carries_message() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());
        let missing = dir.path().join("missing.apk");

        let response = channel.handle(&call(
            "signApk",
            json!({ "inputPath": missing, "outputPath": dir.path().join("out.apk") }),
        ));
        assert_matches!(
            response,
            MethodResponse::Error { ref code, message: Some(_), .. } if code == SIGN_ERROR
        );
        assert!(!dir.path().join("out.apk").exists());
    }

    #[test]
    fn test_unknown_method() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());
        assert_eq!(channel.handle(&call("uninstallApk", json!({}))), MethodResponse::NotImplemented);
    }

    #[test]
    fn test_handle_json_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), RecordingInstaller::default());

        assert_eq!(
            channel.handle_json("installApk", None),
            MethodResponse::error("INVALID_PATH", "Path is null")
        );
        assert_eq!(
            channel.handle_json("signApk", Some("null")),
            MethodResponse::error("INVALID_ARGS", "Args are null")
        );
        assert_matches!(
            channel.handle_json("signApk", Some("{broken")),
            MethodResponse::Error { ref code, .. } if code == INVALID_ARGS
        );
        assert_matches!(
            channel.handle_json("signApk", Some("[1, 2]")),
            MethodResponse::Error { ref code, .. } if code == INVALID_ARGS
        );
    }

    #[test]
    fn test_response_json_shape() {
        assert_eq!(
            MethodResponse::success("/out.apk").to_json(),
            r#"{"status":"success","result":"/out.apk"}"#
        );
        assert_eq!(
            MethodResponse::error("INVALID_PATH", "Path is null").to_json(),
            r#"{"status":"error","code":"INVALID_PATH","message":"Path is null","details":null}"#
        );
        assert_eq!(
            MethodResponse::NotImplemented.to_json(),
            r#"{"status":"notImplemented"}"#
        );
    }
}
