// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Flutware

//! Flutware Installer Bridge - Rust Implementation
//!
//! Native side of the `com.flutware.builder/installer` channel: signs
//! APKs with a locally generated identity and hands them to the system
//! package installer.

pub mod channel;
pub mod config;
pub mod installer;

use std::path::PathBuf;

use anyhow::Context;
use jni::objects::{JClass, JObject, JString};
use jni::sys::{jboolean, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{error, info};
use once_cell::sync::OnceCell;

#[cfg(target_os = "android")]
use android_logger::Config;
use log::LevelFilter;

use crate::channel::{InstallerChannel, MethodResponse, NOT_INITIALIZED};
use crate::config::BridgeConfig;
use crate::installer::{take_exception, JniPackageInstaller, PackageInstaller};

pub const LOG_TAG: &str = "FlutwareInstaller";

static BRIDGE: OnceCell<InstallerChannel<JniPackageInstaller>> = OnceCell::new();

#[cfg(target_os = "android")]
fn init_logging() {
    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Info)
            .with_tag(LOG_TAG),
    );
}

#[cfg(not(target_os = "android"))]
fn init_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_target(false)
        .try_init();
}

/// Decodes and dispatches one call; `bridge` is `None` until init has run.
pub fn dispatch<I: PackageInstaller>(
    bridge: Option<&InstallerChannel<I>>,
    method: &str,
    arguments: Option<&str>,
) -> MethodResponse {
    match bridge {
        Some(channel) => channel.handle_json(method, arguments),
        None => MethodResponse::error(NOT_INITIALIZED, "nativeInit has not been called"),
    }
}

fn optional_string(env: &mut JNIEnv, value: &JString) -> jni::errors::Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    let text: String = env.get_string(value)?.into();
    Ok(Some(text))
}

fn string_result(env: &mut JNIEnv, object: JObject) -> anyhow::Result<String> {
    let text = JString::from(object);
    let text: String = env.get_string(&text)?.into();
    Ok(text)
}

fn init_bridge(env: &mut JNIEnv, context: &JObject, config_json: &JString) -> anyhow::Result<()> {
    if BRIDGE.get().is_some() {
        return Ok(());
    }

    let overrides = optional_string(env, config_json)?;
    let mut config = BridgeConfig::from_json(overrides.as_deref().unwrap_or(""))
        .context("Invalid bridge configuration")?;

    let app_context = env
        .call_method(context, "getApplicationContext", "()Landroid/content/Context;", &[])?
        .l()?;
    let files_dir = env
        .call_method(&app_context, "getFilesDir", "()Ljava/io/File;", &[])?
        .l()?;
    let files_dir = env
        .call_method(&files_dir, "getAbsolutePath", "()Ljava/lang/String;", &[])?
        .l()?;
    config.files_dir = PathBuf::from(string_result(env, files_dir)?);
    let package_name = env
        .call_method(&app_context, "getPackageName", "()Ljava/lang/String;", &[])?
        .l()?;
    config.package_name = string_result(env, package_name)?;

    let installer = JniPackageInstaller::new(env, &app_context).context("Failed to hold application context")?;
    info!(
        "Bridge ready on {} (package {}, keystore {})",
        config.channel_name,
        config.package_name,
        config.keystore_config().path.display()
    );
    // A concurrent init may have won; its bridge is equivalent.
    let _ = BRIDGE.set(InstallerChannel::new(config, installer));
    Ok(())
}

// ============================================================================
// JNI Bindings
// ============================================================================

/// Initialize logging and the bridge - JNI entry point
///
/// Returns `true` once the bridge is ready; repeated calls keep the first bridge.
#[no_mangle]
pub extern "C" fn Java_uz_flutware_builder_app_NativeInstallerBridge_nativeInit(
    mut env: JNIEnv,
    _class: JClass,
    context: JObject,
    config_json: JString,
) -> jboolean {
    init_logging();

    match init_bridge(&mut env, &context, &config_json) {
        Ok(()) => JNI_TRUE,
        Err(e) => {
            let exception = take_exception(&mut env);
            error!("nativeInit failed: {:#} {}", e, exception.unwrap_or_default());
            JNI_FALSE
        }
    }
}

/// Handle a channel method call - JNI entry point (blocking)
///
/// Returns the JSON-encoded `MethodResponse`.
#[no_mangle]
pub extern "C" fn Java_uz_flutware_builder_app_NativeInstallerBridge_nativeHandleMethodCall(
    mut env: JNIEnv,
    _class: JClass,
    method: JString,
    arguments_json: JString,
) -> jstring {
    let method = match optional_string(&mut env, &method) {
        Ok(method) => method.unwrap_or_default(),
        Err(_) => String::new(),
    };
    let response = match optional_string(&mut env, &arguments_json) {
        Ok(arguments) => dispatch(BRIDGE.get(), &method, arguments.as_deref()),
        Err(e) => MethodResponse::error(channel::INVALID_ARGS, e.to_string()),
    };

    match env.new_string(response.to_json()) {
        Ok(jstr) => jstr.into_raw(),
        Err(_) => match env.new_string(r#"{"status":"error","code":"INTERNAL_ERROR","message":"Failed to create string","details":null}"#) {
            Ok(jstr) => jstr.into_raw(),
            Err(_) => std::ptr::null_mut(),
        },
    }
}
