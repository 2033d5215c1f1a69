// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Flutware

//! Bridge configuration.
//!
//! Every field has a default matching the shipped app; the host may pass
//! a JSON object at init to override any subset of them.

use std::path::PathBuf;

use flutware_signing::keystore::{
    DistinguishedName, KeystoreConfig, DEFAULT_ALIAS, DEFAULT_KEYSTORE_FILE, DEFAULT_KEY_BITS,
    DEFAULT_PASSWORD, DEFAULT_VALIDITY_DAYS,
};
use serde::{Deserialize, Serialize};

pub const CHANNEL_NAME: &str = "com.flutware.builder/installer";
pub const FILE_PROVIDER_SUFFIX: &str = ".fileprovider";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub channel_name: String,
    /// App private files directory; the keystore lives here.
    pub files_dir: PathBuf,
    pub package_name: String,
    pub file_provider_suffix: String,
    pub keystore: KeystoreSettings,
    pub signing: SigningSchemes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct KeystoreSettings {
    pub file_name: String,
    pub alias: String,
    pub password: String,
    pub common_name: String,
    pub organization: String,
    pub country: String,
    pub validity_days: u32,
    pub key_bits: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SigningSchemes {
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_name: CHANNEL_NAME.to_string(),
            files_dir: PathBuf::from("."),
            package_name: String::new(),
            file_provider_suffix: FILE_PROVIDER_SUFFIX.to_string(),
            keystore: KeystoreSettings::default(),
            signing: SigningSchemes::default(),
        }
    }
}

impl Default for KeystoreSettings {
    fn default() -> Self {
        let subject = DistinguishedName::default();
        Self {
            file_name: DEFAULT_KEYSTORE_FILE.to_string(),
            alias: DEFAULT_ALIAS.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            common_name: subject.common_name,
            organization: subject.organization,
            country: subject.country,
            validity_days: DEFAULT_VALIDITY_DAYS,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

impl Default for SigningSchemes {
    fn default() -> Self {
        Self {
            v1: true,
            v2: true,
            v3: true,
        }
    }
}

impl BridgeConfig {
    pub fn new(files_dir: impl Into<PathBuf>, package_name: impl Into<String>) -> Self {
        Self {
            files_dir: files_dir.into(),
            package_name: package_name.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with the fields present in `json`.
    ///
    /// Empty input yields the defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json)
    }

    /// Authority of the app's `FileProvider`, e.g. `uz.flutware.builder.app.fileprovider`.
    pub fn file_provider_authority(&self) -> String {
        format!("{}{}", self.package_name, self.file_provider_suffix)
    }

    pub fn keystore_config(&self) -> KeystoreConfig {
        let settings = &self.keystore;
        KeystoreConfig {
            path: self.files_dir.join(&settings.file_name),
            alias: settings.alias.clone(),
            password: settings.password.clone(),
            subject: DistinguishedName {
                common_name: settings.common_name.clone(),
                organization: settings.organization.clone(),
                country: settings.country.clone(),
            },
            validity_days: settings.validity_days,
            key_bits: settings.key_bits,
        }
    }
}
