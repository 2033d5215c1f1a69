//! Flutware Signing
//!
//! Local self-signed code-signing identity and APK re-signing.
//!
//! - [`keystore`]: lazily created PKCS12 keystore holding one RSA-2048 key
//!   and a 100-year self-signed certificate.
//! - [`apk`]: APK Signature Scheme v1 (JAR), v2 and v3 signer and verifier.

pub mod apk;
pub mod error;
pub mod keystore;

mod fsutil;

pub use apk::{verify, ApkSigner, SchemeStatus, Verification};
pub use error::{Result, SigningError};
pub use keystore::{KeystoreConfig, LocalKeystore, SigningIdentity};
