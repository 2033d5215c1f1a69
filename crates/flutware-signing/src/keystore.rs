//! Local PKCS12 signing keystore.
//!
//! The keystore holds exactly one RSA key and one self-signed certificate
//! under a fixed alias. It is created lazily on first use and reused for
//! every later signing request.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use sha2::{Digest, Sha256};

use crate::error::{Result, SigningError};
use crate::fsutil::write_atomically;

pub const DEFAULT_KEYSTORE_FILE: &str = "flutware_local.p12";
pub const DEFAULT_ALIAS: &str = "flutware";
pub const DEFAULT_PASSWORD: &str = "flutware_secure";
/// 100 years
pub const DEFAULT_VALIDITY_DAYS: u32 = 36500;
pub const DEFAULT_KEY_BITS: u32 = 2048;

/// Subject (and issuer) of the self-signed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: String,
    pub country: String,
}

impl Default for DistinguishedName {
    fn default() -> Self {
        Self {
            common_name: "Flutware".to_string(),
            organization: "Self".to_string(),
            country: "UZ".to_string(),
        }
    }
}

/// Where the keystore lives and how its identity is generated.
#[derive(Debug, Clone)]
pub struct KeystoreConfig {
    pub path: PathBuf,
    pub alias: String,
    pub password: String,
    pub subject: DistinguishedName,
    pub validity_days: u32,
    pub key_bits: u32,
}

impl KeystoreConfig {
    /// Default keystore file inside `dir` (the app's private files directory).
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(DEFAULT_KEYSTORE_FILE),
            alias: DEFAULT_ALIAS.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            subject: DistinguishedName::default(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

/// Private key and certificate used to sign packages.
pub struct SigningIdentity {
    alias: String,
    private_key: PKey<Private>,
    certificate: X509,
}

impl SigningIdentity {
    /// Pairs a key with its certificate, rejecting mismatched halves.
    pub fn new(alias: impl Into<String>, private_key: PKey<Private>, certificate: X509) -> Result<Self> {
        let cert_key = certificate.public_key()?;
        if !cert_key.public_eq(&private_key) {
            return Err(SigningError::Keystore(
                "certificate does not match private key".to_string(),
            ));
        }
        Ok(Self {
            alias: alias.into(),
            private_key,
            certificate,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// X.509 certificate, ASN.1 DER.
    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.to_der()?)
    }

    /// SubjectPublicKeyInfo, ASN.1 DER.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.private_key.public_key_to_der()?)
    }

    /// Unencrypted PKCS#8 private key, as consumed by `ring`.
    pub(crate) fn private_key_pkcs8(&self) -> Result<Vec<u8>> {
        Ok(self.private_key.private_key_to_pkcs8()?)
    }

    /// Lower-case hex SHA-256 of the DER certificate.
    pub fn fingerprint(&self) -> Result<String> {
        let der = self.certificate_der()?;
        Ok(hex::encode(Sha256::digest(&der)))
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

/// Handle to the on-disk keystore.
///
/// `load_or_create` is serialized per handle, so overlapping calls never
/// race to generate two different identities.
pub struct LocalKeystore {
    config: KeystoreConfig,
    lock: Mutex<()>,
}

impl LocalKeystore {
    pub fn new(config: KeystoreConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn exists(&self) -> bool {
        self.config.path.is_file()
    }

    /// Loads the keystore, generating and persisting it first if absent.
    pub fn load_or_create(&self) -> Result<SigningIdentity> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SigningError::Keystore("keystore lock poisoned".to_string()))?;

        if self.exists() {
            let identity = self.load()?;
            info!("Local keystore loaded: {}", self.config.path.display());
            Ok(identity)
        } else {
            info!("Creating new local keystore...");
            let identity = self.create()?;
            info!("New local keystore saved: {}", self.config.path.display());
            Ok(identity)
        }
    }

    fn load(&self) -> Result<SigningIdentity> {
        let der = fs::read(&self.config.path)?;
        let parsed = Pkcs12::from_der(&der)
            .and_then(|pkcs12| pkcs12.parse2(&self.config.password))
            .map_err(|e| {
                SigningError::Keystore(format!(
                    "cannot open {}: {}",
                    self.config.path.display(),
                    e
                ))
            })?;

        let private_key = parsed
            .pkey
            .ok_or_else(|| SigningError::Keystore("no private key in keystore".to_string()))?;
        let certificate = parsed
            .cert
            .ok_or_else(|| SigningError::Keystore("no certificate in keystore".to_string()))?;

        SigningIdentity::new(self.config.alias.clone(), private_key, certificate)
    }

    fn create(&self) -> Result<SigningIdentity> {
        let identity = generate_identity(&self.config)?;

        let mut builder = Pkcs12::builder();
        builder.name(&self.config.alias);
        builder.pkey(identity.private_key());
        builder.cert(identity.certificate());
        let pkcs12 = builder.build2(&self.config.password)?;

        write_atomically(&self.config.path, &pkcs12.to_der()?)?;
        Ok(identity)
    }
}

/// Generates an RSA key pair and a self-signed SHA256withRSA certificate.
pub fn generate_identity(config: &KeystoreConfig) -> Result<SigningIdentity> {
    debug!("Generating RSA-{} key pair", config.key_bits);
    let private_key = PKey::from_rsa(Rsa::generate(config.key_bits)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", &config.subject.common_name)?;
    name.append_entry_by_text("O", &config.subject.organization)?;
    name.append_entry_by_text("C", &config.subject.country)?;
    let name = name.build();

    let now = Utc::now();
    let serial = BigNum::from_dec_str(&now.timestamp_millis().to_string())?.to_asn1_integer()?;
    let (not_before, not_after) = validity_window(now, config.validity_days)?;
    let not_before = Asn1Time::from_str_x509(&not_before)?;
    let not_after = Asn1Time::from_str_x509(&not_after)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&private_key)?;
    builder.sign(&private_key, MessageDigest::sha256())?;

    SigningIdentity::new(config.alias.clone(), private_key, builder.build())
}

/// `notBefore` and `notAfter` as X.509 time strings.
///
/// Computed in 64-bit so a 100-year window stays valid where `c_long` is
/// 32 bits (armeabi-v7a, x86).
fn validity_window(now: DateTime<Utc>, days: u32) -> Result<(String, String)> {
    let not_after = now
        .checked_add_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| SigningError::Config(format!("validity of {} days is out of range", days)))?;
    Ok((x509_time(now), x509_time(not_after)))
}

fn x509_time(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%SZ").to_string()
}
