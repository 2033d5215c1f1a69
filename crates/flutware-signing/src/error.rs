use thiserror::Error;

/// Errors raised while bootstrapping the keystore or signing a package.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("RSA signing failed")]
    Ring(#[from] ring::error::Unspecified),

    #[error("Signing key rejected: {0}")]
    KeyRejected(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Malformed APK: {0}")]
    MalformedApk(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Invalid signer configuration: {0}")]
    Config(String),
}

impl From<ring::error::KeyRejected> for SigningError {
    fn from(err: ring::error::KeyRejected) -> Self {
        SigningError::KeyRejected(err.to_string())
    }
}

impl From<tempfile::PersistError> for SigningError {
    fn from(err: tempfile::PersistError) -> Self {
        SigningError::Io(err.error)
    }
}

pub type Result<T> = std::result::Result<T, SigningError>;
