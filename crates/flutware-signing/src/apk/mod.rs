//! APK signing and verification.

pub mod digest;
pub mod layout;
pub mod signer;
pub mod signing_block;
pub mod v1;
pub mod verify;

pub use signer::ApkSigner;
pub use verify::{verify, SchemeStatus, Verification};
