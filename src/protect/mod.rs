//! Machine-bound protection of secrets at rest.
//!
//! Secrets that must survive the restart between the two provisioning phases
//! are written to disk only as opaque tokens. A token can be turned back into
//! its plaintext only on the machine that produced it:
//!
//! - On Windows, `DpapiProtector` seals tokens with the Data Protection API in
//!   the local-machine scope; the key is an LSA secret
//! - Elsewhere, and in tests, [`MachineProtector`] uses ChaCha20-Poly1305 under
//!   a [`MachineKey`] derived with HKDF-SHA256 from `/etc/machine-id` or
//!   explicit material; a synthetic nonce makes it deterministic per machine
//! - Plaintext handed back by [`SecretProtector::unprotect`] is zeroized on drop
//!
//! No key material is supplied by callers and nothing is written to disk here.

pub mod cipher;
#[cfg(windows)]
pub mod dpapi;
pub mod machine;

pub use cipher::MachineProtector;
#[cfg(windows)]
pub use dpapi::DpapiProtector;
pub use machine::MachineKey;

use thiserror::Error;
use zeroize::Zeroizing;

/// Secret protection errors
#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("machine key material unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Invalid base64 encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("protected token is malformed: {0}")]
    Malformed(&'static str),

    #[error("integrity check failed - token was produced on another machine or altered")]
    IntegrityCheck,

    #[error("encryption failed")]
    Encryption,

    #[error("platform protection facility failed: {0}")]
    Platform(String),
}

/// Reversible, machine-bound transformation of secret strings.
pub trait SecretProtector: Send + Sync {
    /// Turn `plaintext` into an opaque, self-contained token.
    fn protect(&self, plaintext: &str) -> Result<String, ProtectionError>;

    /// Recover the plaintext of a token produced by [`Self::protect`] on this
    /// machine.
    fn unprotect(&self, token: &str) -> Result<Zeroizing<String>, ProtectionError>;
}

/// The protector for the machine this process runs on.
#[cfg(windows)]
pub fn for_this_machine() -> Result<Box<dyn SecretProtector>, ProtectionError> {
    Ok(Box::new(DpapiProtector::new()))
}

/// The protector for the machine this process runs on.
#[cfg(not(windows))]
pub fn for_this_machine() -> Result<Box<dyn SecretProtector>, ProtectionError> {
    Ok(Box::new(MachineProtector::for_this_machine()?))
}
