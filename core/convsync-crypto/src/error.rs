//! Error types for the encryption layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed (bad parameters).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The ciphertext did not authenticate: wrong passphrase or tampered data.
    #[error("authentication failed (wrong passphrase or tampered data)")]
    Authentication,

    /// The bytes are not a well-formed envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The envelope was written by an unknown format version.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    /// Passphrases must be non-empty.
    #[error("passphrase must not be empty")]
    EmptyPassphrase,
}

impl CryptoError {
    /// Returns true for wrong-passphrase / tampering failures.
    pub fn is_authentication(&self) -> bool {
        matches!(self, CryptoError::Authentication)
    }
}
