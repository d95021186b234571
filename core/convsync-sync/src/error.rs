//! Error types for the sync layer.

use crate::conflict::ConflictState;
use convsync_crypto::CryptoError;
use convsync_types::ContentHash;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote or local operation failed in a way that may succeed on retry.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Wrong passphrase or tampered ciphertext.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Decrypted content did not match the hash recorded in the manifest.
    #[error("corrupted transfer of {key}: expected {expected}, got {actual}")]
    CorruptedTransfer {
        key: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    /// The manifest is internally inconsistent (e.g. duplicate ids).
    #[error("manifest conflict: {0}")]
    ManifestConflict(String),

    /// The remote store refused a write for lack of space.
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A blob or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A relative file path is absolute, empty or escapes its conversation.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// An identifier failed validation.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] convsync_types::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encryption layer failure other than authentication.
    #[error("crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Another sync cycle holds the guard.
    #[error("a sync cycle is already running")]
    AlreadyRunning,

    /// The cycle was cancelled before this operation started.
    #[error("sync cancelled")]
    Cancelled,

    /// A conflict was moved through an illegal state change.
    #[error("invalid conflict transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConflictState,
        to: ConflictState,
    },

    /// No passphrase has been stored yet.
    #[error("no passphrase configured")]
    MissingPassphrase,
}

/// Coarse error classification reported in sync summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    Authentication,
    CorruptedTransfer,
    ManifestConflict,
    QuotaExceeded,
    NotFound,
    InvalidPath,
    Serialization,
    Storage,
    Crypto,
    Config,
    AlreadyRunning,
    Cancelled,
    InvalidTransition,
    MissingPassphrase,
}

impl SyncError {
    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientIo(_) => ErrorKind::TransientIo,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::CorruptedTransfer { .. } => ErrorKind::CorruptedTransfer,
            SyncError::ManifestConflict(_) => ErrorKind::ManifestConflict,
            SyncError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::InvalidPath { .. } | SyncError::InvalidId(_) => ErrorKind::InvalidPath,
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Crypto(_) => ErrorKind::Crypto,
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::AlreadyRunning => ErrorKind::AlreadyRunning,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            SyncError::MissingPassphrase => ErrorKind::MissingPassphrase,
        }
    }

    /// True when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientIo(_))
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        SyncError::InvalidPath {
            path: path.into(),
            reason,
        }
    }
}

impl From<CryptoError> for SyncError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Authentication => SyncError::Authentication(e.to_string()),
            CryptoError::EmptyPassphrase => SyncError::MissingPassphrase,
            other => SyncError::Crypto(other),
        }
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(e.to_string()),
            io::ErrorKind::StorageFull => SyncError::QuotaExceeded(e.to_string()),
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ResourceBusy => SyncError::TransientIo(e.to_string()),
            _ => SyncError::Storage(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Storage(format!("background task failed: {e}"))
    }
}
