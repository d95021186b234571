//! Core type definitions for convsync.
//!
//! This crate defines the small, dependency-free vocabulary shared by the
//! crypto and sync crates:
//! - Machine identifiers (UUID v7) and conversation identifiers
//! - Content hashes (fixed-length lowercase hex digests)
//! - Millisecond wall-clock timestamps

mod hash;
mod ids;
mod timestamp;

pub use hash::{ContentHash, CONTENT_HASH_BYTES, CONTENT_HASH_LEN};
pub use ids::{ConversationId, MachineId, CONFLICT_MARKER};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when constructing or parsing core types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid conversation id {0:?}: {1}")]
    InvalidConversationId(String, &'static str),

    #[error("invalid content hash {0:?}")]
    InvalidHash(String),
}
