//! Blob store abstraction.
//!
//! The remote side is a passive object store: it sees opaque names and
//! encrypted bytes, nothing else.

use crate::error::SyncResult;
use async_trait::async_trait;
use convsync_types::{ContentHash, ConversationId};

/// Key of the encrypted manifest.
pub const MANIFEST_KEY: &str = "manifest.json.enc";

/// Prefix shared by all conversation file blobs.
pub const CONVERSATIONS_PREFIX: &str = "conversations/";

/// Key of one version of one file: `conversations/<id>.<path>.<hash>`.
///
/// `.` and `%` in the id are percent-encoded, so the first `.` after the
/// prefix always ends the id. The content hash suffix gives every version
/// its own blob; a new upload never replaces bytes an existing manifest
/// entry points at.
pub fn blob_key(conversation: &ConversationId, path: &str, hash: &ContentHash) -> String {
    format!("{}{path}.{hash}", conversation_prefix(conversation))
}

/// Prefix of every blob belonging to `conversation`.
pub fn conversation_prefix(conversation: &ConversationId) -> String {
    let mut key = String::from(CONVERSATIONS_PREFIX);
    for c in conversation.as_str().chars() {
        match c {
            '%' => key.push_str("%25"),
            '.' => key.push_str("%2E"),
            c => key.push(c),
        }
    }
    key.push('.');
    key
}

/// Opaque named-blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the name of the storage provider.
    fn provider_name(&self) -> &'static str;

    /// Writes (or replaces) a blob.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> SyncResult<()>;

    /// Reads a blob. Missing blobs are `SyncError::NotFound`.
    async fn get(&self, key: &str) -> SyncResult<Vec<u8>>;

    /// Lists keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> SyncResult<Vec<String>>;

    /// Deletes a blob. Deleting a missing blob succeeds.
    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// Drops any cached listings or buffered state so the next call observes
    /// the store as it is now. Used by force sync.
    async fn discard_buffered(&self) -> SyncResult<()> {
        Ok(())
    }
}
