//! Remote blob storage.
//!
//! - `BlobStore`: the trait every backend implements
//! - `FsBlobStore`: a directory, e.g. a folder synced by a cloud drive client
//! - `MemoryBlobStore`: in-process store with quota and fault injection

pub mod fs;
pub mod memory;
pub mod store;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use store::{blob_key, conversation_prefix, BlobStore, CONVERSATIONS_PREFIX, MANIFEST_KEY};
