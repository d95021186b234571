//! In-memory blob store.
//!
//! Shared between engines in tests to stand in for one remote, with knobs for
//! the failure modes the engine must survive: a storage quota, transient
//! errors, corrupted reads and hooks that run before each call.

use super::store::BlobStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Callback invoked with the key before a `put` or `get`.
pub type CallHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Faults {
    /// Remaining transient failures per key, for both get and put.
    transient: HashMap<String, u32>,
    /// Bytes served instead of the stored blob, with remaining count.
    get_overrides: HashMap<String, (Vec<u8>, u32)>,
    put_hook: Option<CallHook>,
    get_hook: Option<CallHook>,
}

/// Blob store backed by a map in memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    quota_bytes: Option<u64>,
    faults: Mutex<Faults>,
    puts: AtomicUsize,
    gets: AtomicUsize,
    deletes: AtomicUsize,
    discards: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes pushing total size past `bytes`.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            quota_bytes: Some(bytes),
            ..Self::default()
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next `times` gets or puts of `key` fail with a transient error.
    pub fn fail_transiently(&self, key: &str, times: u32) {
        self.faults().transient.insert(key.to_string(), times);
    }

    /// The next `times` gets of `key` return `bytes` instead of the stored blob.
    pub fn override_get(&self, key: &str, bytes: Vec<u8>, times: u32) {
        self.faults()
            .get_overrides
            .insert(key.to_string(), (bytes, times));
    }

    /// Runs `hook` before every put.
    pub fn set_put_hook(&self, hook: CallHook) {
        self.faults().put_hook = Some(hook);
    }

    /// Runs `hook` before every get.
    pub fn set_get_hook(&self, hook: CallHook) {
        self.faults().get_hook = Some(hook);
    }

    fn take_transient(&self, key: &str) -> bool {
        let mut faults = self.faults();
        match faults.transient.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_override(&self, key: &str) -> Option<Vec<u8>> {
        let mut faults = self.faults();
        let (bytes, remaining) = faults.get_overrides.get_mut(key)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(bytes.clone())
    }

    /// Stored bytes of `key`, bypassing faults and counters.
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().await.get(key).cloned()
    }

    /// Stores bytes directly, bypassing quota, faults and counters.
    pub async fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.write().await.insert(key.to_string(), bytes);
    }

    pub async fn keys(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }

    pub async fn used_bytes(&self) -> u64 {
        self.blobs.read().await.values().map(|b| b.len() as u64).sum()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn discard_count(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn provider_name(&self) -> &'static str {
        "Memory"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> SyncResult<()> {
        let hook = self.faults().put_hook.clone();
        if let Some(hook) = hook {
            hook(key);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.take_transient(key) {
            return Err(SyncError::TransientIo(format!("injected failure writing {key}")));
        }

        let mut blobs = self.blobs.write().await;
        if let Some(quota) = self.quota_bytes {
            let used: u64 = blobs.values().map(|b| b.len() as u64).sum();
            let replaced = blobs.get(key).map_or(0, |b| b.len() as u64);
            let after = used - replaced + bytes.len() as u64;
            if after > quota {
                return Err(SyncError::QuotaExceeded(format!(
                    "writing {key} needs {after} bytes of {quota}"
                )));
            }
        }
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> SyncResult<Vec<u8>> {
        let hook = self.faults().get_hook.clone();
        if let Some(hook) = hook {
            hook(key);
        }
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.take_transient(key) {
            return Err(SyncError::TransientIo(format!("injected failure reading {key}")));
        }
        if let Some(bytes) = self.take_override(key) {
            return Ok(bytes);
        }
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> SyncResult<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn discard_buffered(&self) -> SyncResult<()> {
        self.discards.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
