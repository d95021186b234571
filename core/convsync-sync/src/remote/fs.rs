//! Directory-backed blob store.
//!
//! Each blob is one file in a flat folder. This is how a cloud drive client
//! (iCloud Drive, Dropbox, OneDrive, ...) is used as the remote: the client
//! syncs the folder, and this store only ever sees local files.

use super::store::BlobStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Blob store over a local directory.
pub struct FsBlobStore {
    root: PathBuf,
    /// Cached listing of keys; `None` until first listed.
    listing: RwLock<Option<BTreeSet<String>>>,
}

impl FsBlobStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listing: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to a single file name. `%`, path separators and a leading
    /// `.` are percent-encoded so keys never nest or hide.
    pub fn encode_key(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        for (i, c) in key.chars().enumerate() {
            match c {
                '%' => out.push_str("%25"),
                '/' => out.push_str("%2F"),
                '\\' => out.push_str("%5C"),
                '.' if i == 0 => out.push_str("%2E"),
                c => out.push(c),
            }
        }
        out
    }

    /// Inverse of `encode_key`. Returns `None` for names it did not produce.
    pub fn decode_key(name: &str) -> Option<String> {
        let mut out = String::with_capacity(name.len());
        let mut rest = name;
        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let code = rest.get(pos + 1..pos + 3)?;
            out.push(match code {
                "25" => '%',
                "2F" => '/',
                "5C" => '\\',
                "2E" => '.',
                _ => return None,
            });
            rest = &rest[pos + 3..];
        }
        out.push_str(rest);
        Some(out)
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(Self::encode_key(key))
    }

    async fn ensure_root(&self) -> SyncResult<()> {
        if fs::metadata(&self.root).await.is_err() {
            fs::create_dir_all(&self.root)
                .await
                .map_err(|e| with_context("failed to create store folder", &self.root, e))?;
            info!("Created blob store folder: {:?}", self.root);
        }
        Ok(())
    }

    async fn scan(&self) -> SyncResult<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(with_context("failed to read store folder", &self.root, e)),
        };

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| with_context("failed to read directory entry", &self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            // Temp files from in-flight writes are hidden.
            if name.starts_with('.') {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(key) = Self::decode_key(&name) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }
}

fn with_context(action: &str, path: &Path, e: io::Error) -> SyncError {
    match SyncError::from(e) {
        SyncError::Storage(msg) => SyncError::Storage(format!("{action} {path:?}: {msg}")),
        other => other,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn provider_name(&self) -> &'static str {
        "Folder"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> SyncResult<()> {
        self.ensure_root().await?;
        let path = self.blob_path(key);
        let tmp = self
            .root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));

        debug!("Writing blob {} ({} bytes)", key, bytes.len());
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| with_context("failed to write blob", &tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(with_context("failed to move blob into place", &path, e));
        }

        if let Some(listing) = self.listing.write().await.as_mut() {
            listing.insert(key.to_string());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> SyncResult<Vec<u8>> {
        match fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SyncError::NotFound(key.to_string())),
            Err(e) => Err(with_context("failed to read blob", &self.blob_path(key), e)),
        }
    }

    async fn list(&self, prefix: &str) -> SyncResult<Vec<String>> {
        if let Some(listing) = self.listing.read().await.as_ref() {
            return Ok(listing
                .iter()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect());
        }

        let keys = self.scan().await?;
        let matching = keys.iter().filter(|k| k.starts_with(prefix)).cloned().collect();
        *self.listing.write().await = Some(keys);
        Ok(matching)
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let path = self.blob_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Deleted blob {}", key),
            // Already gone is fine for delete.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(with_context("failed to delete blob", &path, e)),
        }
        if let Some(listing) = self.listing.write().await.as_mut() {
            listing.remove(key);
        }
        Ok(())
    }

    async fn discard_buffered(&self) -> SyncResult<()> {
        *self.listing.write().await = None;
        Ok(())
    }
}
