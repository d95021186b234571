//! The local conversation tree.
//!
//! One subdirectory per conversation under the local root, files nested
//! arbitrarily below it. Writes go to a temp file in the same directory and
//! are renamed into place, so a reader never sees a partial file.

use crate::error::{SyncError, SyncResult};
use crate::model::{FileEntry, FileMap};
use convsync_crypto::hash_reader;
use convsync_types::{ContentHash, ConversationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Directory under the local root holding sync state.
pub const STATE_DIR: &str = ".convsync";

/// Marker in the names of in-flight temp files.
const TEMP_MARKER: &str = ".convsync-tmp-";

/// Rejects paths that are empty, absolute, use `\`, or contain `.`/`..`
/// components.
pub fn validate_relative_path(path: &str) -> SyncResult<()> {
    if path.is_empty() {
        return Err(SyncError::invalid_path(path, "empty"));
    }
    if path.starts_with('/') {
        return Err(SyncError::invalid_path(path, "absolute"));
    }
    if path.contains('\\') {
        return Err(SyncError::invalid_path(path, "must use '/' separators"));
    }
    if path.chars().any(char::is_control) {
        return Err(SyncError::invalid_path(path, "control characters"));
    }
    for component in path.split('/') {
        match component {
            "" => return Err(SyncError::invalid_path(path, "empty component")),
            "." | ".." => return Err(SyncError::invalid_path(path, "dot component")),
            c if c.contains(':') && cfg!(windows) => {
                return Err(SyncError::invalid_path(path, "drive prefix"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// A file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: String,
    pub size: u64,
    pub modified: Timestamp,
}

/// A hash together with the `(mtime, size)` it was computed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHash {
    pub hash: ContentHash,
    pub size: u64,
    pub modified: Timestamp,
}

impl CachedHash {
    pub fn entry(&self) -> FileEntry {
        FileEntry::new(self.hash.clone(), self.size).with_modified(self.modified)
    }
}

/// Result of scanning one conversation.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub files: FileMap,
    /// True when any file was added, removed or changed content since the
    /// cached state.
    pub changed: bool,
    pub newest: Timestamp,
    pub oldest: Timestamp,
}

/// Access to the local conversation directories.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn conversation_dir(&self, id: &ConversationId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Absolute path of a file, after validating the relative path.
    pub fn file_path(&self, id: &ConversationId, rel: &str) -> SyncResult<PathBuf> {
        validate_relative_path(rel)?;
        let mut path = self.conversation_dir(id);
        path.extend(rel.split('/'));
        Ok(path)
    }

    /// Conversation directories under the root, conflict copies included.
    pub async fn list_conversations(&self) -> SyncResult<Vec<ConversationId>> {
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match ConversationId::new(name) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Skipping directory: {e}"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every regular file of a conversation, with `/`-separated relative paths.
    pub async fn list_files(&self, id: &ConversationId) -> SyncResult<Vec<LocalFile>> {
        let base = self.conversation_dir(id);
        let mut files = Vec::new();
        let mut pending = vec![(base, String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.contains(TEMP_MARKER) {
                    continue;
                }
                let rel = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), rel));
                } else if file_type.is_file() {
                    if let Err(e) = validate_relative_path(&rel) {
                        warn!("Skipping file in {}: {e}", id);
                        continue;
                    }
                    let metadata = entry.metadata().await?;
                    files.push(LocalFile {
                        path: rel,
                        size: metadata.len(),
                        modified: modified_of(&metadata),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Hashes a file from its current bytes. `None` if it does not exist.
    pub async fn hash_file(
        &self,
        id: &ConversationId,
        rel: &str,
    ) -> SyncResult<Option<CachedHash>> {
        let path = self.file_path(id, rel)?;
        let hashed = tokio::task::spawn_blocking(move || -> io::Result<Option<CachedHash>> {
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            let modified = modified_of(&file.metadata()?);
            let (hash, size) = hash_reader(file)?;
            Ok(Some(CachedHash {
                hash,
                size,
                modified,
            }))
        })
        .await??;
        Ok(hashed)
    }

    /// Scans a conversation, reusing cached hashes whose `(mtime, size)` still
    /// match. With `force` every file is rehashed. `cache` is updated in place.
    pub async fn scan(
        &self,
        id: &ConversationId,
        cache: &mut BTreeMap<String, CachedHash>,
        force: bool,
    ) -> SyncResult<ScanResult> {
        let listed = self.list_files(id).await?;
        let mut result = ScanResult::default();
        let mut seen = BTreeMap::new();

        for file in listed {
            let cached = cache
                .get(&file.path)
                .filter(|c| !force && c.size == file.size && c.modified == file.modified)
                .cloned();
            let current = match cached {
                Some(c) => c,
                None => match self.hash_file(id, &file.path).await? {
                    Some(fresh) => fresh,
                    // Removed between listing and hashing.
                    None => continue,
                },
            };
            if cache.get(&file.path).map(|c| &c.hash) != Some(&current.hash) {
                debug!("{}/{} changed", id, file.path);
                result.changed = true;
            }
            seen.insert(file.path, current);
        }

        if cache.keys().any(|path| !seen.contains_key(path)) {
            result.changed = true;
        }

        result.newest = seen.values().map(|c| c.modified).max().unwrap_or_default();
        result.oldest = seen.values().map(|c| c.modified).min().unwrap_or_default();
        result.files = seen.iter().map(|(p, c)| (p.clone(), c.entry())).collect();
        *cache = seen;
        Ok(result)
    }

    pub async fn read_file(&self, id: &ConversationId, rel: &str) -> SyncResult<Vec<u8>> {
        let path = self.file_path(id, rel)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(format!("{id}/{rel}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a file atomically: temp file in the same directory, fsync,
    /// rename over the target.
    pub async fn write_file(
        &self,
        id: &ConversationId,
        rel: &str,
        bytes: &[u8],
    ) -> SyncResult<LocalFile> {
        let path = self.file_path(id, rel)?;
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::invalid_path(rel, "no parent directory"))?;
        fs::create_dir_all(parent).await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = parent.join(format!(
            ".{name}{TEMP_MARKER}{}",
            uuid::Uuid::new_v4().simple()
        ));

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let metadata = fs::metadata(&path).await?;
        Ok(LocalFile {
            path: rel.to_string(),
            size: metadata.len(),
            modified: modified_of(&metadata),
        })
    }

    /// Deletes a file and any directories left empty by it, up to and
    /// including the conversation directory. Missing files are fine.
    pub async fn delete_file(&self, id: &ConversationId, rel: &str) -> SyncResult<()> {
        let path = self.file_path(id, rel)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let stop = self.root.clone();
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == stop || !current.starts_with(&stop) {
                break;
            }
            // Fails (and stops) once a directory still has entries.
            if fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Removes a conversation directory and everything in it.
    pub async fn remove_conversation(&self, id: &ConversationId) -> SyncResult<()> {
        match fs::remove_dir_all(self.conversation_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn conversation_exists(&self, id: &ConversationId) -> bool {
        fs::metadata(self.conversation_dir(id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

fn modified_of(metadata: &std::fs::Metadata) -> Timestamp {
    metadata
        .modified()
        .map(Timestamp::from_system_time)
        .unwrap_or_default()
}
