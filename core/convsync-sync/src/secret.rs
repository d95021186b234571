//! Storage for the sync passphrase.
//!
//! The passphrase never leaves the machine. Hosts plug in their platform
//! keychain through `SecretStore`; the two implementations here cover tests
//! and the command-line front end.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Holds the master passphrase.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the stored passphrase, if one has been set.
    async fn get_secret(&self) -> SyncResult<Option<String>>;

    /// Replaces the stored passphrase.
    async fn set_secret(&self, secret: &str) -> SyncResult<()>;
}

/// Keeps the passphrase in process memory only.
#[derive(Default)]
pub struct MemorySecretStore {
    secret: RwLock<Option<Zeroizing<String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: &str) -> Self {
        Self {
            secret: RwLock::new(Some(Zeroizing::new(secret.to_string()))),
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self) -> SyncResult<Option<String>> {
        Ok(self.secret.read().await.as_ref().map(|s| s.to_string()))
    }

    async fn set_secret(&self, secret: &str) -> SyncResult<()> {
        *self.secret.write().await = Some(Zeroizing::new(secret.to_string()));
        Ok(())
    }
}

/// Keeps the passphrase in a file readable only by the owner.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self) -> SyncResult<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let raw = Zeroizing::new(raw);
                let secret = raw.trim_end_matches(['\r', '\n']);
                Ok((!secret.is_empty()).then(|| secret.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Storage(format!(
                "failed to read secret file {:?}: {e}",
                self.path
            ))),
        }
    }

    async fn set_secret(&self, secret: &str) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, secret.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
