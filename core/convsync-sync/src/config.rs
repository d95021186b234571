//! Engine configuration.

use crate::error::{SyncError, SyncResult};
use crate::remote::{CONVERSATIONS_PREFIX, MANIFEST_KEY};
use convsync_crypto::{KdfParams, DEFAULT_OPEN_COST_FACTOR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the `failed_attempts`-th consecutive failure.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Human-readable machine name recorded in the manifest.
    pub machine_name: String,
    /// Directory holding one subdirectory per conversation.
    pub local_root: PathBuf,
    /// Upper bound on file transfers in flight across all conversations.
    pub max_concurrent_transfers: usize,
    /// Backoff for transient failures.
    pub retry: RetryPolicy,
    /// Argon2id parameters for newly sealed blobs.
    pub kdf: KdfParams,
    /// Envelopes asking for more than `kdf` times this factor are refused.
    pub kdf_open_factor: u32,
    /// Blob key of the encrypted manifest.
    pub manifest_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            machine_name: "convsync machine".to_string(),
            local_root: PathBuf::new(),
            max_concurrent_transfers: 4,
            retry: RetryPolicy::default(),
            kdf: KdfParams::default(),
            kdf_open_factor: DEFAULT_OPEN_COST_FACTOR,
            manifest_key: MANIFEST_KEY.to_string(),
        }
    }
}

impl SyncConfig {
    /// Default configuration rooted at `local_root`.
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            ..Self::default()
        }
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.local_root.as_os_str().is_empty() {
            return Err(SyncError::Config("local_root must be set".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(SyncError::Config(
                "max_concurrent_transfers must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.manifest_key.is_empty() || self.manifest_key.starts_with(CONVERSATIONS_PREFIX) {
            return Err(SyncError::Config(format!(
                "manifest_key {:?} is reserved or empty",
                self.manifest_key
            )));
        }
        if self.kdf_open_factor == 0 {
            return Err(SyncError::Config("kdf_open_factor must be at least 1".into()));
        }
        self.kdf
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))
    }
}
