//! Blob codecs used by the sync engine.
//!
//! The engine never calls `encrypt`/`decrypt` directly; it goes through a
//! `BlobCodec` so tests can run without paying for Argon2.

use crate::envelope::{open_with_key, read_header, seal_with_key};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, DerivedKey, KdfParams, Salt};
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// Seals and opens remote blobs.
pub trait BlobCodec: Send + Sync {
    /// Turns plaintext into the bytes written to the remote store.
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Recovers plaintext from bytes read from the remote store.
    fn open(&self, envelope: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// How far above the sealing parameters an envelope's KDF costs may go
/// before `open` refuses to derive a key for it.
pub const DEFAULT_OPEN_COST_FACTOR: u32 = 4;

/// Passphrase-keyed codec with a per-instance salt.
///
/// Construction derives the sealing key, which is slow; build one per sync
/// session on a blocking thread. Keys for other salts seen while opening are
/// derived once and cached.
pub struct PassphraseCodec {
    passphrase: Zeroizing<String>,
    params: KdfParams,
    open_limit: KdfParams,
    salt: Salt,
    key: DerivedKey,
    opened: Mutex<HashMap<(Salt, KdfParams), DerivedKey>>,
}

impl PassphraseCodec {
    pub fn new(passphrase: &str, params: KdfParams) -> CryptoResult<Self> {
        let salt = Salt::random();
        let key = derive_key(passphrase, &salt, &params)?;
        Ok(Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
            open_limit: params.scaled(DEFAULT_OPEN_COST_FACTOR),
            params,
            salt,
            key,
            opened: Mutex::new(HashMap::new()),
        })
    }

    /// Refuse to open envelopes whose KDF costs exceed `limit`.
    pub fn with_open_limit(mut self, limit: KdfParams) -> Self {
        self.open_limit = limit;
        self
    }

    /// KDF parameters new envelopes are sealed with.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    fn key_for(&self, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
        if salt == &self.salt && params == &self.params {
            return Ok(self.key.clone());
        }
        if !params.fits_within(&self.open_limit) {
            return Err(CryptoError::InvalidEnvelope(format!(
                "KDF parameters {params:?} exceed the limit {:?}",
                self.open_limit
            )));
        }
        {
            let cache = self.opened.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(key) = cache.get(&(*salt, params.clone())) {
                return Ok(key.clone());
            }
        }
        // Derive outside the lock; a duplicate derivation under a race is harmless.
        let key = derive_key(&self.passphrase, salt, params)?;
        self.opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((*salt, params.clone()), key.clone());
        Ok(key)
    }
}

impl std::fmt::Debug for PassphraseCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseCodec")
            .field("params", &self.params)
            .field("open_limit", &self.open_limit)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl BlobCodec for PassphraseCodec {
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        seal_with_key(&self.key, &self.salt, &self.params, plaintext)
    }

    fn open(&self, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
        let header = read_header(envelope)?;
        let key = self.key_for(&header.salt, &header.params)?;
        open_with_key(&key, envelope)
    }
}

/// Identity codec. Stores plaintext; for tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl BlobCodec for PassthroughCodec {
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(envelope.to_vec())
    }
}

impl<C: BlobCodec + ?Sized> BlobCodec for std::sync::Arc<C> {
    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        (**self).seal(plaintext)
    }

    fn open(&self, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
        (**self).open(envelope)
    }
}
