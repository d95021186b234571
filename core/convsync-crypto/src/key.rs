//! Key derivation and management.
//!
//! Uses Argon2id for deriving encryption keys from the user's passphrase.
//! The passphrase itself never leaves the machine; only the salt and the
//! KDF parameters are stored next to each ciphertext.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of encryption keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// Size of salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Upper bounds accepted when reading parameters from an envelope, so a
/// forged header cannot make us allocate unbounded memory.
const MAX_MEMORY_COST_KIB: u32 = 1024 * 1024;
const MAX_TIME_COST: u32 = 64;
const MAX_PARALLELISM: u32 = 64;

/// A derived encryption key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Salt for key derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Salt {
    bytes: [u8; SALT_SIZE],
}

impl Salt {
    /// Generates a random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a salt from raw bytes.
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.bytes
    }
}

/// Argon2id cost parameters.
///
/// Stored in every envelope, so blobs written with older parameters stay
/// readable after the defaults change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Time cost (iterations).
    pub time_cost: u32,
    /// Parallelism factor.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP recommendation for Argon2id (2023)
        Self {
            memory_cost: 19 * 1024, // 19 MiB
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Rejects parameters Argon2 would refuse or that exceed sane bounds.
    pub fn validate(&self) -> CryptoResult<()> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(CryptoError::KeyDerivation(format!(
                "parallelism {} out of range",
                self.parallelism
            )));
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(CryptoError::KeyDerivation(format!(
                "time cost {} out of range",
                self.time_cost
            )));
        }
        if self.memory_cost < 8 * self.parallelism || self.memory_cost > MAX_MEMORY_COST_KIB {
            return Err(CryptoError::KeyDerivation(format!(
                "memory cost {} KiB out of range",
                self.memory_cost
            )));
        }
        Ok(())
    }

    /// Each cost multiplied by `factor`, saturating.
    pub fn scaled(&self, factor: u32) -> Self {
        Self {
            memory_cost: self.memory_cost.saturating_mul(factor),
            time_cost: self.time_cost.saturating_mul(factor),
            parallelism: self.parallelism.saturating_mul(factor),
        }
    }

    /// True when no cost exceeds the matching cost in `limit`.
    pub fn fits_within(&self, limit: &KdfParams) -> bool {
        self.memory_cost <= limit.memory_cost
            && self.time_cost <= limit.time_cost
            && self.parallelism <= limit.parallelism
    }
}

/// Derives an encryption key from a passphrase using Argon2id.
///
/// Deliberately slow; callers on an async runtime should run this on a
/// blocking thread.
pub fn derive_key(passphrase: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    params.validate()?;

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key_bytes)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = DerivedKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}
