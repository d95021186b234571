//! Fixed-length content digests.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of a raw digest in bytes (MD5).
pub const CONTENT_HASH_BYTES: usize = 16;

/// Length of a digest rendered as lowercase hex.
pub const CONTENT_HASH_LEN: usize = CONTENT_HASH_BYTES * 2;

/// Lowercase hex digest of a file's bytes.
///
/// Used both for change detection and for verifying downloaded content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Builds a hash from raw digest bytes.
    #[must_use]
    pub fn from_digest(digest: [u8; CONTENT_HASH_BYTES]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parses a hex digest. Uppercase input is normalized to lowercase.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.len() != CONTENT_HASH_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}
