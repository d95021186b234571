//! Content fingerprints.
//!
//! MD5 is used as a change detector and transfer checksum, not as a
//! security boundary; integrity against tampering comes from the AEAD.

use convsync_types::{ContentHash, CONTENT_HASH_BYTES};
use md5::{Digest, Md5};
use std::io::{self, Read};

const READ_CHUNK: usize = 64 * 1024;

/// Hashes a byte slice.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Incremental hasher for content that arrives in chunks.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Md5,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> ContentHash {
        let mut digest = [0u8; CONTENT_HASH_BYTES];
        digest.copy_from_slice(&self.inner.finalize());
        ContentHash::from_digest(digest)
    }
}

/// Streams a reader through the hasher, returning the digest and byte count.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(ContentHash, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    let len = hasher.len();
    Ok((hasher.finalize(), len))
}
