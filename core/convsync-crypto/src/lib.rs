//! Content hashing and encryption layer for convsync.
//!
//! Everything the remote store sees passes through this crate:
//!
//! - **Hash**: MD5 fingerprints of file bytes, used for change detection and
//!   for verifying downloads after decryption.
//! - **Key**: Argon2id derivation of 256-bit keys from the user's passphrase.
//! - **Cipher**: ChaCha20-Poly1305 AEAD with random nonces.
//! - **Envelope**: the self-describing blob format (KDF parameters, salt,
//!   nonce, ciphertext) written to the remote store.
//! - **Codec**: the `BlobCodec` seam the sync engine encrypts through.

mod cipher;
mod codec;
mod envelope;
mod error;
mod hash;
mod key;

pub use cipher::{open, random_nonce, seal, NONCE_SIZE, TAG_SIZE};
pub use codec::{BlobCodec, PassphraseCodec, PassthroughCodec, DEFAULT_OPEN_COST_FACTOR};
pub use envelope::{
    decrypt, encrypt, open_with_key, read_header, seal_with_key, EnvelopeHeader, ENVELOPE_MAGIC,
    ENVELOPE_VERSION, HEADER_SIZE,
};
pub use error::{CryptoError, CryptoResult};
pub use hash::{content_hash, hash_reader, ContentHasher};
pub use key::{derive_key, DerivedKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
