//! Self-describing encrypted blob format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "CVS1" | version u8 | memory_cost u32 | time_cost u32 | parallelism u32
//!   | salt [16] | nonce [12] | ciphertext + tag
//! ```
//!
//! Everything before the ciphertext is bound as associated data, so the KDF
//! parameters and salt cannot be swapped without failing authentication.

use crate::cipher::{self, NONCE_SIZE, TAG_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, DerivedKey, KdfParams, Salt, SALT_SIZE};

/// Leading bytes of every envelope.
pub const ENVELOPE_MAGIC: &[u8; 4] = b"CVS1";

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Size of the authenticated header preceding the ciphertext.
pub const HEADER_SIZE: usize = ENVELOPE_MAGIC.len() + 1 + 3 * 4 + SALT_SIZE + NONCE_SIZE;

/// Parsed envelope header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// KDF parameters the key was derived with.
    pub params: KdfParams,
    /// Salt the key was derived with.
    pub salt: Salt,
    /// Nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
}

impl EnvelopeHeader {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&self.params.memory_cost.to_le_bytes());
        out.extend_from_slice(&self.params.time_cost.to_le_bytes());
        out.extend_from_slice(&self.params.parallelism.to_le_bytes());
        out.extend_from_slice(self.salt.as_bytes());
        out.extend_from_slice(&self.nonce);
        out
    }

    fn decode(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidEnvelope(format!(
                "{} bytes is shorter than the minimum envelope",
                bytes.len()
            )));
        }
        if &bytes[..4] != ENVELOPE_MAGIC {
            return Err(CryptoError::InvalidEnvelope("bad magic".into()));
        }
        if bytes[4] != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(bytes[4]));
        }

        let read_u32 = |offset: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(buf)
        };
        let params = KdfParams {
            memory_cost: read_u32(5),
            time_cost: read_u32(9),
            parallelism: read_u32(13),
        };
        params
            .validate()
            .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[17..17 + SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[17 + SALT_SIZE..HEADER_SIZE]);

        Ok(Self {
            params,
            salt: Salt::from_bytes(salt),
            nonce,
        })
    }
}

/// Reads the header of an envelope without decrypting it.
pub fn read_header(envelope: &[u8]) -> CryptoResult<EnvelopeHeader> {
    EnvelopeHeader::decode(envelope)
}

/// Encrypts with an already-derived key. `salt` and `params` must be the ones
/// `key` was derived from; they are recorded so `decrypt` can re-derive it.
pub fn seal_with_key(
    key: &DerivedKey,
    salt: &Salt,
    params: &KdfParams,
    plaintext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let nonce = cipher::random_nonce();
    let header = EnvelopeHeader {
        params: params.clone(),
        salt: *salt,
        nonce,
    }
    .encode();

    let ciphertext = cipher::seal(key, &nonce, &header, plaintext)?;

    let mut out = header;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts an envelope with an already-derived key.
pub fn open_with_key(key: &DerivedKey, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
    let header = EnvelopeHeader::decode(envelope)?;
    let (aad, ciphertext) = envelope.split_at(HEADER_SIZE);
    cipher::open(key, &header.nonce, aad, ciphertext)
}

/// Encrypts `plaintext` under `passphrase` with a fresh salt and nonce.
pub fn encrypt(plaintext: &[u8], passphrase: &str, params: &KdfParams) -> CryptoResult<Vec<u8>> {
    let salt = Salt::random();
    let key = derive_key(passphrase, &salt, params)?;
    seal_with_key(&key, &salt, params, plaintext)
}

/// Decrypts an envelope produced by `encrypt`, re-deriving the key from the
/// salt and parameters recorded in its header.
pub fn decrypt(envelope: &[u8], passphrase: &str) -> CryptoResult<Vec<u8>> {
    let header = EnvelopeHeader::decode(envelope)?;
    let key = derive_key(passphrase, &header.salt, &header.params)?;
    open_with_key(&key, envelope)
}
