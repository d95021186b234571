use convsync_crypto::{
    encrypt, read_header, BlobCodec, CryptoError, KdfParams, PassphraseCodec, PassthroughCodec,
    DEFAULT_OPEN_COST_FACTOR,
};
use std::sync::Arc;

fn fast_params() -> KdfParams {
    KdfParams {
        memory_cost: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

#[test]
fn passphrase_codec_roundtrip() {
    let codec = PassphraseCodec::new("pw", fast_params()).unwrap();
    let sealed = codec.seal(b"hello world").unwrap();
    assert_ne!(sealed, b"hello world");
    assert_eq!(codec.open(&sealed).unwrap(), b"hello world");
}

#[test]
fn codec_reuses_one_salt_per_instance() {
    let codec = PassphraseCodec::new("pw", fast_params()).unwrap();
    let a = read_header(&codec.seal(b"a").unwrap()).unwrap();
    let b = read_header(&codec.seal(b"b").unwrap()).unwrap();
    assert_eq!(a.salt, b.salt);
    assert_ne!(a.nonce, b.nonce);
}

#[test]
fn separate_instances_use_different_salts() {
    let one = PassphraseCodec::new("pw", fast_params()).unwrap();
    let two = PassphraseCodec::new("pw", fast_params()).unwrap();
    let a = read_header(&one.seal(b"a").unwrap()).unwrap();
    let b = read_header(&two.seal(b"a").unwrap()).unwrap();
    assert_ne!(a.salt, b.salt);
}

#[test]
fn codec_opens_blobs_from_other_sessions() {
    let earlier = PassphraseCodec::new("pw", fast_params()).unwrap();
    let sealed = earlier.seal(b"from yesterday").unwrap();

    let today = PassphraseCodec::new("pw", fast_params()).unwrap();
    assert_eq!(today.open(&sealed).unwrap(), b"from yesterday");
    // second open hits the key cache
    assert_eq!(today.open(&sealed).unwrap(), b"from yesterday");
}

#[test]
fn codec_opens_plain_encrypt_output() {
    let sealed = encrypt(b"interop", "pw", &fast_params()).unwrap();
    let codec = PassphraseCodec::new("pw", fast_params()).unwrap();
    assert_eq!(codec.open(&sealed).unwrap(), b"interop");
}

#[test]
fn codec_refuses_envelopes_above_its_open_limit() {
    let costly = KdfParams {
        memory_cost: 8 * 1024,
        ..fast_params()
    };
    let sealed = encrypt(b"expensive", "pw", &costly).unwrap();

    let codec = PassphraseCodec::new("pw", fast_params()).unwrap();
    assert!(matches!(
        codec.open(&sealed),
        Err(CryptoError::InvalidEnvelope(_))
    ));

    let lenient = PassphraseCodec::new("pw", fast_params())
        .unwrap()
        .with_open_limit(fast_params().scaled(8));
    assert_eq!(lenient.open(&sealed).unwrap(), b"expensive");
}

#[test]
fn scaled_params_bound_each_cost() {
    let limit = fast_params().scaled(DEFAULT_OPEN_COST_FACTOR);
    assert_eq!(limit.memory_cost, 4096);
    assert!(fast_params().fits_within(&limit));
    let too_many_passes = KdfParams {
        time_cost: 5,
        ..fast_params()
    };
    assert!(!too_many_passes.fits_within(&limit));
}

#[test]
fn codec_with_wrong_passphrase_fails_authentication() {
    let sealed = PassphraseCodec::new("right", fast_params())
        .unwrap()
        .seal(b"x")
        .unwrap();
    let other = PassphraseCodec::new("wrong", fast_params()).unwrap();
    assert!(matches!(other.open(&sealed), Err(CryptoError::Authentication)));
}

#[test]
fn codec_rejects_empty_passphrase() {
    assert!(matches!(
        PassphraseCodec::new("", fast_params()),
        Err(CryptoError::EmptyPassphrase)
    ));
}

#[test]
fn debug_output_redacts_passphrase() {
    let codec = PassphraseCodec::new("super-secret-passphrase", fast_params()).unwrap();
    let debug = format!("{codec:?}");
    assert!(!debug.contains("super-secret-passphrase"));
    assert!(debug.contains("REDACTED"));
}

#[test]
fn passthrough_is_identity() {
    let codec = PassthroughCodec;
    assert_eq!(codec.seal(b"abc").unwrap(), b"abc");
    assert_eq!(codec.open(b"abc").unwrap(), b"abc");
}

#[test]
fn arc_codec_delegates() {
    let codec: Arc<dyn BlobCodec> = Arc::new(PassthroughCodec);
    assert_eq!(codec.open(&codec.seal(b"z").unwrap()).unwrap(), b"z");
}
