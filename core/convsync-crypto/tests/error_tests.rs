use convsync_crypto::CryptoError;

#[test]
fn error_display_key_derivation() {
    let err = CryptoError::KeyDerivation("bad params".into());
    assert!(format!("{err}").contains("key derivation failed"));
    assert!(format!("{err}").contains("bad params"));
}

#[test]
fn error_display_authentication() {
    let err = CryptoError::Authentication;
    assert!(format!("{err}").contains("wrong passphrase"));
    assert!(err.is_authentication());
}

#[test]
fn invalid_envelope_is_not_authentication() {
    let err = CryptoError::InvalidEnvelope("short".into());
    assert!(!err.is_authentication());
    assert!(format!("{err}").contains("short"));
}

#[test]
fn error_display_unsupported_version() {
    let err = CryptoError::UnsupportedVersion(7);
    assert!(format!("{err}").contains('7'));
}
