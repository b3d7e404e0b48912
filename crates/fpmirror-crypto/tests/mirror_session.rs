#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end mirroring session: pairing, key unwrap, then stream decryption.

use fpmirror_core::MemorySink;
use fpmirror_core::config::load_config;
use fpmirror_crypto::{
    ContentKey, ErrorKind, FairPlayError, HandshakeEngine, ReceiverIdentity, SenderHarness,
    SessionState, StreamDecryptor, encrypt_stream, perform_handshake,
};

/// Pair a fresh engine with a fresh sender.
fn paired() -> (HandshakeEngine, SenderHarness) {
    let mut engine = HandshakeEngine::new(ReceiverIdentity::generate());
    let mut sender = SenderHarness::new();
    perform_handshake(&mut engine, &mut sender).unwrap();
    (engine, sender)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[test]
fn zero_setup_request_pairs_and_decrypts_stream() {
    let mut engine = HandshakeEngine::new(ReceiverIdentity::generate());
    let mut sender = SenderHarness::new().with_setup_request([0u8; 16]);
    engine.init().unwrap();

    let r1 = engine.setup(&[0u8; 16]).unwrap();
    assert_eq!(r1.len(), 142);

    let request = sender.handshake_request(&r1).unwrap();
    assert_eq!(request.len(), 164);
    let r2 = engine.handshake(&request).unwrap();
    assert_eq!(r2.len(), 32);
    assert_eq!(engine.state(), SessionState::Ready);
    sender.verify_confirmation(&r2).unwrap();

    let sent_key = ContentKey::from_bytes(*b"content-key-0001");
    let wrapped = sender.wrap_key(&sent_key).unwrap();
    assert_eq!(wrapped.len(), 72);
    let key = engine.decrypt_key(&wrapped).unwrap();
    assert_eq!(key.as_bytes().len(), 16);
    assert_eq!(key, sent_key);

    let plaintext = payload(188);
    let ciphertext = encrypt_stream(key.as_bytes(), 1, &plaintext);

    let mut whole = StreamDecryptor::new(key.as_bytes()).unwrap();
    whole.init_stream(1).unwrap();
    let single = whole.decrypt(&ciphertext).unwrap();
    assert_eq!(single.len(), 188);
    assert_eq!(single, plaintext);

    let mut split = StreamDecryptor::from_content_key(&key);
    split.init_stream(1).unwrap();
    let mut joined = split.decrypt(&ciphertext[..100]).unwrap();
    joined.extend(split.decrypt(&ciphertext[100..]).unwrap());
    assert_eq!(joined, single);
}

#[test]
fn short_setup_is_rejected_without_side_effects() {
    let mut engine = HandshakeEngine::new(ReceiverIdentity::generate());
    engine.init().unwrap();

    let err = engine.setup(&[0u8; 15]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(matches!(
        err,
        FairPlayError::InvalidInput {
            expected: 16,
            actual: 15,
            ..
        }
    ));
    assert_eq!(engine.state(), SessionState::AwaitingHandshake);
    assert!(!engine.setup_pending());

    assert_eq!(engine.setup(&[0u8; 16]).unwrap().len(), 142);
    assert!(engine.setup_pending());
}

#[test]
fn one_content_key_serves_several_streams() {
    let (mut engine, mut sender) = paired();
    let wrapped = sender.wrap_key(&ContentKey::from_bytes([0x5a; 16])).unwrap();
    let key = engine.decrypt_key(&wrapped).unwrap();

    let plaintext = payload(1024);
    let mut decryptor = StreamDecryptor::from_content_key(&key);
    for stream_id in [1u64, 2, 0xdead_beef] {
        let ciphertext = encrypt_stream(key.as_bytes(), stream_id, &plaintext);
        decryptor.init_stream(stream_id).unwrap();
        let mut out = Vec::new();
        for chunk in ciphertext.chunks(188) {
            out.extend(decryptor.decrypt(chunk).unwrap());
        }
        assert_eq!(out, plaintext, "stream {stream_id}");
    }
}

#[test]
fn destroyed_engine_refuses_further_work_but_keys_stay_valid() {
    let (mut engine, mut sender) = paired();
    let first = sender.wrap_key(&ContentKey::from_bytes([1u8; 16])).unwrap();
    let key = engine.decrypt_key(&first).unwrap();
    engine.destroy();

    let wrapped = sender.wrap_key(&ContentKey::from_bytes([2u8; 16])).unwrap();
    assert!(matches!(engine.decrypt_key(&wrapped), Err(FairPlayError::Destroyed)));

    // A decryptor owns its own copy of the key.
    let mut decryptor = StreamDecryptor::from_content_key(&key);
    decryptor.init_stream(4).unwrap();
    let ciphertext = encrypt_stream(key.as_bytes(), 4, b"frame");
    assert_eq!(decryptor.decrypt(&ciphertext).unwrap(), b"frame");
}

#[test]
fn engine_from_settings_file_enforces_allowlist() {
    let dir = tempfile::TempDir::new().unwrap();
    let key_path = dir.path().join("identity.key");
    ReceiverIdentity::generate().save_to_file(&key_path).unwrap();

    let mut trusted = SenderHarness::new();
    let settings = settings_json(&key_path, &hex::encode(trusted.identity_public()));
    let settings_path = dir.path().join("settings.json");
    std::fs::write(&settings_path, settings).unwrap();

    let config = load_config(Some(&settings_path)).unwrap();
    let sink = MemorySink::new();

    let mut engine = HandshakeEngine::from_config(&config.handshake)
        .unwrap()
        .with_sink(sink.clone());
    perform_handshake(&mut engine, &mut trusted).unwrap();
    assert!(sink.contains("handshake complete"));

    let mut engine = HandshakeEngine::from_config(&config.handshake).unwrap();
    let mut stranger = SenderHarness::new();
    let err = perform_handshake(&mut engine, &mut stranger).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Crypto);
    assert_eq!(engine.state(), SessionState::Failed);
}

fn settings_json(key_path: &std::path::Path, trusted_hex: &str) -> String {
    serde_json::json!({
        "handshake": {
            "max_unwrap_failures": 4,
            "trusted_senders": [trusted_hex],
            "identity_key_path": key_path,
        }
    })
    .to_string()
}
