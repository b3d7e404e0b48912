//! Key derivation and key wrapping.
//!
//! - Handshake: X25519 shared secret + SHA-256 transcript -> HKDF-SHA256 ->
//!   20-byte confirmation tag and 32-byte key-wrapping key.
//! - Key unwrap: XChaCha20-Poly1305 over the 16-byte content key, with the
//!   wrapped-key header and key id as associated data.
//! - Stream keys: SHA-512 over `"AirPlayStreamKey<id>" || content_key` and
//!   `"AirPlayStreamIV<id>" || content_key`, first 16 bytes each.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::FairPlayError;
use crate::wire::{
    CONFIRMATION_LEN, CONTENT_KEY_LEN, HANDSHAKE_REQUEST_LEN, SETUP_REQUEST_LEN,
    SETUP_RESPONSE_LEN, WRAPPED_KEY_LEN, handshake_request, setup_response, wrapped_key,
};

const SETUP_SIGNATURE_CONTEXT: &[u8] = b"fpmirror-setup-v1";
const HANDSHAKE_SIGNATURE_CONTEXT: &[u8] = b"fpmirror-handshake-v1";
const TRANSCRIPT_CONTEXT: &[u8] = b"fpmirror-transcript-v1";
const HKDF_INFO_CONFIRM: &[u8] = b"fpmirror-handshake-confirm-v1";
const HKDF_INFO_KEY_WRAP: &[u8] = b"fpmirror-key-wrap-v1";

const STREAM_KEY_PREFIX: &str = "AirPlayStreamKey";
const STREAM_IV_PREFIX: &str = "AirPlayStreamIV";

/// A 16-byte content key recovered from a wrapped key blob.
///
/// Zeroised on drop and never printed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; CONTENT_KEY_LEN]);

impl ContentKey {
    pub const fn from_bytes(bytes: [u8; CONTENT_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; CONTENT_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for ContentKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for ContentKey {}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey([REDACTED])")
    }
}

/// Keys established by a successful handshake.
pub struct SessionKeys {
    pub confirmation: [u8; CONFIRMATION_LEN],
    pub wrap_key: Zeroizing<[u8; 32]>,
}

/// Bytes the receiver signs in its setup response.
pub fn setup_signing_message(
    request: &[u8; SETUP_REQUEST_LEN],
    response: &[u8; SETUP_RESPONSE_LEN],
) -> Vec<u8> {
    let signed = &response[setup_response::SIGNED];
    let capacity = SETUP_SIGNATURE_CONTEXT.len() + SETUP_REQUEST_LEN + signed.len();
    let mut message = Vec::with_capacity(capacity);
    message.extend_from_slice(SETUP_SIGNATURE_CONTEXT);
    message.extend_from_slice(request);
    message.extend_from_slice(signed);
    message
}

/// Bytes the sender signs in its handshake request.
pub fn handshake_signing_message(
    setup_request: &[u8; SETUP_REQUEST_LEN],
    setup_response: &[u8; SETUP_RESPONSE_LEN],
    request: &[u8; HANDSHAKE_REQUEST_LEN],
) -> Vec<u8> {
    let signed = &request[handshake_request::SIGNED];
    let mut message = Vec::with_capacity(
        HANDSHAKE_SIGNATURE_CONTEXT.len() + SETUP_REQUEST_LEN + SETUP_RESPONSE_LEN + signed.len(),
    );
    message.extend_from_slice(HANDSHAKE_SIGNATURE_CONTEXT);
    message.extend_from_slice(setup_request);
    message.extend_from_slice(setup_response);
    message.extend_from_slice(signed);
    message
}

/// SHA-256 over every byte exchanged during setup and handshake.
pub fn transcript_hash(
    setup_request: &[u8; SETUP_REQUEST_LEN],
    setup_response: &[u8; SETUP_RESPONSE_LEN],
    handshake_request: &[u8; HANDSHAKE_REQUEST_LEN],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_CONTEXT);
    hasher.update(setup_request);
    hasher.update(setup_response);
    hasher.update(handshake_request);
    hasher.finalize().into()
}

/// Derive the confirmation tag and key-wrapping key.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    transcript: &[u8; 32],
) -> Result<SessionKeys, FairPlayError> {
    let hk = Hkdf::<Sha256>::new(Some(transcript.as_slice()), shared_secret);

    let mut confirmation = [0u8; CONFIRMATION_LEN];
    hk.expand(HKDF_INFO_CONFIRM, &mut confirmation)
        .map_err(|e| FairPlayError::CryptoFailure(format!("confirmation derivation: {e}")))?;

    let mut wrap_key = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO_KEY_WRAP, &mut *wrap_key)
        .map_err(|e| FairPlayError::CryptoFailure(format!("key-wrap derivation: {e}")))?;

    Ok(SessionKeys {
        confirmation,
        wrap_key,
    })
}

/// Recover the content key from a 72-byte wrapped key blob.
///
/// The caller is responsible for checking the header first.
pub fn unwrap_content_key(
    wrap_key: &[u8; 32],
    wrapped: &[u8; WRAPPED_KEY_LEN],
) -> Result<ContentKey, FairPlayError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(wrap_key));
    let nonce = XNonce::from_slice(&wrapped[wrapped_key::NONCE]);
    let payload = Payload {
        msg: &wrapped[wrapped_key::SEALED],
        aad: &wrapped[wrapped_key::ASSOCIATED_DATA],
    };

    let plaintext = cipher
        .decrypt(nonce, payload)
        .map(Zeroizing::new)
        .map_err(|_| FairPlayError::CryptoFailure("wrapped key failed authentication".into()))?;
    let key = <[u8; CONTENT_KEY_LEN]>::try_from(plaintext.as_slice()).map_err(|_| {
        FairPlayError::CryptoFailure(format!(
            "unwrapped key has {} bytes, expected {CONTENT_KEY_LEN}",
            plaintext.len()
        ))
    })?;
    Ok(ContentKey(key))
}

/// Seal a content key into a 72-byte blob. Sender-side counterpart of
/// [`unwrap_content_key`].
#[cfg(any(test, feature = "test-utils"))]
pub fn wrap_content_key(
    wrap_key: &[u8; 32],
    key_id: u32,
    content_key: &ContentKey,
    nonce: &[u8; crate::wire::WRAP_NONCE_LEN],
) -> Result<[u8; WRAPPED_KEY_LEN], FairPlayError> {
    use crate::wire::{MessageKind, encode_header};

    let mut blob = [0u8; WRAPPED_KEY_LEN];
    blob[..crate::wire::HEADER_LEN].copy_from_slice(&encode_header(MessageKind::WrappedKey));
    blob[wrapped_key::KEY_ID].copy_from_slice(&key_id.to_be_bytes());
    blob[wrapped_key::NONCE].copy_from_slice(nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(wrap_key));
    let sealed = cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: content_key.as_bytes(),
                aad: &blob[wrapped_key::ASSOCIATED_DATA],
            },
        )
        .map_err(|e| FairPlayError::CryptoFailure(format!("key wrap failed: {e}")))?;
    blob[wrapped_key::SEALED].copy_from_slice(&sealed);
    Ok(blob)
}

/// Derive the AES-128-CTR key and IV for one mirrored stream.
pub fn stream_key_iv(
    content_key: &[u8; CONTENT_KEY_LEN],
    stream_connection_id: u64,
) -> (Zeroizing<[u8; 16]>, [u8; 16]) {
    let key = sha512_prefix(STREAM_KEY_PREFIX, stream_connection_id, content_key);
    let iv = sha512_prefix(STREAM_IV_PREFIX, stream_connection_id, content_key);
    (Zeroizing::new(key), iv)
}

fn sha512_prefix(label: &str, stream_connection_id: u64, content_key: &[u8]) -> [u8; 16] {
    let mut hasher = Sha512::new();
    hasher.update(format!("{label}{stream_connection_id}").as_bytes());
    hasher.update(content_key);
    let mut digest = hasher.finalize();

    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    digest.as_mut_slice().zeroize();
    out
}
