//! Sender-side counterpart of the protocol, for tests only.
//!
//! Production code never plays the sender. This harness builds the messages
//! a real sender would, so the engine can be driven end to end.

use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::FairPlayError;
use crate::handshake::HandshakeEngine;
use crate::identity::verify_signature;
use crate::keys::{
    ContentKey, derive_session_keys, handshake_signing_message, setup_signing_message,
    transcript_hash, wrap_content_key,
};
use crate::stream::Aes128Ctr;
use crate::wire::{
    self, CONFIRMATION_LEN, HANDSHAKE_REQUEST_LEN, HANDSHAKE_RESPONSE_LEN, HEADER_LEN,
    MessageKind, PUBLIC_KEY_LEN, SETUP_REQUEST_LEN, SETUP_RESPONSE_LEN, SIGNATURE_LEN,
    WRAP_NONCE_LEN, handshake_request, handshake_response, setup_response,
};

/// Plays the sender through setup, handshake and key wrapping.
pub struct SenderHarness {
    signing: SigningKey,
    ephemeral: StaticSecret,
    ephemeral_override: Option<[u8; PUBLIC_KEY_LEN]>,
    setup_request: [u8; SETUP_REQUEST_LEN],
    confirmation: Option<[u8; CONFIRMATION_LEN]>,
    wrap_key: Option<Zeroizing<[u8; 32]>>,
    next_key_id: u32,
}

impl Default for SenderHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderHarness {
    /// A sender with fresh identity and ephemeral keys and a random setup
    /// request.
    pub fn new() -> Self {
        let mut setup_request = [0u8; SETUP_REQUEST_LEN];
        OsRng.fill_bytes(&mut setup_request);
        setup_request[..4].copy_from_slice(&wire::MAGIC);
        Self {
            signing: SigningKey::generate(&mut OsRng),
            ephemeral: StaticSecret::random_from_rng(OsRng),
            ephemeral_override: None,
            setup_request,
            confirmation: None,
            wrap_key: None,
            next_key_id: 0,
        }
    }

    /// Open the exchange with `setup_request` instead of the random one.
    #[must_use]
    pub const fn with_setup_request(mut self, setup_request: [u8; SETUP_REQUEST_LEN]) -> Self {
        self.setup_request = setup_request;
        self
    }

    /// Advertise `public` instead of the real ephemeral key.
    #[must_use]
    pub const fn with_ephemeral_public(mut self, public: [u8; PUBLIC_KEY_LEN]) -> Self {
        self.ephemeral_override = Some(public);
        self
    }

    pub const fn setup_request(&self) -> [u8; SETUP_REQUEST_LEN] {
        self.setup_request
    }

    pub fn identity_public(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Verify the receiver's setup response and build the handshake request.
    pub fn handshake_request(
        &mut self,
        setup_response_msg: &[u8; SETUP_RESPONSE_LEN],
    ) -> Result<[u8; HANDSHAKE_REQUEST_LEN], FairPlayError> {
        wire::check_header(setup_response_msg, MessageKind::SetupResponse)?;
        let receiver_identity: [u8; PUBLIC_KEY_LEN] =
            wire::field(setup_response_msg, setup_response::RECEIVER_IDENTITY)?;
        let receiver_signature: [u8; SIGNATURE_LEN] =
            wire::field(setup_response_msg, setup_response::SIGNATURE)?;
        verify_signature(
            &receiver_identity,
            &setup_signing_message(&self.setup_request, setup_response_msg),
            &receiver_signature,
        )?;

        let ephemeral_public = self
            .ephemeral_override
            .unwrap_or_else(|| PublicKey::from(&self.ephemeral).to_bytes());
        let mut nonce = [0u8; wire::SENDER_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut request = [0u8; HANDSHAKE_REQUEST_LEN];
        request[..HEADER_LEN].copy_from_slice(&wire::encode_header(MessageKind::HandshakeRequest));
        request[handshake_request::SENDER_EPHEMERAL].copy_from_slice(&ephemeral_public);
        request[handshake_request::SENDER_IDENTITY].copy_from_slice(&self.identity_public());
        request[handshake_request::SENDER_NONCE].copy_from_slice(&nonce);
        let signature = self.signing.sign(&handshake_signing_message(
            &self.setup_request,
            setup_response_msg,
            &request,
        ));
        request[handshake_request::SIGNATURE].copy_from_slice(&signature.to_bytes());

        let receiver_ephemeral: [u8; PUBLIC_KEY_LEN] =
            wire::field(setup_response_msg, setup_response::RECEIVER_EPHEMERAL)?;
        let shared = self
            .ephemeral
            .diffie_hellman(&PublicKey::from(receiver_ephemeral));
        let transcript = transcript_hash(&self.setup_request, setup_response_msg, &request);
        let keys = derive_session_keys(shared.as_bytes(), &transcript)?;
        self.confirmation = Some(keys.confirmation);
        self.wrap_key = Some(keys.wrap_key);

        Ok(request)
    }

    /// Check the receiver's confirmation against our own derivation.
    pub fn verify_confirmation(
        &self,
        response: &[u8; HANDSHAKE_RESPONSE_LEN],
    ) -> Result<(), FairPlayError> {
        wire::check_header(response, MessageKind::HandshakeResponse)?;
        let expected = self.confirmation.ok_or(FairPlayError::NotInitialized)?;
        let confirmed = response[handshake_response::CONFIRMATION].ct_eq(expected.as_slice());
        if bool::from(confirmed) {
            Ok(())
        } else {
            Err(FairPlayError::CryptoFailure(
                "handshake confirmation mismatch".to_string(),
            ))
        }
    }

    /// Wrap `content_key` for the paired receiver, using the next key id.
    pub fn wrap_key(&mut self, content_key: &ContentKey) -> Result<[u8; 72], FairPlayError> {
        let wrap_key = self.wrap_key.as_ref().ok_or(FairPlayError::NotInitialized)?;
        let mut nonce = [0u8; WRAP_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let blob = wrap_content_key(wrap_key, self.next_key_id, content_key, &nonce)?;
        self.next_key_id += 1;
        Ok(blob)
    }
}

/// Drive `engine` through init, setup and handshake against `sender`.
pub fn perform_handshake(
    engine: &mut HandshakeEngine,
    sender: &mut SenderHarness,
) -> Result<(), FairPlayError> {
    engine.init()?;
    let setup = engine.setup(&sender.setup_request())?;
    let request = sender.handshake_request(&setup)?;
    let response = engine.handshake(&request)?;
    sender.verify_confirmation(&response)
}

/// Encrypt a stream payload the way a sender would.
pub fn encrypt_stream(
    content_key: &[u8; 16],
    stream_connection_id: u64,
    plaintext: &[u8],
) -> Vec<u8> {
    let (key, iv) = crate::keys::stream_key_iv(content_key, stream_connection_id);
    let mut cipher = Aes128Ctr::new((&*key).into(), (&iv).into());
    let mut out = plaintext.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::ReceiverIdentity;

    #[test]
    fn harness_pairs_with_engine() {
        let mut engine = HandshakeEngine::new(ReceiverIdentity::generate());
        let mut sender = SenderHarness::new();
        perform_handshake(&mut engine, &mut sender).unwrap();

        let key = ContentKey::from_bytes([9u8; 16]);
        let wrapped = sender.wrap_key(&key).unwrap();
        assert_eq!(engine.decrypt_key(&wrapped).unwrap(), key);
    }

    #[test]
    fn harness_rejects_forged_setup_response() {
        let mut engine = HandshakeEngine::new(ReceiverIdentity::generate());
        let mut sender = SenderHarness::new();
        engine.init().unwrap();
        let mut setup = engine.setup(&sender.setup_request()).unwrap();
        setup[setup_response::RECEIVER_EPHEMERAL.start] ^= 1;
        assert!(sender.handshake_request(&setup).is_err());
    }

    #[test]
    fn wrap_before_handshake_fails() {
        let mut sender = SenderHarness::new();
        assert!(sender.wrap_key(&ContentKey::from_bytes([0u8; 16])).is_err());
    }
}
