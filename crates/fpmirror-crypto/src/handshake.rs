//! Pairing handshake engine.
//!
//! Two rounds authenticate the pairing and establish a key-wrapping key:
//!
//! 1. `setup` (16 -> 142 bytes): the receiver answers with a fresh X25519
//!    ephemeral key and its Ed25519 identity, signed over the request.
//! 2. `handshake` (164 -> 32 bytes): the sender answers with its own
//!    ephemeral and identity keys, signed over the whole setup exchange. The
//!    receiver verifies, runs ECDH, derives session keys from the transcript
//!    and returns a confirmation tag.
//!
//! Afterwards `decrypt_key` (72 -> 16 bytes) unwraps per-content keys.

use std::sync::Arc;

use fpmirror_core::{HandshakeConfig, LogSink, default_sink};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use tracing::Level;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::FairPlayError;
use crate::identity::{ReceiverIdentity, fingerprint_of, verify_signature};
use crate::keys::{
    ContentKey, derive_session_keys, handshake_signing_message, setup_signing_message,
    transcript_hash, unwrap_content_key,
};
use crate::wire::{
    self, HANDSHAKE_REQUEST_LEN, HANDSHAKE_RESPONSE_LEN, HEADER_LEN, MessageKind, PUBLIC_KEY_LEN,
    SETUP_REQUEST_LEN, SETUP_RESPONSE_LEN, SIGNATURE_LEN, SUITE_X25519_ED25519_XCHACHA,
    WRAPPED_KEY_LEN, handshake_request, handshake_response, setup_response, wrapped_key,
};

/// Externally visible lifecycle of a [`HandshakeEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    AwaitingHandshake,
    Ready,
    Failed,
    Destroyed,
}

/// Outcome of [`HandshakeEngine::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Initialized,
    AlreadyInitialized,
}

/// Material retained between `setup` and `handshake`.
struct PendingSetup {
    ephemeral_secret: StaticSecret,
    request: [u8; SETUP_REQUEST_LEN],
    response: [u8; SETUP_RESPONSE_LEN],
}

struct ReadySession {
    wrap_key: Zeroizing<[u8; 32]>,
    sender_fingerprint: String,
    consecutive_failures: u32,
    keys_issued: u64,
}

enum Phase {
    Uninitialized,
    Initialized { pending: Option<PendingSetup> },
    Ready(ReadySession),
    Failed,
    Destroyed,
}

/// Receiver side of the pairing protocol.
///
/// Not internally synchronised: every operation takes `&mut self`.
pub struct HandshakeEngine {
    identity: Option<ReceiverIdentity>,
    trusted_senders: Vec<[u8; PUBLIC_KEY_LEN]>,
    max_unwrap_failures: u32,
    phase: Phase,
    sink: Arc<dyn LogSink>,
    rng: Box<dyn RngCore + Send>,
}

impl std::fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("state", &self.state())
            .field("trusted_senders", &self.trusted_senders.len())
            .field("max_unwrap_failures", &self.max_unwrap_failures)
            .finish_non_exhaustive()
    }
}

impl HandshakeEngine {
    /// Create an uninitialised engine that accepts any sender able to sign
    /// its handshake.
    pub fn new(identity: ReceiverIdentity) -> Self {
        Self {
            identity: Some(identity),
            trusted_senders: Vec::new(),
            max_unwrap_failures: HandshakeConfig::default().max_unwrap_failures,
            phase: Phase::Uninitialized,
            sink: default_sink(),
            rng: Box::new(OsRng),
        }
    }

    /// Build an engine from configuration, loading the identity key file.
    pub fn from_config(config: &HandshakeConfig) -> Result<Self, FairPlayError> {
        config.validate()?;
        let path = config.identity_key_path.as_deref().ok_or_else(|| {
            fpmirror_core::Error::Config("handshake.identity_key_path is not set".to_string())
        })?;
        let identity = ReceiverIdentity::load_from_file(path)?;
        Ok(Self::new(identity)
            .with_trusted_senders(config.trusted_sender_keys()?)
            .with_max_unwrap_failures(config.max_unwrap_failures))
    }

    /// Restrict pairing to senders holding one of `keys`.
    #[must_use]
    pub fn with_trusted_senders(mut self, keys: Vec<[u8; PUBLIC_KEY_LEN]>) -> Self {
        self.trusted_senders = keys;
        self
    }

    /// Consecutive unwrap failures tolerated before the session fails.
    /// Clamped to at least 1.
    #[must_use]
    pub fn with_max_unwrap_failures(mut self, max: u32) -> Self {
        self.max_unwrap_failures = max.max(1);
        self
    }

    /// Route engine log lines to `sink` instead of `tracing`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Draw the init entropy check and ephemeral keys from `rng` instead of `OsRng`.
    #[must_use]
    pub fn with_rng<R>(mut self, rng: R) -> Self
    where
        R: RngCore + CryptoRng + Send + 'static,
    {
        self.rng = Box::new(rng);
        self
    }

    pub const fn state(&self) -> SessionState {
        match self.phase {
            Phase::Uninitialized => SessionState::Uninitialized,
            Phase::Initialized { .. } => SessionState::AwaitingHandshake,
            Phase::Ready(_) => SessionState::Ready,
            Phase::Failed => SessionState::Failed,
            Phase::Destroyed => SessionState::Destroyed,
        }
    }

    /// Whether a setup round is waiting for its handshake.
    pub const fn setup_pending(&self) -> bool {
        matches!(self.phase, Phase::Initialized { pending: Some(_) })
    }

    /// Fingerprint of the receiver identity, `None` once destroyed.
    pub fn identity_fingerprint(&self) -> Option<String> {
        self.identity.as_ref().map(ReceiverIdentity::fingerprint)
    }

    /// Fingerprint of the authenticated sender, once ready.
    pub fn sender_fingerprint(&self) -> Option<&str> {
        match &self.phase {
            Phase::Ready(session) => Some(&session.sender_fingerprint),
            _ => None,
        }
    }

    /// Prepare the engine for `setup`.
    ///
    /// Calling it again on an initialised engine is a no-op.
    pub fn init(&mut self) -> Result<InitStatus, FairPlayError> {
        match self.phase {
            Phase::Uninitialized => {}
            Phase::Initialized { .. } | Phase::Ready(_) => {
                self.log(Level::DEBUG, "already initialized");
                return Ok(InitStatus::AlreadyInitialized);
            }
            Phase::Failed => {
                return Err(FairPlayError::Sequence {
                    operation: "init",
                    state: SessionState::Failed,
                });
            }
            Phase::Destroyed => return Err(FairPlayError::Destroyed),
        }

        let mut sample = [0u8; 32];
        let drawn = self.rng.try_fill_bytes(&mut sample);
        sample.zeroize();
        drawn.map_err(|e| {
            FairPlayError::AllocationFailure(format!("entropy source unavailable: {e}"))
        })?;

        self.phase = Phase::Initialized { pending: None };
        let fingerprint = self.identity_fingerprint().unwrap_or_default();
        self.log(
            Level::INFO,
            &format!("initialized with identity {fingerprint}"),
        );
        Ok(InitStatus::Initialized)
    }

    /// Round one: answer the sender's 16-byte setup request.
    pub fn setup(&mut self, request: &[u8]) -> Result<[u8; SETUP_RESPONSE_LEN], FairPlayError> {
        match self.phase {
            Phase::Initialized { .. } => {}
            Phase::Destroyed => return Err(FairPlayError::Destroyed),
            _ => {
                return Err(FairPlayError::Sequence {
                    operation: "setup",
                    state: self.state(),
                });
            }
        }
        wire::ensure_len("setup", request, SETUP_REQUEST_LEN)?;
        let request: [u8; SETUP_REQUEST_LEN] = wire::field(request, 0..SETUP_REQUEST_LEN)?;

        match self.build_setup(request) {
            Ok(pending) => {
                let response = pending.response;
                let replaced = self.setup_pending();
                self.phase = Phase::Initialized {
                    pending: Some(pending),
                };
                let mode = wire::setup_mode(&request);
                let message = if replaced {
                    format!("setup complete (mode {mode}), replaced pending setup")
                } else {
                    format!("setup complete (mode {mode})")
                };
                self.log(Level::INFO, &message);
                Ok(response)
            }
            Err(err) => {
                self.fail("setup", &err);
                Err(err)
            }
        }
    }

    fn build_setup(
        &mut self,
        request: [u8; SETUP_REQUEST_LEN],
    ) -> Result<PendingSetup, FairPlayError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        self.rng.try_fill_bytes(&mut *seed).map_err(|e| {
            FairPlayError::CryptoFailure(format!("ephemeral key generation failed: {e}"))
        })?;
        let identity = self.identity.as_ref().ok_or(FairPlayError::Destroyed)?;
        let ephemeral_secret = StaticSecret::from(*seed);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);

        let mut response = [0u8; SETUP_RESPONSE_LEN];
        response[..HEADER_LEN].copy_from_slice(&wire::encode_header(MessageKind::SetupResponse));
        response[setup_response::MODE] = wire::setup_mode(&request);
        response[setup_response::SUITE] = SUITE_X25519_ED25519_XCHACHA;
        response[setup_response::RECEIVER_EPHEMERAL].copy_from_slice(ephemeral_public.as_bytes());
        response[setup_response::RECEIVER_IDENTITY].copy_from_slice(&identity.public_bytes());

        let signature = identity.sign(&setup_signing_message(&request, &response));
        response[setup_response::SIGNATURE].copy_from_slice(&signature);

        Ok(PendingSetup {
            ephemeral_secret,
            request,
            response,
        })
    }

    /// Round two: authenticate the sender and return the confirmation.
    pub fn handshake(
        &mut self,
        request: &[u8],
    ) -> Result<[u8; HANDSHAKE_RESPONSE_LEN], FairPlayError> {
        match self.phase {
            Phase::Initialized { pending: Some(_) } => {}
            Phase::Destroyed => return Err(FairPlayError::Destroyed),
            _ => {
                return Err(FairPlayError::Sequence {
                    operation: "handshake",
                    state: self.state(),
                });
            }
        }
        wire::ensure_len("handshake", request, HANDSHAKE_REQUEST_LEN)?;
        let request: [u8; HANDSHAKE_REQUEST_LEN] = wire::field(request, 0..HANDSHAKE_REQUEST_LEN)?;

        // Failed until proven otherwise; the pending secret is consumed either way.
        let pending = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Initialized {
                pending: Some(pending),
            } => pending,
            other => {
                self.phase = other;
                return Err(FairPlayError::Sequence {
                    operation: "handshake",
                    state: self.state(),
                });
            }
        };

        match self.verify_handshake(&pending, &request) {
            Ok((session, response)) => {
                self.log(
                    Level::INFO,
                    &format!("handshake complete, sender {}", session.sender_fingerprint),
                );
                self.phase = Phase::Ready(session);
                Ok(response)
            }
            Err(err) => {
                self.fail("handshake", &err);
                Err(err)
            }
        }
    }

    fn verify_handshake(
        &self,
        pending: &PendingSetup,
        request: &[u8; HANDSHAKE_REQUEST_LEN],
    ) -> Result<(ReadySession, [u8; HANDSHAKE_RESPONSE_LEN]), FairPlayError> {
        wire::check_header(request, MessageKind::HandshakeRequest)?;

        let sender_identity: [u8; PUBLIC_KEY_LEN] =
            wire::field(request, handshake_request::SENDER_IDENTITY)?;
        let sender_fingerprint = fingerprint_of(&sender_identity);
        if !self.is_trusted(&sender_identity) {
            return Err(FairPlayError::CryptoFailure(format!(
                "sender {sender_fingerprint} is not trusted"
            )));
        }

        let signature: [u8; SIGNATURE_LEN] = wire::field(request, handshake_request::SIGNATURE)?;
        verify_signature(
            &sender_identity,
            &handshake_signing_message(&pending.request, &pending.response, request),
            &signature,
        )?;

        let sender_ephemeral: [u8; PUBLIC_KEY_LEN] =
            wire::field(request, handshake_request::SENDER_EPHEMERAL)?;
        let shared = pending
            .ephemeral_secret
            .diffie_hellman(&PublicKey::from(sender_ephemeral));
        if !shared.was_contributory() {
            return Err(FairPlayError::CryptoFailure(
                "sender ephemeral key is a low-order point".to_string(),
            ));
        }

        let transcript = transcript_hash(&pending.request, &pending.response, request);
        let keys = derive_session_keys(shared.as_bytes(), &transcript)?;

        let mut response = [0u8; HANDSHAKE_RESPONSE_LEN];
        response[..HEADER_LEN]
            .copy_from_slice(&wire::encode_header(MessageKind::HandshakeResponse));
        response[handshake_response::CONFIRMATION].copy_from_slice(&keys.confirmation);

        Ok((
            ReadySession {
                wrap_key: keys.wrap_key,
                sender_fingerprint,
                consecutive_failures: 0,
                keys_issued: 0,
            },
            response,
        ))
    }

    fn is_trusted(&self, sender: &[u8; PUBLIC_KEY_LEN]) -> bool {
        self.trusted_senders.is_empty()
            || self
                .trusted_senders
                .iter()
                .any(|key| bool::from(key.as_slice().ct_eq(sender.as_slice())))
    }

    /// Unwrap a 72-byte wrapped key into a 16-byte content key.
    ///
    /// A bad blob leaves the session usable, but `max_unwrap_failures`
    /// consecutive failures fail the session.
    pub fn decrypt_key(&mut self, wrapped: &[u8]) -> Result<ContentKey, FairPlayError> {
        let state = self.state();
        let max_failures = self.max_unwrap_failures;
        let session = match &mut self.phase {
            Phase::Ready(session) => session,
            Phase::Destroyed => return Err(FairPlayError::Destroyed),
            _ => return Err(FairPlayError::NotReady { state }),
        };
        wire::ensure_len("decrypt_key", wrapped, WRAPPED_KEY_LEN)?;
        let wrapped: [u8; WRAPPED_KEY_LEN] = wire::field(wrapped, 0..WRAPPED_KEY_LEN)?;
        let key_id = u32::from_be_bytes(wire::field(&wrapped, wrapped_key::KEY_ID)?);

        let result = wire::check_header(&wrapped, MessageKind::WrappedKey)
            .and_then(|()| unwrap_content_key(&session.wrap_key, &wrapped));

        match result {
            Ok(key) => {
                session.consecutive_failures = 0;
                session.keys_issued += 1;
                let issued = session.keys_issued;
                self.log(
                    Level::INFO,
                    &format!("unwrapped content key id {key_id} ({issued} this session)"),
                );
                Ok(key)
            }
            Err(err) => {
                session.consecutive_failures += 1;
                let failures = session.consecutive_failures;
                if failures >= max_failures {
                    self.fail(
                        "decrypt_key",
                        &FairPlayError::CryptoFailure(format!(
                            "{failures} consecutive unwrap failures"
                        )),
                    );
                } else {
                    self.log(
                        Level::WARN,
                        &format!(
                            "unwrap of key id {key_id} failed ({failures}/{max_failures}): {err}"
                        ),
                    );
                }
                Err(err)
            }
        }
    }

    /// Release all key material. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if matches!(self.phase, Phase::Destroyed) {
            return;
        }
        self.phase = Phase::Destroyed;
        self.identity = None;
        self.trusted_senders.clear();
        self.log(Level::INFO, "destroyed");
    }

    fn fail(&mut self, operation: &str, err: &FairPlayError) {
        self.phase = Phase::Failed;
        self.log(
            Level::ERROR,
            &format!("{operation} failed, session is now unusable: {err}"),
        );
    }

    fn log(&self, level: Level, message: &str) {
        self.sink.log(level, &format!("handshake: {message}"));
    }
}
