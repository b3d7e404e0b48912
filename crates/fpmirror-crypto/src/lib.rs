//! fpmirror mirroring session crypto
//!
//! Receiver-side primitives for an encrypted screen-mirroring session.
//!
//! ## Pieces
//!
//! - **Handshake**: two-round pairing (setup, then handshake) authenticated
//!   with Ed25519 identities. X25519 ephemeral ECDH feeds HKDF-SHA256 over the
//!   message transcript.
//! - **Key unwrap**: 72-byte blobs sealed with XChaCha20-Poly1305 under the
//!   session wrap key yield 16-byte content keys.
//! - **Stream**: AES-128-CTR per stream connection id, with key and IV
//!   derived from the content key via SHA-512.

pub mod error;
pub mod handshake;
pub mod identity;
pub mod keys;
#[cfg(any(test, feature = "test-utils"))]
pub mod sender;
pub mod stream;
pub mod wire;

pub use error::{ErrorKind, FairPlayError};
pub use handshake::{HandshakeEngine, InitStatus, SessionState};
pub use identity::{ReceiverIdentity, fingerprint_of};
pub use keys::ContentKey;
#[cfg(any(test, feature = "test-utils"))]
pub use sender::{SenderHarness, encrypt_stream, perform_handshake};
pub use stream::StreamDecryptor;
