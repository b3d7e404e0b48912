//! Fixed-size message layout shared with the sender.
//!
//! Every buffer exchanged with the sender has an exact length. Handshake
//! messages start with a 12-byte `FPLY` header:
//!
//! ```text
//! 0      4    5    6      7    8              12
//! +------+----+----+------+----+--------------+
//! | FPLY | 03 | 01 | kind | 00 | payload (BE) |
//! +------+----+----+------+----+--------------+
//! ```

use std::ops::Range;

use crate::error::FairPlayError;

pub const SETUP_REQUEST_LEN: usize = 16;
pub const SETUP_RESPONSE_LEN: usize = 142;
pub const HANDSHAKE_REQUEST_LEN: usize = 164;
pub const HANDSHAKE_RESPONSE_LEN: usize = 32;
pub const WRAPPED_KEY_LEN: usize = 72;
pub const CONTENT_KEY_LEN: usize = 16;

pub const HEADER_LEN: usize = 12;
pub const MAGIC: [u8; 4] = *b"FPLY";
pub const VERSION_MAJOR: u8 = 0x03;
pub const VERSION_MINOR: u8 = 0x01;

/// Cipher suite advertised in the setup response:
/// X25519 agreement, Ed25519 identities, XChaCha20-Poly1305 key wrap.
pub const SUITE_X25519_ED25519_XCHACHA: u8 = 0x01;

/// Position of the key-message selector inside the setup request.
pub const SETUP_MODE_OFFSET: usize = 14;
pub const MODE_MASK: u8 = 0x03;

pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SENDER_NONCE_LEN: usize = 24;
pub const CONFIRMATION_LEN: usize = 20;
pub const WRAP_NONCE_LEN: usize = 24;
pub const WRAP_TAG_LEN: usize = 16;

pub mod setup_response {
    use super::Range;

    pub const MODE: usize = 12;
    pub const SUITE: usize = 13;
    pub const RECEIVER_EPHEMERAL: Range<usize> = 14..46;
    pub const RECEIVER_IDENTITY: Range<usize> = 46..78;
    /// Everything before the signature is covered by it.
    pub const SIGNED: Range<usize> = 0..78;
    pub const SIGNATURE: Range<usize> = 78..142;
}

pub mod handshake_request {
    use super::Range;

    pub const SENDER_EPHEMERAL: Range<usize> = 12..44;
    pub const SENDER_IDENTITY: Range<usize> = 44..76;
    pub const SENDER_NONCE: Range<usize> = 76..100;
    pub const SIGNED: Range<usize> = 0..100;
    pub const SIGNATURE: Range<usize> = 100..164;
}

pub mod handshake_response {
    use super::Range;

    pub const CONFIRMATION: Range<usize> = 12..32;
}

pub mod wrapped_key {
    use super::Range;

    pub const KEY_ID: Range<usize> = 12..16;
    /// Header plus key id, authenticated but not encrypted.
    pub const ASSOCIATED_DATA: Range<usize> = 0..16;
    pub const NONCE: Range<usize> = 16..40;
    /// Encrypted content key followed by the Poly1305 tag.
    pub const SEALED: Range<usize> = 40..72;
}

/// Message kinds carried in header byte 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    SetupResponse = 2,
    HandshakeRequest = 3,
    HandshakeResponse = 4,
    WrappedKey = 5,
}

impl MessageKind {
    /// Total message length, header included.
    pub const fn message_len(self) -> usize {
        match self {
            Self::SetupResponse => SETUP_RESPONSE_LEN,
            Self::HandshakeRequest => HANDSHAKE_REQUEST_LEN,
            Self::HandshakeResponse => HANDSHAKE_RESPONSE_LEN,
            Self::WrappedKey => WRAPPED_KEY_LEN,
        }
    }

    /// Payload length as written into the header.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn payload_len(self) -> u32 {
        (self.message_len() - HEADER_LEN) as u32
    }
}

/// Encode the header for a message of `kind`.
pub fn encode_header(kind: MessageKind) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = VERSION_MAJOR;
    header[5] = VERSION_MINOR;
    header[6] = kind as u8;
    header[8..].copy_from_slice(&kind.payload_len().to_be_bytes());
    header
}

/// Check that `message` starts with the header for `kind`.
///
/// A mismatch means the peer is speaking a different protocol revision or the
/// buffer was corrupted; both are verification failures.
pub fn check_header(message: &[u8], kind: MessageKind) -> Result<(), FairPlayError> {
    let expected = encode_header(kind);
    match message.get(..HEADER_LEN) {
        Some(header) if header == expected => Ok(()),
        Some(header) if header[..4] != MAGIC => Err(FairPlayError::CryptoFailure(format!(
            "{kind:?} message has bad magic {}",
            hex::encode(&header[..4])
        ))),
        Some(header) => Err(FairPlayError::CryptoFailure(format!(
            "{kind:?} message has unexpected header {}",
            hex::encode(header)
        ))),
        None => Err(FairPlayError::CryptoFailure(format!(
            "{kind:?} message shorter than its header"
        ))),
    }
}

/// Ensure `input` is exactly `expected` bytes.
pub const fn ensure_len(
    operation: &'static str,
    input: &[u8],
    expected: usize,
) -> Result<(), FairPlayError> {
    if input.len() == expected {
        Ok(())
    } else {
        Err(FairPlayError::InvalidInput {
            operation,
            expected,
            actual: input.len(),
        })
    }
}

/// Copy a fixed range out of a length-checked buffer.
///
/// Callers only pass ranges taken from the layout modules above, against
/// buffers already checked with [`ensure_len`].
pub fn field<const N: usize>(buf: &[u8], range: Range<usize>) -> Result<[u8; N], FairPlayError> {
    buf.get(range.clone())
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or_else(|| {
            FairPlayError::CryptoFailure(format!(
                "field {}..{} out of bounds for {}-byte message",
                range.start,
                range.end,
                buf.len()
            ))
        })
}

/// Key-message selector chosen by the sender in its setup request.
pub const fn setup_mode(request: &[u8; SETUP_REQUEST_LEN]) -> u8 {
    request[SETUP_MODE_OFFSET] & MODE_MASK
}
