//! Crypto error types.

use crate::handshake::SessionState;

/// Coarse classification of a [`FairPlayError`].
///
/// Lets callers decide between retrying with different input, aborting the
/// session, or surfacing an authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong buffer or key length.
    InvalidInput,
    /// Operation invoked out of order, or on a failed/destroyed instance.
    Sequence,
    /// A primitive reported an error or a verification mismatch.
    Crypto,
    /// Stream decryption attempted before a stream was bound.
    NotInitialized,
    /// Resource or entropy exhaustion.
    Allocation,
    /// Filesystem error while loading identity material.
    Io,
    /// Invalid engine configuration.
    Config,
}

/// Errors from the handshake engine and stream decryptor.
#[derive(Debug, thiserror::Error)]
pub enum FairPlayError {
    #[error("Invalid {operation} input: expected {expected} bytes, got {actual}")]
    InvalidInput {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("{operation} is not valid in state {state:?}")]
    Sequence {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session is not ready for key unwrap (state {state:?})")]
    NotReady { state: SessionState },

    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    #[error("Stream not initialized; call init_stream first")]
    NotInitialized,

    #[error("Instance has been destroyed")]
    Destroyed,

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] fpmirror_core::Error),
}

impl FairPlayError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } | Self::InvalidKeyLength { .. } => ErrorKind::InvalidInput,
            Self::Sequence { .. } | Self::NotReady { .. } | Self::Destroyed => ErrorKind::Sequence,
            Self::CryptoFailure(_) => ErrorKind::Crypto,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::AllocationFailure(_) => ErrorKind::Allocation,
            Self::IoError(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the same call may succeed with corrected input on the same
    /// instance.
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidInput)
    }
}
