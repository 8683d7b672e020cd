//! Engine error taxonomy.
//!
//! Every failure the engine reports is an [`EngineError`]. [`EngineError::kind`]
//! groups the variants the way callers react to them:
//!
//! - **Connectivity**: surfaced through `PeerConnectionState::error`, retryable.
//! - **Protocol**: fatal to the affected transfer only, never retried.
//! - **Resource**: rejected synchronously at the call boundary.
//! - **Timeout**: the sender fails; the file must be staged again.
//! - **Transfer**: per-file failures (abort, unreadable source).

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Protocol,
    Resource,
    Timeout,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    // ── Connectivity ─────────────────────────────────────────────────────────
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("channel handle revoked")]
    ChannelRevoked,

    #[error("transport error: {0}")]
    Transport(String),

    // ── Protocol ─────────────────────────────────────────────────────────────
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("sequence violation: expected {expected}, got {got}")]
    SequenceViolation { expected: u32, got: u32 },

    #[error("length mismatch: announced {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    // ── Resource ─────────────────────────────────────────────────────────────
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("a handshake is already in progress")]
    HandshakeInProgress,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    // ── Timeout ──────────────────────────────────────────────────────────────
    #[error("no completion acknowledgement received")]
    CompletionTimeout,

    // ── Transfer ─────────────────────────────────────────────────────────────
    #[error("transfer aborted: {0}")]
    Aborted(String),

    #[error("file source error: {0}")]
    Source(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SignalingUnavailable(_)
            | Self::PeerNotFound(_)
            | Self::HandshakeTimeout
            | Self::HandshakeFailed(_)
            | Self::ChannelRevoked
            | Self::Transport(_) => ErrorKind::Connectivity,
            Self::MalformedFrame(_)
            | Self::SequenceViolation { .. }
            | Self::LengthMismatch { .. }
            | Self::UnexpectedFrame(_) => ErrorKind::Protocol,
            Self::NotConnected
            | Self::AlreadyConnected
            | Self::HandshakeInProgress
            | Self::InvalidState(_)
            | Self::UnknownTransfer(_)
            | Self::Config(_) => ErrorKind::Resource,
            Self::CompletionTimeout => ErrorKind::Timeout,
            Self::Aborted(_) | Self::Source(_) => ErrorKind::Transfer,
        }
    }

    /// Protocol violations must be reported to the peer with an abort.
    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Source(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(EngineError::HandshakeTimeout.kind(), ErrorKind::Connectivity);
        assert_eq!(EngineError::ChannelRevoked.kind(), ErrorKind::Connectivity);
        assert_eq!(
            EngineError::SequenceViolation { expected: 1, got: 3 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(EngineError::NotConnected.kind(), ErrorKind::Resource);
        assert_eq!(EngineError::CompletionTimeout.kind(), ErrorKind::Timeout);
        assert!(EngineError::MalformedFrame("short".into()).is_protocol_violation());
        assert!(!EngineError::Aborted("by peer".into()).is_protocol_violation());
    }
}
