//! Transport error type and its retry classification.

use std::time::Duration;

use thiserror::Error;
use tox_core::{PacketType, WireError};
use tox_crypto::{NoiseError, ReplayError, SessionError};

/// What a caller should do with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing is permanently wrong; the same call may succeed later.
    Retryable,
    /// Retrying the same call cannot succeed.
    Fatal,
}

/// Session transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} does not support the secure transport")]
    PeerNotSupported(String),

    #[error("version negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no session with {0}")]
    NoSession(String),

    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(PacketType),

    #[error("no handler registered for {0:?}")]
    NoHandler(PacketType),

    #[error("plaintext packet from secure peer {0} rejected")]
    DowngradeRejected(String),

    #[error("peer {0} unreachable")]
    Unreachable(String),

    #[error("transport closed")]
    Closed,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),

    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("config error: {0}")]
    Config(#[from] tox_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify the error for callers deciding whether to retry.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::HandshakeTimeout(_)
            | Self::NegotiationTimeout(_)
            | Self::Unreachable(_)
            | Self::Io(_)
            | Self::Session(SessionError::HandshakeNotComplete)
            | Self::Session(SessionError::HandshakeTimeout(_)) => Disposition::Retryable,
            _ => Disposition::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retryable
    }
}
