//! Common error types for the Tox Noise stack.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for configuration and edge I/O.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed config document.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Values that parse but cannot work together.
    #[error("configuration error: {0}")]
    Config(String),

    /// Hex key material of the wrong shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl Error {
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn invalid_key(msg: impl std::fmt::Display) -> Self {
        Self::InvalidKey(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
