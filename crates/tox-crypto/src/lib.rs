//! Cryptographic core of the secure transport.
//!
//! This crate provides:
//! - X25519 static keypairs
//! - The Noise IK handshake state machine
//! - Directional cipher states with explicit nonces
//! - A nonce/timestamp replay guard for handshake messages
//! - Per-peer sessions that serialize access to their cipher states
//!
//! # Design
//!
//! Uses the Noise IK pattern (`Noise_IK_25519_ChaChaPoly_SHA256`) which provides:
//! - Mutual authentication in a single round trip
//! - Forward secrecy (fresh ephemeral keys per handshake)
//! - Initiator identity hiding (its static key travels encrypted)
//!
//! The underlying transport is unordered, so transport messages use explicit
//! counters as AEAD nonces and a sliding window instead of Noise's implicit
//! in-order nonce.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod keys;
pub mod noise;
pub mod replay;
pub mod seq_window;
pub mod session;

use std::time::{SystemTime, UNIX_EPOCH};

pub use cipher::{RecvCipher, SendCipher};
pub use keys::{validate_key, StaticKeypair};
pub use noise::{HandshakeRole, NoiseError, NoiseHandshake};
pub use replay::{ReplayError, ReplayGuard};
pub use seq_window::SequenceWindow;
pub use session::{Session, SessionError};

/// Current Unix time in whole seconds.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
