//! Per-peer encrypted session.
//!
//! A session owns one peer's handshake and, once that completes, the send and
//! receive cipher states split from it. All cryptographic mutation goes
//! through the session's own lock, so work on different peers never contends
//! and work on the same peer is serialized with handshake completion.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tox_core::{NoiseFrame, HANDSHAKE_NONCE_SIZE};

use crate::cipher::{RecvCipher, SendCipher};
use crate::noise::{HandshakeRole, NoiseError, NoiseHandshake};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake not complete")]
    HandshakeNotComplete,

    #[error("cipher not initialized")]
    CipherNotInitialized,

    #[error("timed out waiting for handshake after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),
}

struct SessionState {
    handshake: NoiseHandshake,
    send: Option<SendCipher>,
    recv: Option<RecvCipher>,
    complete: bool,
    /// Unix seconds at which the handshake completed.
    established_at: Option<i64>,
}

/// Encrypted session with one peer.
pub struct Session<A> {
    peer: A,
    role: HandshakeRole,
    nonce: [u8; HANDSHAKE_NONCE_SIZE],
    timestamp: i64,
    created_at: Instant,
    state: RwLock<SessionState>,
    established: watch::Sender<bool>,
}

impl<A> Session<A> {
    /// Wrap a fresh handshake.
    pub fn new(peer: A, handshake: NoiseHandshake) -> Self {
        let (established, _) = watch::channel(false);
        Self {
            peer,
            role: handshake.role(),
            nonce: *handshake.nonce(),
            timestamp: handshake.timestamp(),
            created_at: Instant::now(),
            state: RwLock::new(SessionState {
                handshake,
                send: None,
                recv: None,
                complete: false,
                established_at: None,
            }),
            established,
        }
    }

    pub fn peer(&self) -> &A {
        &self.peer
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Nonce attached to this session's handshake messages.
    pub fn handshake_nonce(&self) -> &[u8; HANDSHAKE_NONCE_SIZE] {
        &self.nonce
    }

    /// Unix seconds attached to this session's handshake messages.
    pub fn handshake_timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Time since the session object was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn is_complete(&self) -> bool {
        self.state.read().await.complete
    }

    /// Unix seconds at which the session became established.
    pub async fn established_at(&self) -> Option<i64> {
        self.state.read().await.established_at
    }

    pub async fn set_complete(&self, complete: bool) {
        let mut state = self.state.write().await;
        state.complete = complete;
        state.established_at = complete.then(crate::unix_time);
        self.established.send_replace(complete);
    }

    /// Feed the handshake one step (see [`NoiseHandshake::write_message`]).
    ///
    /// On completion the cipher states are split and stored before the lock
    /// is released, so no encrypt call can observe a complete session without
    /// ciphers.
    pub async fn advance_handshake(
        &self,
        payload: &[u8],
        received: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let mut state = self.state.write().await;
        let (outbound, done) = state.handshake.write_message(payload, received)?;
        if done {
            let (send, recv) = state.handshake.derive_cipher_states()?;
            state.send = Some(send);
            state.recv = Some(recv);
            state.complete = true;
            state.established_at = Some(crate::unix_time());
            self.established.send_replace(true);
        }
        Ok(outbound)
    }

    /// Encrypt an inner packet for this peer.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<NoiseFrame, SessionError> {
        let mut state = self.state.write().await;
        if !state.complete {
            return Err(SessionError::HandshakeNotComplete);
        }
        let cipher = state.send.as_mut().ok_or(SessionError::CipherNotInitialized)?;
        Ok(cipher.encrypt(plaintext)?)
    }

    /// Decrypt a frame from this peer.
    pub async fn decrypt(&self, frame: &NoiseFrame) -> Result<Vec<u8>, SessionError> {
        let mut state = self.state.write().await;
        if !state.complete {
            return Err(SessionError::HandshakeNotComplete);
        }
        let cipher = state.recv.as_mut().ok_or(SessionError::CipherNotInitialized)?;
        Ok(cipher.decrypt(frame)?)
    }

    /// Wait until the session is established or `timeout` elapses.
    pub async fn wait_established(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.established.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|established| *established))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            // The sender lives in `self`, so the channel cannot close under us.
            Ok(Err(_)) => Err(SessionError::HandshakeNotComplete),
            Err(_) => Err(SessionError::HandshakeTimeout(timeout)),
        };
        result
    }

    /// The peer's static key, once known.
    pub async fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.read().await.handshake.remote_static()
    }

    /// Nonce and timestamp the peer authenticated inside its handshake message.
    pub async fn remote_binding(&self) -> Option<([u8; HANDSHAKE_NONCE_SIZE], i64)> {
        self.state
            .read()
            .await
            .handshake
            .remote_binding()
            .map(|(nonce, timestamp)| (*nonce, timestamp))
    }

    /// Payload the peer placed in its handshake message.
    pub async fn remote_payload(&self) -> Vec<u8> {
        self.state.read().await.handshake.remote_payload().to_vec()
    }

    pub async fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.state.read().await.handshake.handshake_hash().copied()
    }
}

impl<A: fmt::Debug> fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("established", &*self.established.borrow())
            .finish_non_exhaustive()
    }
}
