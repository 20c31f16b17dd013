//! Noise Protocol handshake implementation.
//!
//! Uses Noise IK pattern: `Noise_IK_25519_ChaChaPoly_SHA256`
//!
//! # Why IK?
//!
//! A Tox peer always knows the static key of the node it contacts (it came
//! from the DHT or the friend list), so the initiator can encrypt its own
//! identity to the responder in the very first message:
//! - **Mutual authentication** in one round trip
//! - **Forward secrecy** from per-handshake ephemeral keys
//! - **KCI resistance** from the `ss`/`se` mixes
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                                Responder
//!     |          (<- s known in advance)       |
//!     |  -> e, es, s, ss   [payload]           |
//!     |--------------------------------------->|
//!     |                                        |
//!     |  <- e, ee, se      [payload]           |
//!     |<---------------------------------------|
//!     |                                        |
//!     [   Transport keys split per direction   ]
//! ```
//!
//! Each handshake object also carries a random 32-byte nonce and its creation
//! timestamp. Both are fixed at construction and travel next to the Noise
//! message so receivers can reject replays. They are also sealed into the
//! front of every handshake payload, so a receiver can check the plaintext
//! trailer against values the sender actually authenticated.

use rand::RngCore;
use snow::{Builder, HandshakeState};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

use tox_core::{HANDSHAKE_NONCE_SIZE, HANDSHAKE_TIMESTAMP_SIZE, MAX_NOISE_MESSAGE_SIZE};

use crate::cipher::{RecvCipher, SendCipher};
use crate::keys::validate_key;

/// Noise protocol pattern (IK with X25519, ChaCha20-Poly1305, SHA-256)
const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

/// Bound into the handshake hash so transcripts from other protocols never verify.
const NOISE_PROLOGUE: &[u8] = b"tox-noise-ik/1";

/// Nonce and timestamp sealed ahead of the caller's handshake payload.
const BINDING_SIZE: usize = HANDSHAKE_NONCE_SIZE + HANDSHAKE_TIMESTAMP_SIZE;

/// Noise handshake and cipher errors
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("handshake already complete")]
    HandshakeAlreadyComplete,

    #[error("handshake not complete")]
    HandshakeNotComplete,

    #[error("cipher states already derived")]
    CiphersAlreadyDerived,

    #[error("handshake message out of order: {0}")]
    UnexpectedMessage(&'static str),

    #[error("invalid handshake message")]
    InvalidMessage,

    #[error("handshake nonce or timestamp differs from the authenticated copy")]
    BindingMismatch,

    #[error("payload too large: {0} bytes, maximum {1}")]
    PayloadTooLarge(usize, usize),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("replay detected: counter {0}")]
    Replay(u64),

    #[error("send counter exhausted")]
    CounterExhausted,

    #[error("snow error: {0}")]
    Snow(#[from] snow::Error),
}

/// Which side of the IK exchange this handshake plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

enum Progress {
    /// Handshake messages are still being exchanged (or the exchange just
    /// finished and the ciphers have not been split yet).
    Active(Box<HandshakeState>),
    /// Cipher states were handed out; nothing left but audit data.
    Split,
    /// A message failed to process and the snow state can no longer be trusted.
    Poisoned,
}

/// Noise IK handshake for one peer.
pub struct NoiseHandshake {
    role: HandshakeRole,
    progress: Progress,
    complete: bool,
    nonce: [u8; HANDSHAKE_NONCE_SIZE],
    timestamp: i64,
    remote_static: Option<[u8; 32]>,
    remote_binding: Option<Binding>,
    handshake_hash: Option<[u8; 32]>,
    remote_payload: Vec<u8>,
}

impl NoiseHandshake {
    /// Create a handshake.
    ///
    /// # Arguments
    /// * `local_private_key` - 32-byte X25519 static private key (any other
    ///   length is rejected with `InvalidKey`)
    /// * `peer_public_key` - responder's static key; required for the
    ///   initiator, must be absent for the responder
    /// * `role` - initiator or responder
    pub fn new(
        local_private_key: &[u8],
        peer_public_key: Option<&[u8; 32]>,
        role: HandshakeRole,
    ) -> Result<Self, NoiseError> {
        let local = Zeroizing::new(validate_key(local_private_key, "local private key")?);
        let remote = match (role, peer_public_key) {
            (HandshakeRole::Initiator, Some(key)) => {
                Some(validate_key(&key[..], "peer public key")?)
            }
            (HandshakeRole::Initiator, None) => {
                return Err(NoiseError::InvalidKey(
                    "initiator requires the peer's static public key".into(),
                ))
            }
            (HandshakeRole::Responder, Some(_)) => {
                return Err(NoiseError::InvalidKey(
                    "responder learns the peer's static key from the handshake".into(),
                ))
            }
            (HandshakeRole::Responder, None) => None,
        };

        let params = NOISE_PATTERN.parse()?;
        let mut builder = Builder::new(params)
            .local_private_key(&local[..])
            .prologue(NOISE_PROLOGUE);
        if let Some(ref key) = remote {
            builder = builder.remote_public_key(key);
        }

        let state = match role {
            HandshakeRole::Initiator => builder.build_initiator()?,
            HandshakeRole::Responder => builder.build_responder()?,
        };
        // `local` drops here; snow keeps its own copy for the DH operations.
        drop(local);

        let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        Ok(Self {
            role,
            progress: Progress::Active(Box::new(state)),
            complete: false,
            nonce,
            timestamp: crate::unix_time(),
            remote_static: remote,
            remote_binding: None,
            handshake_hash: None,
            remote_payload: Vec::new(),
        })
    }

    /// Advance the handshake by one step.
    ///
    /// * Initiator, `received = None`: produces message 1.
    /// * Initiator, `received = Some(reply)`: consumes the reply and completes.
    /// * Responder, `received = Some(message 1)`: consumes it, produces the
    ///   reply carrying `payload`, and completes.
    ///
    /// Returns the outbound message (if any) and whether the handshake is now
    /// complete.
    pub fn write_message(
        &mut self,
        payload: &[u8],
        received: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, bool), NoiseError> {
        if self.complete {
            return Err(NoiseError::HandshakeAlreadyComplete);
        }

        let state = match &mut self.progress {
            Progress::Active(state) => state,
            Progress::Split => return Err(NoiseError::HandshakeAlreadyComplete),
            Progress::Poisoned => return Err(NoiseError::InvalidMessage),
        };

        let mut sealed = Vec::with_capacity(BINDING_SIZE + payload.len());
        sealed.extend_from_slice(&self.nonce);
        sealed.extend_from_slice(&self.timestamp.to_be_bytes());
        sealed.extend_from_slice(payload);

        let result = match (self.role, received) {
            (HandshakeRole::Initiator, None) => {
                if !state.is_my_turn() {
                    return Err(NoiseError::UnexpectedMessage("message 1 already written"));
                }
                write_step(state, &sealed).map(|msg| (Some(msg), false))
            }
            (HandshakeRole::Initiator, Some(reply)) => {
                if state.is_my_turn() {
                    return Err(NoiseError::UnexpectedMessage("message 1 not yet written"));
                }
                read_step(state, reply)
                    .and_then(open_payload)
                    .map(|(binding, remote_payload)| {
                        self.remote_binding = Some(binding);
                        self.remote_payload = remote_payload;
                        (None, true)
                    })
            }
            (HandshakeRole::Responder, Some(initiation)) => read_step(state, initiation)
                .and_then(open_payload)
                .and_then(|(binding, remote_payload)| {
                    self.remote_binding = Some(binding);
                    self.remote_payload = remote_payload;
                    write_step(state, &sealed)
                })
                .map(|msg| (Some(msg), true)),
            (HandshakeRole::Responder, None) => {
                return Err(NoiseError::UnexpectedMessage(
                    "responder needs the initiator's message",
                ))
            }
        };

        match result {
            Ok((outbound, done)) => {
                if done {
                    self.finish()?;
                }
                Ok((outbound, done))
            }
            Err(e) => {
                self.progress = Progress::Poisoned;
                Err(e)
            }
        }
    }

    fn finish(&mut self) -> Result<(), NoiseError> {
        let state = match &self.progress {
            Progress::Active(state) => state,
            _ => return Err(NoiseError::InvalidMessage),
        };
        if !state.is_handshake_finished() {
            return Err(NoiseError::HandshakeNotComplete);
        }

        let remote: [u8; 32] = state
            .get_remote_static()
            .ok_or(NoiseError::InvalidMessage)?
            .try_into()
            .map_err(|_| NoiseError::InvalidMessage)?;
        let hash: [u8; 32] = state
            .get_handshake_hash()
            .try_into()
            .map_err(|_| NoiseError::InvalidMessage)?;

        self.remote_static = Some(remote);
        self.handshake_hash = Some(hash);
        self.complete = true;
        Ok(())
    }

    /// Split the finished handshake into directional cipher states.
    ///
    /// The initiator's send cipher pairs with the responder's receive cipher
    /// and vice versa.
    pub fn derive_cipher_states(&mut self) -> Result<(SendCipher, RecvCipher), NoiseError> {
        if !self.complete {
            return Err(NoiseError::HandshakeNotComplete);
        }

        let state = match std::mem::replace(&mut self.progress, Progress::Split) {
            Progress::Active(state) => state,
            other => {
                self.progress = other;
                return Err(NoiseError::CiphersAlreadyDerived);
            }
        };

        let transport = Arc::new(state.into_stateless_transport_mode()?);
        Ok((SendCipher::new(transport.clone()), RecvCipher::new(transport)))
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Random value attached to this handshake's messages.
    pub fn nonce(&self) -> &[u8; HANDSHAKE_NONCE_SIZE] {
        &self.nonce
    }

    /// Unix seconds at construction.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The peer's static key: configured for initiators, learned for responders.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// Nonce and timestamp the peer sealed into its handshake message.
    pub fn remote_binding(&self) -> Option<(&[u8; HANDSHAKE_NONCE_SIZE], i64)> {
        self.remote_binding
            .as_ref()
            .map(|(nonce, timestamp)| (nonce, *timestamp))
    }

    /// Handshake transcript hash, available after completion.
    pub fn handshake_hash(&self) -> Option<&[u8; 32]> {
        self.handshake_hash.as_ref()
    }

    /// Payload the peer sent inside its handshake message.
    pub fn remote_payload(&self) -> &[u8] {
        &self.remote_payload
    }
}

fn write_step(state: &mut HandshakeState, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
    let len = state.write_message(payload, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

type Binding = ([u8; HANDSHAKE_NONCE_SIZE], i64);

/// Split an opened payload into the sender's binding and the caller's bytes.
fn open_payload(mut opened: Vec<u8>) -> Result<(Binding, Vec<u8>), NoiseError> {
    if opened.len() < BINDING_SIZE {
        return Err(NoiseError::InvalidMessage);
    }
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    nonce.copy_from_slice(&opened[..HANDSHAKE_NONCE_SIZE]);
    let mut timestamp = [0u8; HANDSHAKE_TIMESTAMP_SIZE];
    timestamp.copy_from_slice(&opened[HANDSHAKE_NONCE_SIZE..BINDING_SIZE]);

    let payload = opened.split_off(BINDING_SIZE);
    Ok(((nonce, i64::from_be_bytes(timestamp)), payload))
}

fn read_step(state: &mut HandshakeState, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
    if message.len() > MAX_NOISE_MESSAGE_SIZE {
        return Err(NoiseError::InvalidMessage);
    }
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
    let len = state.read_message(message, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StaticKeypair;

    fn run_handshake(
        initiator_key: &StaticKeypair,
        responder_key: &StaticKeypair,
    ) -> (NoiseHandshake, NoiseHandshake) {
        let mut initiator = NoiseHandshake::new(
            initiator_key.private_key(),
            Some(responder_key.public_key()),
            HandshakeRole::Initiator,
        )
        .unwrap();
        let mut responder =
            NoiseHandshake::new(responder_key.private_key(), None, HandshakeRole::Responder)
                .unwrap();

        let (msg1, done) = initiator.write_message(b"init-payload", None).unwrap();
        assert!(!done);
        let (msg2, done) = responder
            .write_message(b"resp-payload", msg1.as_deref())
            .unwrap();
        assert!(done);
        let (nothing, done) = initiator.write_message(&[], msg2.as_deref()).unwrap();
        assert!(done);
        assert!(nothing.is_none());

        (initiator, responder)
    }

    #[test]
    fn test_full_handshake() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let (initiator, responder) = run_handshake(&alice, &bob);

        assert!(initiator.is_complete());
        assert!(responder.is_complete());

        // Both should know each other's public key
        assert_eq!(initiator.remote_static(), Some(*bob.public_key()));
        assert_eq!(responder.remote_static(), Some(*alice.public_key()));
        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());

        // Payloads cross over
        assert_eq!(responder.remote_payload(), b"init-payload");
        assert_eq!(initiator.remote_payload(), b"resp-payload");
    }

    #[test]
    fn test_nonce_and_timestamp_authenticated() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let (initiator, responder) = run_handshake(&alice, &bob);

        assert_eq!(
            responder.remote_binding(),
            Some((initiator.nonce(), initiator.timestamp()))
        );
        assert_eq!(
            initiator.remote_binding(),
            Some((responder.nonce(), responder.timestamp()))
        );
    }

    #[test]
    fn test_encrypted_transport_both_directions() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let (mut initiator, mut responder) = run_handshake(&alice, &bob);

        let (mut i_send, mut i_recv) = initiator.derive_cipher_states().unwrap();
        let (mut r_send, mut r_recv) = responder.derive_cipher_states().unwrap();

        let frame = i_send.encrypt(b"hello from initiator").unwrap();
        assert_eq!(r_recv.decrypt(&frame).unwrap(), b"hello from initiator");

        let frame = r_send.encrypt(b"hello from responder").unwrap();
        assert_eq!(i_recv.decrypt(&frame).unwrap(), b"hello from responder");
    }

    #[test]
    fn test_write_after_completion_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let (mut initiator, mut responder) = run_handshake(&alice, &bob);

        assert!(matches!(
            initiator.write_message(&[], None),
            Err(NoiseError::HandshakeAlreadyComplete)
        ));
        assert!(matches!(
            responder.write_message(&[], Some(&[0u8; 96][..])),
            Err(NoiseError::HandshakeAlreadyComplete)
        ));
    }

    #[test]
    fn test_derive_before_completion_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let mut initiator = NoiseHandshake::new(
            alice.private_key(),
            Some(bob.public_key()),
            HandshakeRole::Initiator,
        )
        .unwrap();
        assert!(matches!(
            initiator.derive_cipher_states(),
            Err(NoiseError::HandshakeNotComplete)
        ));
    }

    #[test]
    fn test_derive_twice_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let (mut initiator, _) = run_handshake(&alice, &bob);
        initiator.derive_cipher_states().unwrap();
        assert!(matches!(
            initiator.derive_cipher_states(),
            Err(NoiseError::CiphersAlreadyDerived)
        ));
        assert!(initiator.is_complete());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        assert!(matches!(
            NoiseHandshake::new(&[1u8; 16], Some(bob.public_key()), HandshakeRole::Initiator),
            Err(NoiseError::InvalidKey(_))
        ));
        assert!(matches!(
            NoiseHandshake::new(alice.private_key(), Some(&[0u8; 32]), HandshakeRole::Initiator),
            Err(NoiseError::InvalidKey(_))
        ));
        assert!(matches!(
            NoiseHandshake::new(alice.private_key(), None, HandshakeRole::Initiator),
            Err(NoiseError::InvalidKey(_))
        ));
        assert!(matches!(
            NoiseHandshake::new(alice.private_key(), Some(bob.public_key()), HandshakeRole::Responder),
            Err(NoiseError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_wrong_responder_key_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let mallory = StaticKeypair::generate();

        // Alice believes she is talking to Mallory, Bob answers.
        let mut initiator = NoiseHandshake::new(
            alice.private_key(),
            Some(mallory.public_key()),
            HandshakeRole::Initiator,
        )
        .unwrap();
        let mut responder =
            NoiseHandshake::new(bob.private_key(), None, HandshakeRole::Responder).unwrap();

        let (msg1, _) = initiator.write_message(&[], None).unwrap();
        assert!(responder.write_message(&[], msg1.as_deref()).is_err());
        assert!(!responder.is_complete());
    }

    #[test]
    fn test_nonce_and_timestamp_fixed_at_construction() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let mut a = NoiseHandshake::new(
            alice.private_key(),
            Some(bob.public_key()),
            HandshakeRole::Initiator,
        )
        .unwrap();
        let b = NoiseHandshake::new(
            alice.private_key(),
            Some(bob.public_key()),
            HandshakeRole::Initiator,
        )
        .unwrap();

        let nonce = *a.nonce();
        let timestamp = a.timestamp();
        a.write_message(&[], None).unwrap();
        assert_eq!(a.nonce(), &nonce);
        assert_eq!(a.timestamp(), timestamp);
        assert_ne!(a.nonce(), b.nonce());
        assert!((crate::unix_time() - timestamp).abs() <= 1);
    }

    #[test]
    fn test_out_of_order_calls() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let mut initiator = NoiseHandshake::new(
            alice.private_key(),
            Some(bob.public_key()),
            HandshakeRole::Initiator,
        )
        .unwrap();
        let mut responder =
            NoiseHandshake::new(bob.private_key(), None, HandshakeRole::Responder).unwrap();

        assert!(matches!(
            initiator.write_message(&[], Some(&[0u8; 48][..])),
            Err(NoiseError::UnexpectedMessage(_))
        ));
        assert!(matches!(
            responder.write_message(&[], None),
            Err(NoiseError::UnexpectedMessage(_))
        ));

        initiator.write_message(&[], None).unwrap();
        assert!(matches!(
            initiator.write_message(&[], None),
            Err(NoiseError::UnexpectedMessage(_))
        ));
    }
}
