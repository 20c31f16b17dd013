//! Noise handshake and transport frames.
//!
//! # Wire Format
//!
//! Both frames travel as the body of a [`Packet`] whose type byte selects the
//! frame kind.
//!
//! ```text
//! NoiseHandshake (0xf0):
//! [stage(1)] [noise handshake message] [nonce(32)] [timestamp(8, big-endian)]
//!
//! NoiseMessage (0xf1):
//! [counter(8, big-endian)] [AEAD ciphertext of inner packet]
//! ```
//!
//! The stage byte tells a receiver whether the message opens a handshake or
//! answers one, which matters when both peers initiate at the same time. The
//! counter is the explicit AEAD nonce so frames can be opened out of order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    Packet, PacketType, WireError, AEAD_TAG_SIZE, HANDSHAKE_NONCE_SIZE, HANDSHAKE_TIMESTAMP_SIZE,
    MAX_NOISE_MESSAGE_SIZE,
};

/// Which half of the IK exchange a handshake frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStage {
    /// `-> e, es, s, ss` from the initiator.
    Initiation = 0x01,
    /// `<- e, ee, se` from the responder.
    Response = 0x02,
}

impl TryFrom<u8> for HandshakeStage {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Initiation),
            0x02 => Ok(Self::Response),
            _ => Err(WireError::UnknownHandshakeStage(value)),
        }
    }
}

/// Handshake message plus the replay-protection trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub stage: HandshakeStage,
    pub message: Bytes,
    pub nonce: [u8; HANDSHAKE_NONCE_SIZE],
    /// Unix seconds at which the sender created its handshake state.
    pub timestamp: i64,
}

impl HandshakeFrame {
    /// Trailer appended after the Noise message.
    pub const TRAILER_SIZE: usize = HANDSHAKE_NONCE_SIZE + HANDSHAKE_TIMESTAMP_SIZE;

    /// Stage byte, at least one message byte, trailer.
    pub const MIN_SIZE: usize = 1 + 1 + Self::TRAILER_SIZE;

    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.message.is_empty() {
            return Err(WireError::Malformed("empty handshake message".into()));
        }
        if self.message.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(WireError::TooLarge(self.message.len(), MAX_NOISE_MESSAGE_SIZE));
        }

        let mut buf = BytesMut::with_capacity(1 + self.message.len() + Self::TRAILER_SIZE);
        buf.put_u8(self.stage as u8);
        buf.put_slice(&self.message);
        buf.put_slice(&self.nonce);
        buf.put_i64(self.timestamp);
        Ok(buf.freeze())
    }

    /// Wrap into a `NoiseHandshake` packet.
    pub fn into_packet(self) -> Result<Packet, WireError> {
        Ok(Packet::new(PacketType::NoiseHandshake, self.encode()?))
    }

    pub fn decode(body: &Bytes) -> Result<Self, WireError> {
        if body.len() < Self::MIN_SIZE {
            return Err(WireError::TooShort(body.len(), Self::MIN_SIZE));
        }

        let stage = HandshakeStage::try_from(body[0])?;
        let message_end = body.len() - Self::TRAILER_SIZE;
        let message = body.slice(1..message_end);
        if message.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(WireError::TooLarge(message.len(), MAX_NOISE_MESSAGE_SIZE));
        }

        let mut trailer = &body[message_end..];
        let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
        trailer.copy_to_slice(&mut nonce);
        let timestamp = trailer.get_i64();

        Ok(Self {
            stage,
            message,
            nonce,
            timestamp,
        })
    }
}

/// One AEAD-sealed inner packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseFrame {
    pub counter: u64,
    pub ciphertext: Bytes,
}

impl NoiseFrame {
    pub const COUNTER_SIZE: usize = 8;
    pub const MIN_SIZE: usize = Self::COUNTER_SIZE + AEAD_TAG_SIZE;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::COUNTER_SIZE + self.ciphertext.len());
        buf.put_u64(self.counter);
        buf.put_slice(&self.ciphertext);
        buf.freeze()
    }

    /// Wrap into a `NoiseMessage` packet.
    pub fn into_packet(self) -> Packet {
        Packet::new(PacketType::NoiseMessage, self.encode())
    }

    pub fn decode(body: &Bytes) -> Result<Self, WireError> {
        if body.len() < Self::MIN_SIZE {
            return Err(WireError::TooShort(body.len(), Self::MIN_SIZE));
        }
        let counter = u64::from_be_bytes(
            body[..Self::COUNTER_SIZE]
                .try_into()
                .map_err(|_| WireError::Malformed("counter".into()))?,
        );
        Ok(Self {
            counter,
            ciphertext: body.slice(Self::COUNTER_SIZE..),
        })
    }
}
