//! Core protocol types, framing, and constants.
//!
//! This crate provides:
//! - The closed set of packet type tags carried as the first byte of every datagram
//! - Protocol versions and the version negotiation wire messages
//! - Noise handshake and Noise transport frame codecs
//!
//! It has no knowledge of cryptography or sockets; everything here is plain
//! byte layout.

#![forbid(unsafe_code)]

pub mod frame;
pub mod version;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use frame::{HandshakeFrame, HandshakeStage, NoiseFrame};
pub use version::{ProtocolVersion, VersionAdvertisement, VersionResponse};

/// Size of the random nonce attached to every handshake message.
pub const HANDSHAKE_NONCE_SIZE: usize = 32;

/// Size of the big-endian Unix timestamp attached to every handshake message.
pub const HANDSHAKE_TIMESTAMP_SIZE: usize = 8;

/// Largest message Noise will produce or accept.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// AEAD authentication tag length.
pub const AEAD_TAG_SIZE: usize = 16;

/// Largest payload one IPv4 UDP datagram can carry (65535 - 20 IP - 8 UDP).
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Bytes a `NoiseMessage` datagram adds around its plaintext: type byte,
/// counter and AEAD tag.
pub const NOISE_MESSAGE_OVERHEAD: usize = 1 + 8 + AEAD_TAG_SIZE;

/// Largest inner packet (type byte + body) whose sealed datagram still fits
/// in [`MAX_DATAGRAM_SIZE`].
pub const MAX_PLAINTEXT_SIZE: usize = MAX_DATAGRAM_SIZE - NOISE_MESSAGE_OVERHEAD;

/// Wire framing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("packet too large: {0} bytes, maximum {1}")]
    TooLarge(usize, usize),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown handshake stage: 0x{0:02x}")]
    UnknownHandshakeStage(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Packet type tags.
///
/// The first byte of every datagram handed to the underlying transport. The
/// low range mirrors the classic Tox DHT / net_crypto / messenger ids; the
/// `0xF0` block belongs to the secure transport layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    PingRequest = 0x00,
    PingResponse = 0x01,
    GetNodes = 0x02,
    SendNodes = 0x04,
    CookieRequest = 0x18,
    CookieResponse = 0x19,
    CryptoHandshake = 0x1a,
    CryptoData = 0x1b,
    FriendRequest = 0x20,
    LanDiscovery = 0x21,
    OnlineStatus = 0x24,
    Nickname = 0x30,
    FriendMessage = 0x40,
    FriendAction = 0x41,

    /// Noise IK handshake message with replay nonce and timestamp.
    NoiseHandshake = 0xf0,
    /// AEAD-protected inner packet.
    NoiseMessage = 0xf1,
    /// Capability advertisement from a peer that has not negotiated yet.
    VersionNegotiationRequest = 0xf2,
    /// The version agreed by the responder.
    VersionNegotiationResponse = 0xf3,
}

impl PacketType {
    /// Tags consumed by the session layer itself rather than by applications.
    pub fn is_transport_control(self) -> bool {
        matches!(
            self,
            Self::NoiseHandshake
                | Self::NoiseMessage
                | Self::VersionNegotiationRequest
                | Self::VersionNegotiationResponse
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::PingRequest),
            0x01 => Ok(Self::PingResponse),
            0x02 => Ok(Self::GetNodes),
            0x04 => Ok(Self::SendNodes),
            0x18 => Ok(Self::CookieRequest),
            0x19 => Ok(Self::CookieResponse),
            0x1a => Ok(Self::CryptoHandshake),
            0x1b => Ok(Self::CryptoData),
            0x20 => Ok(Self::FriendRequest),
            0x21 => Ok(Self::LanDiscovery),
            0x24 => Ok(Self::OnlineStatus),
            0x30 => Ok(Self::Nickname),
            0x40 => Ok(Self::FriendMessage),
            0x41 => Ok(Self::FriendAction),
            0xf0 => Ok(Self::NoiseHandshake),
            0xf1 => Ok(Self::NoiseMessage),
            0xf2 => Ok(Self::VersionNegotiationRequest),
            0xf3 => Ok(Self::VersionNegotiationResponse),
            _ => Err(WireError::UnknownPacketType(value)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value as u8
    }
}

/// A typed packet: `[type(1)][data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub data: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            data: data.into(),
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.packet_type as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        if bytes.is_empty() {
            return Err(WireError::TooShort(0, 1));
        }
        let packet_type = PacketType::try_from(bytes[0])?;
        Ok(Self {
            packet_type,
            data: bytes.slice(1..),
        })
    }
}
