//! Protocol versions and the version negotiation messages.
//!
//! # Wire Format
//!
//! ```text
//! VersionNegotiationRequest:  [local_version(1)][count(1)][supported_versions(count)]
//! VersionNegotiationResponse: [agreed_version(1)]
//! ```
//!
//! The request body is also what each side places inside its Noise handshake
//! payload, so the same advertisement can be re-checked once it is
//! authenticated.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// A protocol generation.
///
/// Kept as a raw `u8` so that versions unknown to this build still decode and
/// simply never intersect with the local capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    /// Original unencrypted protocol; the floor every build understands.
    pub const LEGACY: Self = Self(0);
    /// Noise-IK encrypted transport.
    pub const NOISE_IK: Self = Self(1);

    /// True when traffic at this version must go through a Noise session.
    pub fn is_noise(self) -> bool {
        self >= Self::NOISE_IK
    }
}

impl From<u8> for ProtocolVersion {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LEGACY => write!(f, "legacy(0)"),
            Self::NOISE_IK => write!(f, "noise-ik(1)"),
            Self(v) => write!(f, "v{}", v),
        }
    }
}

/// The capability list a peer sends before (and inside) the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionAdvertisement {
    pub preferred: ProtocolVersion,
    pub supported: Vec<ProtocolVersion>,
}

impl VersionAdvertisement {
    /// Maximum number of versions a single advertisement can carry.
    pub const MAX_VERSIONS: usize = u8::MAX as usize;

    pub fn new(preferred: ProtocolVersion, supported: Vec<ProtocolVersion>) -> Self {
        Self {
            preferred,
            supported,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.supported.len() > Self::MAX_VERSIONS {
            return Err(WireError::TooLarge(self.supported.len(), Self::MAX_VERSIONS));
        }

        let mut buf = BytesMut::with_capacity(2 + self.supported.len());
        buf.put_u8(self.preferred.0);
        buf.put_u8(self.supported.len() as u8);
        for version in &self.supported {
            buf.put_u8(version.0);
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 2 {
            return Err(WireError::TooShort(buf.len(), 2));
        }

        let preferred = ProtocolVersion(buf[0]);
        let count = buf[1] as usize;
        let versions = &buf[2..];
        if versions.len() != count {
            return Err(WireError::Malformed(format!(
                "version count {} does not match {} trailing bytes",
                count,
                versions.len()
            )));
        }

        Ok(Self {
            preferred,
            supported: versions.iter().copied().map(ProtocolVersion).collect(),
        })
    }
}

/// The responder's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionResponse {
    pub agreed: ProtocolVersion,
}

impl VersionResponse {
    pub const SIZE: usize = 1;

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.agreed.0])
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        match buf {
            [agreed] => Ok(Self {
                agreed: ProtocolVersion(*agreed),
            }),
            [] => Err(WireError::TooShort(0, Self::SIZE)),
            _ => Err(WireError::Malformed(format!(
                "version response must be {} byte, got {}",
                Self::SIZE,
                buf.len()
            ))),
        }
    }
}
