//! X25519 static keys.
//!
//! A node's long-term identity on the secure transport is its X25519 static
//! public key. Peers learn it out of band (DHT, friend list) and pass it to
//! `add_peer`; the IK handshake then authenticates it.
//!
//! # Example
//!
//! ```
//! use tox_crypto::keys::StaticKeypair;
//!
//! let keypair = StaticKeypair::generate();
//! let restored = StaticKeypair::from_private_bytes(keypair.private_key());
//! assert_eq!(keypair.public_key(), restored.public_key());
//! ```

use std::fmt;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::noise::NoiseError;

/// X25519 static keypair.
///
/// The private half is zeroized on drop.
pub struct StaticKeypair {
    private: Zeroizing<[u8; 32]>,
    public: [u8; 32],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut private = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut private[..]);
        Self::from_private_bytes(&private)
    }

    /// Rebuild a keypair from its private half.
    pub fn from_private_bytes(private: &[u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(*private);
        let public = x25519_dalek::PublicKey::from(&secret);

        Self {
            private: Zeroizing::new(*private),
            public: *public.as_bytes(),
        }
    }

    /// Parse a hex-encoded private key.
    pub fn from_private_hex(s: &str) -> Result<Self, NoiseError> {
        let private = Zeroizing::new(
            tox_common::helpers::parse_key_hex(s)
                .map_err(|e| NoiseError::InvalidKey(e.to_string()))?,
        );
        Ok(Self::from_private_bytes(&private))
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// # Security
    /// Handle with care! These bytes are the node's identity.
    pub fn private_key(&self) -> &[u8; 32] {
        &self.private
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public)
    }
}

impl Clone for StaticKeypair {
    fn clone(&self) -> Self {
        Self {
            private: self.private.clone(),
            public: self.public,
        }
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Check that `key` is a usable 32-byte X25519 key.
pub fn validate_key(key: &[u8], what: &str) -> Result<[u8; 32], NoiseError> {
    let key: [u8; 32] = key.try_into().map_err(|_| {
        NoiseError::InvalidKey(format!("{} must be 32 bytes, got {}", what, key.len()))
    })?;
    if key == [0u8; 32] {
        return Err(NoiseError::InvalidKey(format!("{} is all zeroes", what)));
    }
    Ok(key)
}
