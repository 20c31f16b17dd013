//! Common helper functions.

use crate::error::{Error, Result};

/// Performs a constant-time comparison of two byte strings.
/// Used when comparing static public keys learned from the network.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Decode a hex string into a 32-byte key.
pub fn parse_key_hex(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).map_err(Error::invalid_key)?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        Error::invalid_key(format!("expected 32 bytes, got {}", b.len()))
    })
}

/// Parse a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
