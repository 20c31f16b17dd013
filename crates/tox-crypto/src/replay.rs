//! Handshake replay protection.
//!
//! Every handshake message carries a random 32-byte nonce and the Unix time
//! its sender created the handshake. A message is accepted once, and only
//! while its timestamp is inside `[now - max_age, now + max_future_drift]`.
//!
//! Accepted nonces are remembered for `2 × max_age`: a message recorded at the
//! very end of its validity window must stay discoverable for another full
//! window before it can be forgotten. Memory is therefore bounded by the
//! number of handshakes accepted in that period.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tox_core::HANDSHAKE_NONCE_SIZE;

pub const DEFAULT_MAX_HANDSHAKE_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_FUTURE_DRIFT: Duration = Duration::from_secs(60);

/// Reasons a handshake message is refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("handshake too old: {age_secs}s exceeds {max_secs}s")]
    HandshakeTooOld { age_secs: i64, max_secs: i64 },

    #[error("handshake from the future: {ahead_secs}s ahead exceeds {max_secs}s")]
    HandshakeFromFuture { ahead_secs: i64, max_secs: i64 },

    #[error("handshake replay detected")]
    HandshakeReplay,
}

/// Nonce cache guarding handshake processing.
#[derive(Debug)]
pub struct ReplayGuard {
    max_age: i64,
    max_future_drift: i64,
    /// nonce -> Unix time it was first accepted
    seen: Mutex<HashMap<[u8; HANDSHAKE_NONCE_SIZE], i64>>,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDSHAKE_AGE, DEFAULT_MAX_FUTURE_DRIFT)
    }
}

impl ReplayGuard {
    pub fn new(max_age: Duration, max_future_drift: Duration) -> Self {
        Self {
            max_age: max_age.as_secs() as i64,
            max_future_drift: max_future_drift.as_secs() as i64,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Validate against the current clock.
    pub fn validate(
        &self,
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        timestamp: i64,
    ) -> Result<(), ReplayError> {
        self.validate_at(nonce, timestamp, crate::unix_time())
    }

    /// Validate as if the clock read `now`.
    ///
    /// The uniqueness check and the insert happen under one lock, so two
    /// concurrent copies of a message can never both pass.
    pub fn validate_at(
        &self,
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        timestamp: i64,
        now: i64,
    ) -> Result<(), ReplayError> {
        let age = now.saturating_sub(timestamp);
        if age > self.max_age {
            return Err(ReplayError::HandshakeTooOld {
                age_secs: age,
                max_secs: self.max_age,
            });
        }

        let ahead = timestamp.saturating_sub(now);
        if ahead > self.max_future_drift {
            return Err(ReplayError::HandshakeFromFuture {
                ahead_secs: ahead,
                max_secs: self.max_future_drift,
            });
        }

        match self.lock().entry(*nonce) {
            Entry::Occupied(_) => Err(ReplayError::HandshakeReplay),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(())
            }
        }
    }

    /// Forget nonces recorded more than `2 × max_age` ago.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(crate::unix_time())
    }

    /// Sweep as if the clock read `now`. Returns how many entries were dropped.
    pub fn cleanup_at(&self, now: i64) -> usize {
        let retention = self.retention_secs();
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, recorded| now.saturating_sub(*recorded) <= retention);
        before - seen.len()
    }

    /// How long an accepted nonce is remembered.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs() as u64)
    }

    fn retention_secs(&self) -> i64 {
        self.max_age.saturating_mul(2)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<[u8; HANDSHAKE_NONCE_SIZE], i64>> {
        // The map holds no invariants a panicking holder could break halfway.
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
