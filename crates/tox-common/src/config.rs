//! Transport configuration.
//!
//! All durations are stored as whole seconds (or milliseconds where noted) so
//! the file format stays plain JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::helpers::env_bool;

pub const DEFAULT_MAX_HANDSHAKE_AGE_SECS: u64 = 5 * 60;
pub const DEFAULT_MAX_FUTURE_DRIFT_SECS: u64 = 60;
pub const DEFAULT_NONCE_CLEANUP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_INBOUND_QUEUE_DEPTH: usize = 1024;

/// Environment override for the legacy fallback policy.
pub const ENV_ALLOW_LEGACY_FALLBACK: &str = "TOX_ALLOW_LEGACY_FALLBACK";

/// Tunables for the session and negotiation layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Handshakes older than this are rejected.
    pub max_handshake_age_secs: u64,
    /// Handshakes stamped further than this in the future are rejected.
    pub max_future_drift_secs: u64,
    /// Period of the replay cache sweep.
    pub nonce_cleanup_interval_secs: u64,
    /// Upper bound on waiting for a handshake reply.
    pub handshake_timeout_secs: u64,
    /// Upper bound on waiting for a version negotiation reply.
    pub negotiation_timeout_ms: u64,
    /// Capacity of the inbound datagram queue.
    pub inbound_queue_depth: usize,
    /// Wire values of the protocol versions this node speaks.
    pub supported_versions: Vec<u8>,
    pub preferred_version: u8,
    /// When false, peers that cannot speak Noise-IK are refused.
    pub allow_legacy_fallback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_handshake_age_secs: DEFAULT_MAX_HANDSHAKE_AGE_SECS,
            max_future_drift_secs: DEFAULT_MAX_FUTURE_DRIFT_SECS,
            nonce_cleanup_interval_secs: DEFAULT_NONCE_CLEANUP_INTERVAL_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
            inbound_queue_depth: DEFAULT_INBOUND_QUEUE_DEPTH,
            supported_versions: vec![0, 1],
            preferred_version: 1,
            allow_legacy_fallback: true,
        }
    }
}

impl TransportConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env_overrides();
        debug!(path = %path.display(), "loaded transport config");
        Ok(config)
    }

    /// Apply `TOX_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.allow_legacy_fallback =
            env_bool(ENV_ALLOW_LEGACY_FALLBACK, self.allow_legacy_fallback);
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_handshake_age_secs == 0 {
            return Err(Error::config("max_handshake_age_secs must be non-zero"));
        }
        if self.nonce_cleanup_interval_secs == 0 {
            return Err(Error::config("nonce_cleanup_interval_secs must be non-zero"));
        }
        if self.handshake_timeout_secs == 0 || self.negotiation_timeout_ms == 0 {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.inbound_queue_depth == 0 {
            return Err(Error::config("inbound_queue_depth must be non-zero"));
        }
        if self.supported_versions.is_empty() {
            return Err(Error::config("supported_versions must not be empty"));
        }
        if !self.supported_versions.contains(&self.preferred_version) {
            return Err(Error::config(format!(
                "preferred version {} is not in supported_versions",
                self.preferred_version
            )));
        }
        Ok(())
    }

    pub fn max_handshake_age(&self) -> Duration {
        Duration::from_secs(self.max_handshake_age_secs)
    }

    pub fn max_future_drift(&self) -> Duration {
        Duration::from_secs(self.max_future_drift_secs)
    }

    pub fn nonce_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.nonce_cleanup_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}
