//! Protocol version selection. No I/O.
//!
//! Two peers agree on the highest version both support. When they share
//! nothing modern they fall back to [`ProtocolVersion::LEGACY`], unless the
//! local policy forbids plaintext, in which case negotiation fails.

use std::time::Duration;

use tox_common::config::TransportConfig;
use tox_core::{ProtocolVersion, VersionAdvertisement};

use crate::error::TransportError;

/// What this node can speak and how it negotiates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCapabilities {
    /// Sorted ascending, no duplicates.
    supported: Vec<ProtocolVersion>,
    preferred: ProtocolVersion,
    pub negotiation_timeout: Duration,
    pub allow_legacy_fallback: bool,
}

impl ProtocolCapabilities {
    pub fn new(
        supported: impl IntoIterator<Item = ProtocolVersion>,
        preferred: ProtocolVersion,
    ) -> Self {
        let mut supported: Vec<_> = supported.into_iter().collect();
        supported.sort_unstable();
        supported.dedup();

        Self {
            supported,
            preferred,
            negotiation_timeout: Duration::from_secs(5),
            allow_legacy_fallback: true,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        let mut caps = Self::new(
            config.supported_versions.iter().copied().map(ProtocolVersion),
            ProtocolVersion(config.preferred_version),
        );
        caps.negotiation_timeout = config.negotiation_timeout();
        caps.allow_legacy_fallback = config.allow_legacy_fallback;
        caps
    }

    pub fn with_legacy_fallback(mut self, allow: bool) -> Self {
        self.allow_legacy_fallback = allow;
        self
    }

    pub fn supported(&self) -> &[ProtocolVersion] {
        &self.supported
    }

    pub fn preferred(&self) -> ProtocolVersion {
        self.preferred
    }

    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.supported.binary_search(&version).is_ok()
    }

    /// Advertisement sent in negotiation requests and handshake payloads.
    pub fn advertisement(&self) -> VersionAdvertisement {
        VersionAdvertisement::new(self.preferred, self.supported.clone())
    }

    /// Can a peer's announced choice be used under this policy?
    pub fn accepts(&self, version: ProtocolVersion) -> bool {
        if version == ProtocolVersion::LEGACY {
            self.allow_legacy_fallback
        } else {
            self.supports(version)
        }
    }
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

/// Pick the version two peers will use.
///
/// Returns the highest version in both lists. Without a common modern
/// version this is the legacy floor, or `PeerNotSupported` when `local`
/// forbids legacy fallback.
pub fn select_best_version(
    local: &ProtocolCapabilities,
    peer: &[ProtocolVersion],
) -> Result<ProtocolVersion, TransportError> {
    let best = local
        .supported
        .iter()
        .rev()
        .find(|version| peer.contains(version))
        .copied()
        .unwrap_or(ProtocolVersion::LEGACY);

    if !best.is_noise() && !local.allow_legacy_fallback {
        return Err(TransportError::PeerNotSupported(format!(
            "no shared secure version (peer offers {:?})",
            peer
        )));
    }
    Ok(best)
}

/// Stateless negotiator bound to local capabilities.
#[derive(Debug, Clone, Default)]
pub struct VersionNegotiator {
    capabilities: ProtocolCapabilities,
}

impl VersionNegotiator {
    pub fn new(capabilities: ProtocolCapabilities) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &ProtocolCapabilities {
        &self.capabilities
    }

    pub fn select_best_version(
        &self,
        peer: &[ProtocolVersion],
    ) -> Result<ProtocolVersion, TransportError> {
        select_best_version(&self.capabilities, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(raw: &[u8]) -> Vec<ProtocolVersion> {
        raw.iter().copied().map(ProtocolVersion).collect()
    }

    fn caps(raw: &[u8]) -> ProtocolCapabilities {
        ProtocolCapabilities::new(versions(raw), ProtocolVersion(*raw.last().unwrap()))
    }

    #[test]
    fn test_highest_common_version() {
        assert_eq!(
            select_best_version(&caps(&[1, 2]), &versions(&[1, 2, 3])).unwrap(),
            ProtocolVersion(2)
        );
        assert_eq!(
            select_best_version(&caps(&[0, 1]), &versions(&[0, 1])).unwrap(),
            ProtocolVersion::NOISE_IK
        );
    }

    #[test]
    fn test_no_overlap_falls_back_to_floor() {
        assert_eq!(
            select_best_version(&caps(&[1]), &versions(&[2, 3])).unwrap(),
            ProtocolVersion::LEGACY
        );
        assert_eq!(
            select_best_version(&caps(&[0, 1]), &[]).unwrap(),
            ProtocolVersion::LEGACY
        );
    }

    #[test]
    fn test_security_first_refuses_legacy() {
        let strict = caps(&[1]).with_legacy_fallback(false);
        assert!(matches!(
            select_best_version(&strict, &versions(&[2, 3])),
            Err(TransportError::PeerNotSupported(_))
        ));
        assert!(matches!(
            select_best_version(&strict, &versions(&[0])),
            Err(TransportError::PeerNotSupported(_))
        ));
        assert_eq!(
            select_best_version(&strict, &versions(&[0, 1])).unwrap(),
            ProtocolVersion::NOISE_IK
        );
    }

    #[test]
    fn test_selection_is_commutative() {
        let sets: [&[u8]; 5] = [&[0], &[0, 1], &[1, 2], &[1, 2, 3], &[2, 3]];
        for a in sets {
            for b in sets {
                let ab = select_best_version(&caps(a), &versions(b)).unwrap();
                let ba = select_best_version(&caps(b), &versions(a)).unwrap();
                assert_eq!(ab, ba, "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_capabilities_normalized() {
        let caps = ProtocolCapabilities::new(versions(&[3, 1, 1, 0]), ProtocolVersion(3));
        assert_eq!(caps.supported(), versions(&[0, 1, 3]).as_slice());
        assert!(caps.supports(ProtocolVersion(3)));
        assert!(!caps.supports(ProtocolVersion(2)));
    }

    #[test]
    fn test_accepts_respects_policy() {
        let caps = caps(&[0, 1]);
        assert!(caps.accepts(ProtocolVersion::LEGACY));
        assert!(caps.accepts(ProtocolVersion::NOISE_IK));
        assert!(!caps.accepts(ProtocolVersion(9)));

        let strict = caps.with_legacy_fallback(false);
        assert!(!strict.accepts(ProtocolVersion::LEGACY));
    }

    #[test]
    fn test_defaults_from_config() {
        let caps = ProtocolCapabilities::default();
        assert_eq!(caps.preferred(), ProtocolVersion::NOISE_IK);
        assert_eq!(caps.supported(), versions(&[0, 1]).as_slice());
        assert_eq!(caps.negotiation_timeout, Duration::from_secs(5));
        assert!(caps.allow_legacy_fallback);
    }
}
