//! Secure session transport for Tox peers.
//!
//! This crate provides:
//! - [`SessionTransport`]: per-peer Noise IK sessions multiplexed over one
//!   unreliable packet transport, with handshake replay protection
//! - [`VersionNegotiator`]: pure protocol version selection
//! - [`NegotiatingTransport`]: per-peer version negotiation that routes traffic
//!   to the encrypted or legacy path
//! - [`LoopbackNetwork`] and [`UdpTransport`] packet transports
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use tox_common::TransportConfig;
//! use tox_core::{Packet, PacketType};
//! use tox_crypto::StaticKeypair;
//! use tox_transport::{LoopbackAddr, LoopbackNetwork, SessionTransport};
//!
//! # async fn demo() -> Result<(), tox_transport::TransportError> {
//! let network = LoopbackNetwork::new();
//! let config = TransportConfig::default();
//! let bob_key = StaticKeypair::generate();
//! let bob_public = *bob_key.public_key();
//!
//! let alice = SessionTransport::new(network.endpoint("alice"), StaticKeypair::generate(), &config)?;
//! let bob = SessionTransport::new(network.endpoint("bob"), bob_key, &config)?;
//! bob.register_handler(PacketType::FriendMessage, |packet, from| {
//!     println!("{} says {:?}", from, packet.data);
//! })
//! .await;
//!
//! alice.add_peer(LoopbackAddr::from("bob"), &bob_public).await?;
//! alice
//!     .send(
//!         &Packet::new(PacketType::FriendMessage, Bytes::from_static(b"hi")),
//!         &LoopbackAddr::from("bob"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod loopback;
pub mod negotiating;
pub mod negotiator;
pub mod session_transport;
pub mod transport;
pub mod udp;

pub use error::{Disposition, TransportError};
pub use loopback::{LoopbackAddr, LoopbackNetwork, LoopbackTransport};
pub use negotiating::NegotiatingTransport;
pub use negotiator::{select_best_version, ProtocolCapabilities, VersionNegotiator};
pub use session_transport::{PacketHandler, SessionEvent, SessionTransport};
pub use transport::{Datagram, PacketTransport};
pub use udp::UdpTransport;
