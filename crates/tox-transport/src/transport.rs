//! The unreliable packet transport the session layer runs on.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<A> {
    pub data: Bytes,
    pub from: A,
}

/// Opaque, unordered, unreliable datagram delivery.
///
/// Implementations may drop, duplicate or reorder packets.
pub trait PacketTransport: Send + Sync + 'static {
    /// Peer address; used as a map key by the session layer.
    type Addr: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn send(
        &self,
        data: Bytes,
        to: &Self::Addr,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Deliver every inbound datagram to `sink`, replacing any earlier sink.
    fn register_inbound(&self, sink: mpsc::Sender<Datagram<Self::Addr>>);

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
