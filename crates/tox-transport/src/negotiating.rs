//! Version negotiation in front of the session transport.
//!
//! Callers just `send`. The first packet to an unknown peer triggers a
//! `VersionNegotiationRequest`; the agreed version is cached per peer and
//! decides whether traffic goes through a Noise session or the legacy
//! plaintext path.
//!
//! The request/response exchange is unauthenticated, so it is only a hint.
//! Every Noise handshake carries both sides' advertisements, and the version
//! is re-derived from that authenticated copy once the session is up. A peer
//! known to speak Noise is never moved back to plaintext by an
//! unauthenticated packet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tox_common::config::TransportConfig;
use tox_core::{Packet, PacketType, ProtocolVersion, VersionAdvertisement, VersionResponse};
use tox_crypto::StaticKeypair;

use crate::error::TransportError;
use crate::negotiator::{ProtocolCapabilities, VersionNegotiator};
use crate::session_transport::{PacketHandler, SessionEvent, SessionTransport};
use crate::transport::PacketTransport;

/// `None` tells a waiter the peer's choice was refused.
type Waiters = Vec<oneshot::Sender<Option<ProtocolVersion>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport that negotiates a protocol version per peer.
pub struct NegotiatingTransport<T: PacketTransport> {
    sessions: Arc<SessionTransport<T>>,
    negotiator: VersionNegotiator,
    peer_versions: RwLock<HashMap<T::Addr, ProtocolVersion>>,
    /// Senders waiting for a negotiation with each peer to finish.
    pending: Mutex<HashMap<T::Addr, Waiters>>,
    /// Handlers for packets arriving on the legacy path.
    legacy_handlers: RwLock<HashMap<PacketType, PacketHandler<T::Addr>>>,
    shutdown: watch::Sender<bool>,
    /// Locked for the whole of `close`.
    event_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<T: PacketTransport> NegotiatingTransport<T> {
    /// Start a session transport on `transport` and negotiate on top of it.
    pub async fn new(
        transport: Arc<T>,
        keypair: StaticKeypair,
        config: &TransportConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let sessions = SessionTransport::new(transport, keypair, config)?;
        let negotiator = VersionNegotiator::new(ProtocolCapabilities::from_config(config));

        sessions
            .set_handshake_payload(negotiator.capabilities().advertisement().encode()?)
            .await;
        let (events_tx, events_rx) = mpsc::channel(config.inbound_queue_depth);
        sessions.subscribe(events_tx).await;

        let (shutdown, _) = watch::channel(false);
        let this = Arc::new(Self {
            sessions,
            negotiator,
            peer_versions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            legacy_handlers: RwLock::new(HashMap::new()),
            shutdown,
            event_task: AsyncMutex::new(None),
        });

        let task = tokio::spawn(event_loop(
            Arc::downgrade(&this),
            events_rx,
            this.shutdown.subscribe(),
        ));
        *this.event_task.lock().await = Some(task);
        Ok(this)
    }

    pub fn sessions(&self) -> &Arc<SessionTransport<T>> {
        &self.sessions
    }

    pub fn capabilities(&self) -> &ProtocolCapabilities {
        self.negotiator.capabilities()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn add_peer(
        &self,
        addr: T::Addr,
        static_public_key: &[u8],
    ) -> Result<(), TransportError> {
        self.sessions.add_peer(addr, static_public_key).await
    }

    /// Drop the peer's key, session and cached version.
    pub async fn remove_peer(&self, addr: &T::Addr) -> bool {
        let had_version = self.peer_versions.write().await.remove(addr).is_some();
        self.sessions.remove_peer(addr).await || had_version
    }

    /// Handle `packet_type` on both the encrypted and the legacy path.
    pub async fn register_handler<F>(&self, packet_type: PacketType, handler: F)
    where
        F: Fn(Packet, T::Addr) + Send + Sync + 'static,
    {
        let handler: PacketHandler<T::Addr> = Arc::new(handler);
        let encrypted = handler.clone();
        self.sessions
            .register_handler(packet_type, move |packet, from| encrypted(packet, from))
            .await;
        self.legacy_handlers
            .write()
            .await
            .insert(packet_type, handler);
    }

    pub async fn get_peer_version(&self, addr: &T::Addr) -> Option<ProtocolVersion> {
        self.peer_versions.read().await.get(addr).copied()
    }

    /// Override the cached version for a peer.
    pub async fn set_peer_version(&self, addr: T::Addr, version: ProtocolVersion) {
        let previous = self.peer_versions.write().await.insert(addr.clone(), version);
        if previous != Some(version) {
            debug!("Peer {:?} now at protocol {}", addr, version);
        }
    }

    /// Send `packet`, negotiating a version with `to` first if none is cached.
    pub async fn send(&self, packet: &Packet, to: &T::Addr) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let version = match self.get_peer_version(to).await {
            Some(version) => version,
            None => self.negotiate(to).await?,
        };

        if version.is_noise() {
            self.sessions.send(packet, to).await
        } else if self.capabilities().allow_legacy_fallback {
            self.sessions
                .transport()
                .send(packet.encode(), to)
                .await
        } else {
            Err(TransportError::PeerNotSupported(format!("{:?}", to)))
        }
    }

    async fn negotiate(&self, to: &T::Addr) -> Result<ProtocolVersion, TransportError> {
        let caps = self.capabilities();
        let (tx, rx) = oneshot::channel();

        let first = {
            let mut pending = lock(&self.pending);
            let waiters = pending.entry(to.clone()).or_default();
            waiters.push(tx);
            waiters.len() == 1
        };

        if first {
            debug!("Negotiating protocol version with {:?}", to);
            let request = Packet::new(
                PacketType::VersionNegotiationRequest,
                caps.advertisement().encode()?,
            );
            if let Err(e) = self.sessions.transport().send(request.encode(), to).await {
                lock(&self.pending).remove(to);
                return Err(e);
            }
        }

        match tokio::time::timeout(caps.negotiation_timeout, rx).await {
            Ok(Ok(Some(version))) => Ok(version),
            Ok(Ok(None)) => Err(TransportError::PeerNotSupported(format!("{:?}", to))),
            // Timed out, or another waiter timed out first and dropped us.
            Ok(Err(_)) | Err(_) => {
                lock(&self.pending).remove(to);
                if let Some(version) = self.get_peer_version(to).await {
                    return Ok(version);
                }
                if caps.allow_legacy_fallback {
                    warn!(
                        "Version negotiation with {:?} timed out, falling back to {}",
                        to,
                        ProtocolVersion::LEGACY
                    );
                    self.set_peer_version(to.clone(), ProtocolVersion::LEGACY)
                        .await;
                    Ok(ProtocolVersion::LEGACY)
                } else {
                    Err(TransportError::NegotiationTimeout(caps.negotiation_timeout))
                }
            }
        }
    }

    fn resolve_pending(&self, peer: &T::Addr, version: Option<ProtocolVersion>) {
        let waiters = lock(&self.pending).remove(peer);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(version);
        }
    }

    /// Refuse to move a peer with a confirmed secure version to plaintext.
    async fn guard_downgrade(
        &self,
        peer: &T::Addr,
        agreed: ProtocolVersion,
    ) -> Result<(), TransportError> {
        match self.get_peer_version(peer).await {
            Some(known) if known.is_noise() && !agreed.is_noise() => {
                warn!(
                    "Ignoring downgrade of {:?} from {} to {}",
                    peer, known, agreed
                );
                Err(TransportError::DowngradeRejected(format!("{:?}", peer)))
            }
            _ => Ok(()),
        }
    }

    async fn handle_event(&self, event: SessionEvent<T::Addr>) -> Result<(), TransportError> {
        match event {
            SessionEvent::Established {
                peer,
                handshake_payload,
                ..
            } => {
                self.reconfirm(peer, &handshake_payload).await;
                Ok(())
            }
            SessionEvent::Plaintext { packet, from } => self.handle_plaintext(packet, from).await,
        }
    }

    /// Process a packet that arrived outside any Noise session.
    pub async fn handle_plaintext(
        &self,
        packet: Packet,
        from: T::Addr,
    ) -> Result<(), TransportError> {
        match packet.packet_type {
            PacketType::VersionNegotiationRequest => self.handle_request(&packet.data, from).await,
            PacketType::VersionNegotiationResponse => {
                self.handle_response(&packet.data, from).await
            }
            _ => self.handle_legacy(packet, from).await,
        }
    }

    async fn handle_request(&self, body: &Bytes, from: T::Addr) -> Result<(), TransportError> {
        let advertisement = VersionAdvertisement::decode(body)?;
        let agreed = match self.negotiator.select_best_version(&advertisement.supported) {
            Ok(agreed) => agreed,
            Err(e) => {
                warn!("Refusing version negotiation from {:?}: {}", from, e);
                return Err(e);
            }
        };
        self.guard_downgrade(&from, agreed).await?;

        self.set_peer_version(from.clone(), agreed).await;
        let response = Packet::new(
            PacketType::VersionNegotiationResponse,
            VersionResponse { agreed }.encode(),
        );
        self.sessions
            .transport()
            .send(response.encode(), &from)
            .await?;

        debug!("Agreed protocol {} with {:?}", agreed, from);
        // Selection is symmetric, so our own pending request resolves the same way.
        self.resolve_pending(&from, Some(agreed));
        Ok(())
    }

    async fn handle_response(&self, body: &Bytes, from: T::Addr) -> Result<(), TransportError> {
        let VersionResponse { agreed } = VersionResponse::decode(body)?;

        if !lock(&self.pending).contains_key(&from) {
            return Err(TransportError::UnexpectedPacket(
                PacketType::VersionNegotiationResponse,
            ));
        }
        if !self.capabilities().accepts(agreed) {
            warn!("Peer {:?} chose unacceptable protocol {}", from, agreed);
            self.resolve_pending(&from, None);
            return Err(TransportError::PeerNotSupported(format!("{:?}", from)));
        }
        self.guard_downgrade(&from, agreed).await?;

        self.set_peer_version(from.clone(), agreed).await;
        debug!("Agreed protocol {} with {:?}", agreed, from);
        self.resolve_pending(&from, Some(agreed));
        Ok(())
    }

    async fn handle_legacy(&self, packet: Packet, from: T::Addr) -> Result<(), TransportError> {
        match self.get_peer_version(&from).await {
            Some(version) if version.is_noise() => {
                warn!(
                    "Dropping plaintext {:?} from secure peer {:?}",
                    packet.packet_type, from
                );
                return Err(TransportError::DowngradeRejected(format!("{:?}", from)));
            }
            Some(_) => {}
            None if self.capabilities().allow_legacy_fallback => {}
            None => return Err(TransportError::PeerNotSupported(format!("{:?}", from))),
        }

        let handler = self
            .legacy_handlers
            .read()
            .await
            .get(&packet.packet_type)
            .cloned();
        match handler {
            Some(handler) => {
                handler(packet, from);
                Ok(())
            }
            None => Err(TransportError::NoHandler(packet.packet_type)),
        }
    }

    /// Re-derive the version from the advertisement authenticated by the
    /// handshake and correct the cache if the plaintext exchange disagreed.
    async fn reconfirm(&self, peer: T::Addr, handshake_payload: &[u8]) {
        let agreed = match VersionAdvertisement::decode(handshake_payload) {
            Ok(advertisement) => match self.negotiator.select_best_version(&advertisement.supported)
            {
                Ok(agreed) if agreed.is_noise() => agreed,
                _ => {
                    warn!(
                        "Peer {:?} completed a Noise handshake but advertises no shared secure version",
                        peer
                    );
                    ProtocolVersion::NOISE_IK
                }
            },
            Err(e) => {
                debug!("No version advertisement from {:?}: {}", peer, e);
                ProtocolVersion::NOISE_IK
            }
        };

        let previous = self
            .peer_versions
            .write()
            .await
            .insert(peer.clone(), agreed);
        match previous {
            Some(previous) if previous != agreed => warn!(
                "Corrected protocol for {:?} from {} to {} after handshake",
                peer, previous, agreed
            ),
            None => debug!("Confirmed protocol {} with {:?}", agreed, peer),
            _ => {}
        }
        self.resolve_pending(&peer, Some(agreed));
    }

    /// Stop the event task and close the session transport. Idempotent;
    /// concurrent callers all wait for the first to finish.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut event_task = self.event_task.lock().await;
        if self.shutdown.send_replace(true) {
            return Ok(());
        }

        if let Some(task) = event_task.take() {
            if let Err(e) = task.await {
                warn!("Negotiation task ended abnormally: {}", e);
            }
        }
        lock(&self.pending).clear();

        info!("Negotiating transport closed");
        self.sessions.close().await
    }
}

async fn event_loop<T: PacketTransport>(
    transport: Weak<NegotiatingTransport<T>>,
    mut events: mpsc::Receiver<SessionEvent<T::Addr>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(transport) = transport.upgrade() else {
            break;
        };

        tokio::spawn(async move {
            if let Err(e) = transport.handle_event(event).await {
                debug!("Session event dropped: {}", e);
            }
        });
    }
    debug!("Negotiation event loop stopped");
}
