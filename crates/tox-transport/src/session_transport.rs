//! Encrypted sessions multiplexed over one packet transport.
//!
//! Each peer moves through `NoSession -> HandshakeInProgress -> Established`.
//! Outbound traffic to a peer whose static key is known starts a Noise IK
//! handshake on demand; inbound handshakes are checked against the replay
//! guard before any session is created or touched. The replay trailer must
//! also match the nonce and timestamp sealed inside the Noise message, so a
//! captured handshake cannot be re-stamped and sent again.
//!
//! # Locking
//!
//! The peer -> session map has its own lock, used only for lookup, insert and
//! removal. Handshake and cipher work runs on a session before it is inserted
//! or under that session's own lock, so unrelated peers never contend. When
//! both are needed the map lock is taken first, then the peer key map.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use tox_common::config::TransportConfig;
use tox_common::helpers::constant_time_eq;
use tox_core::{
    HandshakeFrame, HandshakeStage, NoiseFrame, Packet, PacketType, WireError, MAX_PLAINTEXT_SIZE,
};
use tox_crypto::{
    validate_key, HandshakeRole, NoiseError, NoiseHandshake, ReplayGuard, Session, StaticKeypair,
};

use crate::error::TransportError;
use crate::transport::{Datagram, PacketTransport};

/// Callback for decrypted application packets.
pub type PacketHandler<A> = Arc<dyn Fn(Packet, A) + Send + Sync>;

/// Notifications for the layer above the session transport.
#[derive(Debug, Clone)]
pub enum SessionEvent<A> {
    /// A handshake with `peer` completed.
    Established {
        peer: A,
        remote_static: [u8; 32],
        /// Authenticated payload the peer put in its handshake message.
        handshake_payload: Vec<u8>,
    },
    /// A packet that is not part of the Noise transport arrived.
    Plaintext { packet: Packet, from: A },
}

type Sessions<A> = HashMap<A, Arc<Session<A>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Secure session layer over a [`PacketTransport`].
pub struct SessionTransport<T: PacketTransport> {
    transport: Arc<T>,
    keypair: StaticKeypair,
    replay_guard: ReplayGuard,
    sessions: RwLock<Sessions<T::Addr>>,
    peer_keys: RwLock<HashMap<T::Addr, [u8; 32]>>,
    handlers: RwLock<HashMap<PacketType, PacketHandler<T::Addr>>>,
    events: RwLock<Option<mpsc::Sender<SessionEvent<T::Addr>>>>,
    handshake_payload: RwLock<Bytes>,
    handshake_timeout: Duration,
    /// Bumped on every session establishment and on close.
    established: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the whole of `close` so concurrent callers return together.
    closing: AsyncMutex<()>,
}

impl<T: PacketTransport> SessionTransport<T> {
    /// Start a session transport on `transport`.
    ///
    /// Spawns the receive loop and the periodic cleanup task, so this must be
    /// called from within a Tokio runtime.
    pub fn new(
        transport: Arc<T>,
        keypair: StaticKeypair,
        config: &TransportConfig,
    ) -> Result<Arc<Self>, TransportError> {
        config.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth);
        let (shutdown, _) = watch::channel(false);
        let (established, _) = watch::channel(0);

        let this = Arc::new(Self {
            transport,
            keypair,
            replay_guard: ReplayGuard::new(config.max_handshake_age(), config.max_future_drift()),
            sessions: RwLock::new(HashMap::new()),
            peer_keys: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            events: RwLock::new(None),
            handshake_payload: RwLock::new(Bytes::new()),
            handshake_timeout: config.handshake_timeout(),
            established,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closing: AsyncMutex::new(()),
        });

        this.transport.register_inbound(inbound_tx);
        let receive = tokio::spawn(receive_loop(
            Arc::downgrade(&this),
            inbound_rx,
            this.shutdown.subscribe(),
        ));
        let cleanup = tokio::spawn(cleanup_loop(
            Arc::downgrade(&this),
            config.nonce_cleanup_interval(),
            this.shutdown.subscribe(),
        ));
        lock(&this.tasks).extend([receive, cleanup]);

        info!(
            "Session transport started with key {}",
            this.keypair.public_key_hex()
        );
        Ok(this)
    }

    pub fn local_public_key(&self) -> &[u8; 32] {
        self.keypair.public_key()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay_guard
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Register a peer's static key so traffic to it can be encrypted.
    ///
    /// Does not send anything. Re-registering a different key evicts any
    /// session established under the old one.
    pub async fn add_peer(
        &self,
        addr: T::Addr,
        static_public_key: &[u8],
    ) -> Result<(), TransportError> {
        let key = validate_key(static_public_key, "peer static key")?;
        let previous = self.peer_keys.write().await.insert(addr.clone(), key);

        if previous.is_some_and(|old| old != key) {
            self.sessions.write().await.remove(&addr);
            info!("Static key for {:?} changed, session evicted", addr);
        } else {
            debug!("Added peer {:?}", addr);
        }
        Ok(())
    }

    /// Forget a peer's key and drop its session.
    pub async fn remove_peer(&self, addr: &T::Addr) -> bool {
        let had_key = self.peer_keys.write().await.remove(addr).is_some();
        let had_session = self.sessions.write().await.remove(addr).is_some();
        if had_key || had_session {
            debug!("Removed peer {:?}", addr);
        }
        had_key || had_session
    }

    pub async fn peer_key(&self, addr: &T::Addr) -> Option<[u8; 32]> {
        self.peer_keys.read().await.get(addr).copied()
    }

    pub async fn session(&self, addr: &T::Addr) -> Option<Arc<Session<T::Addr>>> {
        self.sessions.read().await.get(addr).cloned()
    }

    pub async fn is_established(&self, addr: &T::Addr) -> bool {
        match self.session(addr).await {
            Some(session) => session.is_complete().await,
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Set the handler for decrypted packets of `packet_type`. Last one wins.
    pub async fn register_handler<F>(&self, packet_type: PacketType, handler: F)
    where
        F: Fn(Packet, T::Addr) + Send + Sync + 'static,
    {
        if self
            .handlers
            .write()
            .await
            .insert(packet_type, Arc::new(handler))
            .is_some()
        {
            debug!("Replaced handler for {:?}", packet_type);
        }
    }

    /// Receive establishment notices and non-Noise packets.
    pub async fn subscribe(&self, sink: mpsc::Sender<SessionEvent<T::Addr>>) {
        *self.events.write().await = Some(sink);
    }

    /// Payload sent inside every handshake message from now on.
    pub async fn set_handshake_payload(&self, payload: Bytes) {
        *self.handshake_payload.write().await = payload;
    }

    /// Encrypt `packet` and send it to `to`, handshaking first if needed.
    ///
    /// Waits up to the handshake timeout for a new session. On timeout the
    /// pending session is dropped so a retry starts over.
    pub async fn send(&self, packet: &Packet, to: &T::Addr) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let inner = packet.encode();
        if inner.len() > MAX_PLAINTEXT_SIZE {
            return Err(WireError::TooLarge(inner.len(), MAX_PLAINTEXT_SIZE).into());
        }

        let session = self.establish(to).await?;
        let frame = session.encrypt(&inner).await?;
        self.transport.send(frame.into_packet().encode(), to).await
    }

    async fn establish(&self, to: &T::Addr) -> Result<Arc<Session<T::Addr>>, TransportError> {
        let mut established = self.established.subscribe();

        let (session, initiation) = loop {
            if let Some(session) = self.session(to).await {
                break (session, None);
            }

            let (fresh, key, frame) = self.initiate(to).await?;
            let mut sessions = self.sessions.write().await;
            // The key was removed or replaced while we were handshaking.
            if self.peer_keys.read().await.get(to) != Some(&key) {
                continue;
            }
            match sessions.entry(to.clone()) {
                Entry::Occupied(current) => break (current.get().clone(), None),
                Entry::Vacant(slot) => {
                    slot.insert(fresh.clone());
                    break (fresh, Some(frame));
                }
            }
        };

        if session.is_complete().await {
            return Ok(session);
        }

        if let Some(frame) = initiation {
            debug!("Sending handshake initiation to {:?}", to);
            if let Err(e) = self.transport.send(frame, to).await {
                self.remove_session_if(to, &session).await;
                return Err(e);
            }
        }

        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            // Simultaneous open can replace our initiator session with a
            // responder one, so follow whatever the map holds.
            match self.session(to).await {
                Some(current) if current.is_complete().await => return Ok(current),
                Some(_) => {}
                None => return Err(TransportError::NoSession(format!("{:?}", to))),
            }

            match tokio::time::timeout_at(deadline, established.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => {
                    self.remove_session_if(to, &session).await;
                    warn!(
                        "Handshake with {:?} timed out after {:?}",
                        to, self.handshake_timeout
                    );
                    return Err(TransportError::HandshakeTimeout(self.handshake_timeout));
                }
            }
        }
    }

    /// Build an initiator session and its encoded first message, without
    /// touching the session map.
    async fn initiate(
        &self,
        to: &T::Addr,
    ) -> Result<(Arc<Session<T::Addr>>, [u8; 32], Bytes), TransportError> {
        let key = self
            .peer_key(to)
            .await
            .ok_or_else(|| TransportError::PeerNotSupported(format!("{:?}", to)))?;

        let handshake = NoiseHandshake::new(
            self.keypair.private_key(),
            Some(&key),
            HandshakeRole::Initiator,
        )?;
        let session = Arc::new(Session::new(to.clone(), handshake));

        let payload = self.handshake_payload.read().await.clone();
        let message = session
            .advance_handshake(&payload, None)
            .await?
            .ok_or(NoiseError::InvalidMessage)?;

        let frame = HandshakeFrame {
            stage: HandshakeStage::Initiation,
            message: Bytes::from(message),
            nonce: *session.handshake_nonce(),
            timestamp: session.handshake_timestamp(),
        };
        Ok((session, key, frame.into_packet()?.encode()))
    }

    /// Process one datagram from the underlying transport.
    ///
    /// Errors mean the datagram was dropped; none of them are fatal to the
    /// transport.
    pub async fn handle_inbound(&self, data: Bytes, from: T::Addr) -> Result<(), TransportError> {
        let packet = Packet::decode(data)?;
        match packet.packet_type {
            PacketType::NoiseHandshake => self.handle_handshake(&packet.data, from).await,
            PacketType::NoiseMessage => self.handle_message(&packet.data, from).await,
            other => {
                let events = self.events.read().await.clone();
                match events {
                    Some(events) => events
                        .send(SessionEvent::Plaintext { packet, from })
                        .await
                        .map_err(|_| TransportError::UnexpectedPacket(other)),
                    None => Err(TransportError::UnexpectedPacket(other)),
                }
            }
        }
    }

    async fn handle_handshake(&self, body: &Bytes, from: T::Addr) -> Result<(), TransportError> {
        let frame = HandshakeFrame::decode(body)?;

        if let Err(e) = self.replay_guard.validate(&frame.nonce, frame.timestamp) {
            warn!("Dropping handshake from {:?}: {}", from, e);
            return Err(e.into());
        }

        match frame.stage {
            HandshakeStage::Initiation => self.accept_initiation(frame, from).await,
            HandshakeStage::Response => self.complete_initiation(frame, from).await,
        }
    }

    /// Answer an initiation as responder.
    async fn accept_initiation(
        &self,
        frame: HandshakeFrame,
        from: T::Addr,
    ) -> Result<(), TransportError> {
        let existing = self.session(&from).await;
        if !self.should_answer(existing.as_ref(), &from, frame.timestamp).await {
            return Ok(());
        }

        let handshake =
            NoiseHandshake::new(self.keypair.private_key(), None, HandshakeRole::Responder)?;
        let session = Arc::new(Session::new(from.clone(), handshake));
        let payload = self.handshake_payload.read().await.clone();
        let reply = session
            .advance_handshake(&payload, Some(&frame.message[..]))
            .await?
            .ok_or(NoiseError::InvalidMessage)?;
        self.verify_binding(&session, &frame, &from).await?;

        let remote = session
            .remote_static()
            .await
            .ok_or(NoiseError::InvalidMessage)?;
        {
            let mut keys = self.peer_keys.write().await;
            match keys.get(&from) {
                Some(expected) if !constant_time_eq(expected, &remote) => {
                    warn!("Handshake from {:?} used an unexpected static key", from);
                    return Err(NoiseError::InvalidKey(format!(
                        "static key from {:?} does not match the registered key",
                        from
                    ))
                    .into());
                }
                Some(_) => {}
                None => {
                    keys.insert(from.clone(), remote);
                }
            }
        }

        {
            // The map may have changed while the handshake ran.
            let mut sessions = self.sessions.write().await;
            if !self
                .should_answer(sessions.get(&from), &from, frame.timestamp)
                .await
            {
                return Ok(());
            }
            sessions.insert(from.clone(), session.clone());
        }

        let response = HandshakeFrame {
            stage: HandshakeStage::Response,
            message: Bytes::from(reply),
            nonce: *session.handshake_nonce(),
            timestamp: session.handshake_timestamp(),
        };
        self.transport
            .send(response.into_packet()?.encode(), &from)
            .await?;

        info!("Session established with {:?} (responder)", from);
        self.notify_established(&from, &session).await;
        Ok(())
    }

    /// Whether an initiation created at `timestamp` may replace `existing`.
    async fn should_answer(
        &self,
        existing: Option<&Arc<Session<T::Addr>>>,
        from: &T::Addr,
        timestamp: i64,
    ) -> bool {
        let Some(existing) = existing else {
            return true;
        };

        if existing.role() == HandshakeRole::Initiator && !existing.is_complete().await {
            // Both sides initiated. The smaller static key yields and
            // answers; the other waits for that answer.
            let ours_wins = match self.peer_keys.read().await.get(from) {
                Some(theirs) => self.keypair.public_key() > theirs,
                None => false,
            };
            if ours_wins {
                debug!("Simultaneous open with {:?}, keeping our initiation", from);
                return false;
            }
        } else if let Some(established_at) = existing.established_at().await {
            // A crossed initiation from a simultaneous open can arrive
            // after its handshake was settled the other way.
            if timestamp <= established_at {
                debug!("Ignoring superseded initiation from {:?}", from);
                return false;
            }
        }
        true
    }

    /// Reject a handshake whose plaintext trailer differs from the nonce and
    /// timestamp the peer sealed into the Noise message.
    async fn verify_binding(
        &self,
        session: &Session<T::Addr>,
        frame: &HandshakeFrame,
        from: &T::Addr,
    ) -> Result<(), TransportError> {
        match session.remote_binding().await {
            Some((nonce, timestamp))
                if constant_time_eq(&nonce, &frame.nonce) && timestamp == frame.timestamp =>
            {
                Ok(())
            }
            _ => {
                warn!("Handshake from {:?} carries a re-stamped trailer", from);
                Err(NoiseError::BindingMismatch.into())
            }
        }
    }

    /// Finish a handshake we started.
    async fn complete_initiation(
        &self,
        frame: HandshakeFrame,
        from: T::Addr,
    ) -> Result<(), TransportError> {
        let session = self
            .session(&from)
            .await
            .ok_or_else(|| TransportError::NoSession(format!("{:?}", from)))?;
        if session.role() != HandshakeRole::Initiator || session.is_complete().await {
            return Err(TransportError::UnexpectedPacket(PacketType::NoiseHandshake));
        }

        let completed = match session
            .advance_handshake(&[], Some(&frame.message[..]))
            .await
        {
            Ok(_) => self.verify_binding(&session, &frame, &from).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = completed {
            // The handshake state is unusable after a failed read.
            self.remove_session_if(&from, &session).await;
            warn!("Handshake response from {:?} rejected: {}", from, e);
            return Err(e);
        }

        info!("Session established with {:?} (initiator)", from);
        self.notify_established(&from, &session).await;
        Ok(())
    }

    async fn handle_message(&self, body: &Bytes, from: T::Addr) -> Result<(), TransportError> {
        let frame = NoiseFrame::decode(body)?;
        let session = self
            .session(&from)
            .await
            .ok_or_else(|| TransportError::NoSession(format!("{:?}", from)))?;

        // Data can overtake the handshake response on an unordered link.
        if session.role() == HandshakeRole::Initiator && !session.is_complete().await {
            session.wait_established(self.handshake_timeout).await?;
        }

        let plaintext = session.decrypt(&frame).await?;
        let inner = Packet::decode(Bytes::from(plaintext))?;

        let handler = self.handlers.read().await.get(&inner.packet_type).cloned();
        match handler {
            Some(handler) => {
                handler(inner, from);
                Ok(())
            }
            None => Err(TransportError::NoHandler(inner.packet_type)),
        }
    }

    async fn notify_established(&self, peer: &T::Addr, session: &Session<T::Addr>) {
        self.established.send_modify(|generation| *generation = generation.wrapping_add(1));

        let events = self.events.read().await.clone();
        if let Some(events) = events {
            let event = SessionEvent::Established {
                peer: peer.clone(),
                remote_static: session.remote_static().await.unwrap_or_default(),
                handshake_payload: session.remote_payload().await,
            };
            if events.try_send(event).is_err() {
                warn!("Event queue full, establishment of {:?} not reported", peer);
            }
        }
    }

    async fn remove_session_if(&self, addr: &T::Addr, session: &Arc<Session<T::Addr>>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(addr)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(addr);
        }
    }

    /// Sweep expired replay entries and abandoned handshakes.
    pub async fn cleanup(&self) {
        let expired_nonces = self.replay_guard.cleanup();

        let snapshot: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(addr, session)| (addr.clone(), session.clone()))
            .collect();
        let mut stale = Vec::new();
        for (addr, session) in snapshot {
            if session.age() > self.handshake_timeout && !session.is_complete().await {
                stale.push((addr, session));
            }
        }
        if !stale.is_empty() {
            let mut sessions = self.sessions.write().await;
            stale.retain(|(addr, session)| {
                let unchanged = sessions
                    .get(addr)
                    .is_some_and(|current| Arc::ptr_eq(current, session));
                if unchanged {
                    sessions.remove(addr);
                }
                unchanged
            });
        }

        if expired_nonces > 0 || !stale.is_empty() {
            info!(
                "Cleaned up {} replay entries and {} stale handshakes",
                expired_nonces,
                stale.len()
            );
        }
    }

    /// Stop background tasks, then close the underlying transport.
    ///
    /// Idempotent. Concurrent callers all return once shutdown has finished.
    /// Handshakes still in flight are abandoned.
    pub async fn close(&self) -> Result<(), TransportError> {
        let _closing = self.closing.lock().await;
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        // Wake senders waiting on a handshake.
        self.established.send_modify(|generation| *generation = generation.wrapping_add(1));

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.sessions.write().await.clear();
        info!("Session transport closed");
        self.transport.close().await
    }
}

async fn receive_loop<T: PacketTransport>(
    transport: Weak<SessionTransport<T>>,
    mut inbound: mpsc::Receiver<Datagram<T::Addr>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let datagram = tokio::select! {
            _ = shutdown.changed() => break,
            datagram = inbound.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };
        let Some(transport) = transport.upgrade() else {
            break;
        };

        tokio::spawn(async move {
            let from = datagram.from.clone();
            if let Err(e) = transport.handle_inbound(datagram.data, datagram.from).await {
                debug!("Packet from {:?} dropped: {}", from, e);
            }
        });
    }
    debug!("Receive loop stopped");
}

async fn cleanup_loop<T: PacketTransport>(
    transport: Weak<SessionTransport<T>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                transport.cleanup().await;
            }
        }
    }
    debug!("Cleanup task stopped");
}
