//! Session transport behaviour over an in-memory network.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tox_common::TransportConfig;
use tox_core::{
    HandshakeFrame, HandshakeStage, Packet, PacketType, WireError, MAX_PLAINTEXT_SIZE,
};
use tox_crypto::{
    HandshakeRole, NoiseError, NoiseHandshake, ReplayError, Session, StaticKeypair,
};
use tox_transport::{
    LoopbackAddr, LoopbackNetwork, LoopbackTransport, PacketTransport, SessionTransport,
    TransportError,
};

type Inbox = mpsc::UnboundedReceiver<(Packet, LoopbackAddr)>;

struct Node {
    transport: Arc<SessionTransport<LoopbackTransport>>,
    addr: LoopbackAddr,
    public: [u8; 32],
    inbox: Inbox,
}

fn config() -> TransportConfig {
    TransportConfig {
        handshake_timeout_secs: 2,
        ..TransportConfig::default()
    }
}

async fn node(network: &Arc<LoopbackNetwork>, name: &str) -> Node {
    tox_common::init_tracing_with_default("warn");
    let keypair = StaticKeypair::generate();
    let public = *keypair.public_key();
    let transport = SessionTransport::new(network.endpoint(name), keypair, &config()).unwrap();

    let (tx, inbox) = mpsc::unbounded_channel();
    transport
        .register_handler(PacketType::FriendMessage, move |packet, from| {
            let _ = tx.send((packet, from));
        })
        .await;

    Node {
        transport,
        addr: LoopbackAddr::from(name),
        public,
        inbox,
    }
}

fn message(text: &'static str) -> Packet {
    Packet::new(PacketType::FriendMessage, Bytes::from_static(text.as_bytes()))
}

async fn recv(inbox: &mut Inbox) -> (Packet, LoopbackAddr) {
    timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("timed out waiting for a packet")
        .expect("handler dropped")
}

/// Encoded initiation from `local` to `remote`, optionally re-stamped.
fn initiation(local: &StaticKeypair, remote: &[u8; 32], timestamp: Option<i64>) -> Bytes {
    let mut handshake =
        NoiseHandshake::new(local.private_key(), Some(remote), HandshakeRole::Initiator).unwrap();
    let (message, _) = handshake.write_message(&[], None).unwrap();

    HandshakeFrame {
        stage: HandshakeStage::Initiation,
        message: Bytes::from(message.unwrap()),
        nonce: *handshake.nonce(),
        timestamp: timestamp.unwrap_or_else(|| handshake.timestamp()),
    }
    .into_packet()
    .unwrap()
    .encode()
}

#[tokio::test]
async fn test_message_delivered_exactly_once() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    alice.transport.send(&message("hi"), &bob.addr).await.unwrap();

    let (packet, from) = recv(&mut bob.inbox).await;
    assert_eq!(packet, message("hi"));
    assert_eq!(from, alice.addr);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.inbox.try_recv().is_err());

    assert!(alice.transport.is_established(&bob.addr).await);
    let session = bob.transport.session(&alice.addr).await.unwrap();
    assert!(session.is_complete().await);
    assert_eq!(session.remote_static().await, Some(alice.public));
}

#[tokio::test]
async fn test_responder_replies_with_learned_key() {
    let network = LoopbackNetwork::new();
    let mut alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    alice.transport.send(&message("hi"), &bob.addr).await.unwrap();
    recv(&mut bob.inbox).await;

    assert_eq!(bob.transport.peer_key(&alice.addr).await, Some(alice.public));
    bob.transport
        .send(&message("hello"), &alice.addr)
        .await
        .unwrap();

    let (packet, from) = recv(&mut alice.inbox).await;
    assert_eq!(packet, message("hello"));
    assert_eq!(from, bob.addr);
    assert_eq!(bob.transport.session_count().await, 1);
}

#[tokio::test]
async fn test_replayed_initiation_has_no_effect() {
    let network = LoopbackNetwork::new();
    let bob = node(&network, "bob").await;
    // Alice is a bare endpoint; Bob's response lands there unread.
    let _alice_endpoint = network.endpoint("alice");
    let alice_key = StaticKeypair::generate();
    let alice = LoopbackAddr::from("alice");

    let datagram = initiation(&alice_key, &bob.public, None);
    bob.transport
        .handle_inbound(datagram.clone(), alice.clone())
        .await
        .unwrap();
    let first = bob.transport.session(&alice).await.unwrap();
    assert!(first.is_complete().await);

    let err = bob
        .transport
        .handle_inbound(datagram, alice.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Replay(ReplayError::HandshakeReplay)
    ));

    let current = bob.transport.session(&alice).await.unwrap();
    assert!(Arc::ptr_eq(&first, &current));
    assert_eq!(bob.transport.replay_guard().len(), 1);
}

#[tokio::test]
async fn test_restamped_initiation_leaves_session_intact() {
    let network = LoopbackNetwork::new();
    let mut bob = node(&network, "bob").await;
    let alice = LoopbackAddr::from("alice");
    let alice_endpoint = network.endpoint("alice");
    let (tx, mut alice_rx) = mpsc::channel(8);
    alice_endpoint.register_inbound(tx);

    // Drive Alice's side by hand so her first message can be captured.
    let alice_key = StaticKeypair::generate();
    let alice_session = Session::new(
        bob.addr.clone(),
        NoiseHandshake::new(
            alice_key.private_key(),
            Some(&bob.public),
            HandshakeRole::Initiator,
        )
        .unwrap(),
    );
    let message1 = alice_session.advance_handshake(&[], None).await.unwrap();
    let captured = HandshakeFrame {
        stage: HandshakeStage::Initiation,
        message: Bytes::from(message1.unwrap()),
        nonce: *alice_session.handshake_nonce(),
        timestamp: alice_session.handshake_timestamp(),
    };
    bob.transport
        .handle_inbound(captured.clone().into_packet().unwrap().encode(), alice.clone())
        .await
        .unwrap();

    let datagram = timeout(Duration::from_secs(5), alice_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let response = HandshakeFrame::decode(&Packet::decode(datagram.data).unwrap().data).unwrap();
    alice_session
        .advance_handshake(&[], Some(&response.message[..]))
        .await
        .unwrap();
    let established = bob.transport.session(&alice).await.unwrap();

    // Same Noise message, fresh trailer.
    let restamped = HandshakeFrame {
        nonce: [0x42; 32],
        timestamp: tox_crypto::unix_time() + 30,
        ..captured
    };
    let err = bob
        .transport
        .handle_inbound(restamped.into_packet().unwrap().encode(), alice.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Noise(NoiseError::BindingMismatch)));

    let current = bob.transport.session(&alice).await.unwrap();
    assert!(Arc::ptr_eq(&established, &current));

    let frame = alice_session
        .encrypt(&message("still mine").encode())
        .await
        .unwrap();
    bob.transport
        .handle_inbound(frame.into_packet().encode(), alice.clone())
        .await
        .unwrap();
    assert_eq!(recv(&mut bob.inbox).await.0, message("still mine"));
}

#[tokio::test]
async fn test_stale_and_future_initiations_rejected() {
    let network = LoopbackNetwork::new();
    let bob = node(&network, "bob").await;
    let _alice_endpoint = network.endpoint("alice");
    let alice_key = StaticKeypair::generate();
    let alice = LoopbackAddr::from("alice");
    let now = tox_crypto::unix_time();

    let err = bob
        .transport
        .handle_inbound(
            initiation(&alice_key, &bob.public, Some(now - 301)),
            alice.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Replay(ReplayError::HandshakeTooOld { .. })
    ));

    let err = bob
        .transport
        .handle_inbound(
            initiation(&alice_key, &bob.public, Some(now + 61)),
            alice.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Replay(ReplayError::HandshakeFromFuture { .. })
    ));

    assert_eq!(bob.transport.session_count().await, 0);
    assert!(bob.transport.peer_key(&alice).await.is_none());
}

#[tokio::test]
async fn test_initiation_with_wrong_static_key_rejected() {
    let network = LoopbackNetwork::new();
    let bob = node(&network, "bob").await;
    let _alice_endpoint = network.endpoint("alice");
    let alice = LoopbackAddr::from("alice");

    let registered = StaticKeypair::generate();
    bob.transport
        .add_peer(alice.clone(), registered.public_key())
        .await
        .unwrap();

    let impostor = StaticKeypair::generate();
    let err = bob
        .transport
        .handle_inbound(initiation(&impostor, &bob.public, None), alice.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Noise(NoiseError::InvalidKey(_))));
    assert_eq!(bob.transport.session_count().await, 0);
    assert_eq!(
        bob.transport.peer_key(&alice).await,
        Some(*registered.public_key())
    );
}

#[tokio::test]
async fn test_initiation_for_another_responder_rejected() {
    let network = LoopbackNetwork::new();
    let bob = node(&network, "bob").await;
    let _alice_endpoint = network.endpoint("alice");
    let alice = LoopbackAddr::from("alice");

    let someone_else = StaticKeypair::generate();
    let result = bob
        .transport
        .handle_inbound(
            initiation(&StaticKeypair::generate(), someone_else.public_key(), None),
            alice.clone(),
        )
        .await;
    assert!(result.is_err());
    assert!(bob.transport.session(&alice).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simultaneous_open_converges() {
    let network = LoopbackNetwork::new();
    let mut alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    bob.transport
        .add_peer(alice.addr.clone(), &alice.public)
        .await
        .unwrap();

    let hi = message("hi");
    let hey = message("hey");
    let (to_bob, to_alice) = tokio::join!(
        alice.transport.send(&hi, &bob.addr),
        bob.transport.send(&hey, &alice.addr)
    );
    to_bob.unwrap();
    to_alice.unwrap();

    assert_eq!(recv(&mut bob.inbox).await.0, hi);
    assert_eq!(recv(&mut alice.inbox).await.0, hey);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice.inbox.try_recv().is_err());
    assert!(bob.inbox.try_recv().is_err());

    // Both ends hold the same session afterwards.
    let a = alice.transport.session(&bob.addr).await.unwrap();
    let b = bob.transport.session(&alice.addr).await.unwrap();
    assert!(a.is_complete().await && b.is_complete().await);
    assert_ne!(a.role(), b.role());
    assert_eq!(a.handshake_hash().await, b.handshake_hash().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_to_many_peers() {
    const PEERS: usize = 8;
    const MESSAGES: usize = 10;

    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut peers = Vec::new();
    for i in 0..PEERS {
        let peer = node(&network, &format!("peer-{}", i)).await;
        alice
            .transport
            .add_peer(peer.addr.clone(), &peer.public)
            .await
            .unwrap();
        peers.push(peer);
    }

    let mut sends = Vec::new();
    for peer in &peers {
        for n in 0..MESSAGES {
            let transport = alice.transport.clone();
            let to = peer.addr.clone();
            sends.push(tokio::spawn(async move {
                let packet = Packet::new(PacketType::FriendMessage, format!("msg {}", n));
                transport.send(&packet, &to).await
            }));
        }
    }
    for send in sends {
        send.await.unwrap().unwrap();
    }

    for peer in &mut peers {
        let mut seen = Vec::new();
        for _ in 0..MESSAGES {
            let (packet, from) = recv(&mut peer.inbox).await;
            assert_eq!(from, alice.addr);
            seen.push(packet.data);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), MESSAGES);
        assert_eq!(peer.transport.session_count().await, 1);
    }
    assert_eq!(alice.transport.session_count().await, PEERS);
}

#[tokio::test]
async fn test_unroutable_inner_packets() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    alice.transport.send(&message("hi"), &bob.addr).await.unwrap();
    recv(&mut bob.inbox).await;

    let session = alice.transport.session(&bob.addr).await.unwrap();

    let nickname = Packet::new(PacketType::Nickname, Bytes::from_static(b"alice"));
    let frame = session.encrypt(&nickname.encode()).await.unwrap();
    let err = bob
        .transport
        .handle_inbound(frame.into_packet().encode(), alice.addr.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoHandler(PacketType::Nickname)));

    let frame = session.encrypt(&[0x99, 1, 2]).await.unwrap();
    let err = bob
        .transport
        .handle_inbound(frame.into_packet().encode(), alice.addr.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Wire(WireError::UnknownPacketType(0x99))
    ));

    // The session survives both.
    alice.transport.send(&message("still here"), &bob.addr).await.unwrap();
    assert_eq!(recv(&mut bob.inbox).await.0, message("still here"));
}

#[tokio::test]
async fn test_largest_packet_fits_one_datagram() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();

    // The type byte takes one of the plaintext bytes.
    let largest = Packet::new(PacketType::FriendMessage, vec![0x5a; MAX_PLAINTEXT_SIZE - 1]);
    alice.transport.send(&largest, &bob.addr).await.unwrap();
    assert_eq!(recv(&mut bob.inbox).await.0, largest);

    let too_big = Packet::new(PacketType::FriendMessage, vec![0x5a; MAX_PLAINTEXT_SIZE]);
    let err = alice
        .transport
        .send(&too_big, &bob.addr)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Wire(WireError::TooLarge(_, MAX_PLAINTEXT_SIZE))
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_duplicated_data_frame_dropped() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    alice.transport.send(&message("hi"), &bob.addr).await.unwrap();
    recv(&mut bob.inbox).await;

    let session = alice.transport.session(&bob.addr).await.unwrap();
    let datagram = session
        .encrypt(&message("once").encode())
        .await
        .unwrap()
        .into_packet()
        .encode();

    bob.transport
        .handle_inbound(datagram.clone(), alice.addr.clone())
        .await
        .unwrap();
    assert!(bob
        .transport
        .handle_inbound(datagram, alice.addr.clone())
        .await
        .is_err());

    assert_eq!(recv(&mut bob.inbox).await.0, message("once"));
    assert!(bob.inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_data_without_session_rejected() {
    let network = LoopbackNetwork::new();
    let bob = node(&network, "bob").await;

    let mut body = vec![0u8; 8];
    body.extend_from_slice(&[0xaa; 32]);
    let datagram = Packet::new(PacketType::NoiseMessage, body).encode();

    let err = bob
        .transport
        .handle_inbound(datagram, LoopbackAddr::from("mallory"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoSession(_)));
}

#[tokio::test]
async fn test_remove_peer_drops_session() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    alice.transport.send(&message("hi"), &bob.addr).await.unwrap();
    recv(&mut bob.inbox).await;

    assert!(alice.transport.remove_peer(&bob.addr).await);
    assert!(alice.transport.session(&bob.addr).await.is_none());
    assert!(matches!(
        alice.transport.send(&message("hi"), &bob.addr).await,
        Err(TransportError::PeerNotSupported(_))
    ));
    assert!(!alice.transport.remove_peer(&bob.addr).await);
}

#[tokio::test]
async fn test_changed_key_evicts_session() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let mut bob = node(&network, "bob").await;

    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    alice.transport.send(&message("hi"), &bob.addr).await.unwrap();
    recv(&mut bob.inbox).await;

    // Same key again keeps the session.
    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();
    assert!(alice.transport.is_established(&bob.addr).await);

    alice
        .transport
        .add_peer(bob.addr.clone(), StaticKeypair::generate().public_key())
        .await
        .unwrap();
    assert!(alice.transport.session(&bob.addr).await.is_none());
}

#[tokio::test]
async fn test_closed_peer_is_unreachable() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice").await;
    let bob = node(&network, "bob").await;

    bob.transport.close().await.unwrap();
    alice
        .transport
        .add_peer(bob.addr.clone(), &bob.public)
        .await
        .unwrap();

    let err = alice
        .transport
        .send(&message("hi"), &bob.addr)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)));
    assert!(err.is_retryable());
    assert_eq!(alice.transport.session_count().await, 0);
}
