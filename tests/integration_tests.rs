//! Integration tests for whole-node behaviour.
//!
//! Every scenario runs on an in-memory network with simulated NAT devices
//! and a paused Tokio clock, so hole punching, proxy fallback and
//! reflection are exercised end to end without real sockets.

use driftmesh_core::messages::{JoinMessage, PeerDescriptor, PingMessage, PongMessage};
use driftmesh_core::node::{ManualAvailability, NetworkAvailability};
use driftmesh_core::packet::{decode_body, encode_body};
use driftmesh_core::{
    JoinOptions, NatType, Node, NodeError, NodeEvent, NodeSnapshot, Packet, PacketBuilder,
    PacketKind, PeerId, PublishOptions, Strategy, SubclusterId,
};
use driftmesh_crypto::Identity;
use driftmesh_integration_tests::fixtures::{Mesh, SEED_PORT, wait_for};
use driftmesh_transport::{MemorySocket, NatBehavior, Transport};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &[u8] = b"integration secret";

/// Wait for a `Connection` event naming `peer`.
async fn connected_to(
    events: &mut tokio::sync::broadcast::Receiver<NodeEvent>,
    peer: PeerId,
) -> Option<NodeEvent> {
    wait_for(events, Duration::from_secs(5), |e| {
        matches!(e, NodeEvent::Connection { peer_id, .. } if *peer_id == peer)
    })
    .await
}

/// Wait for a `Proxied` event naming `peer`.
async fn proxied_to(
    events: &mut tokio::sync::broadcast::Receiver<NodeEvent>,
    peer: PeerId,
) -> Option<NodeEvent> {
    wait_for(events, Duration::from_secs(10), |e| {
        matches!(e, NodeEvent::Proxied { peer_id, .. } if *peer_id == peer)
    })
    .await
}

fn descriptor(peer_id: PeerId) -> PeerDescriptor {
    PeerDescriptor {
        peer_id,
        address: None,
        nat_type: NatType::UNRESTRICTED,
        indexed: false,
    }
}

async fn recv_packet(socket: &MemorySocket) -> Option<Packet> {
    let mut buf = vec![0u8; 1500];
    let (size, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    Packet::parse(&buf[..size])
}

// ============================================================================
// Connection Setup
// ============================================================================

/// Two public nodes joining the same subcluster are introduced by the seed
/// and connect directly.
#[tokio::test(start_paused = true)]
async fn test_public_members_connect_directly() {
    let mut mesh = Mesh::new("direct");
    let seed = mesh.add_seed(1);
    let a = mesh.add_node(2, None, Some(NatType::UNRESTRICTED));
    let b = mesh.add_node(3, None, Some(NatType::UNRESTRICTED));

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    seed.init().await.unwrap();
    a.init().await.unwrap();
    b.init().await.unwrap();

    assert!(connected_to(&mut a_events, seed.peer_id()).await.is_some());
    assert!(connected_to(&mut b_events, seed.peer_id()).await.is_some());

    let a_sub = a.join(SECRET, JoinOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b_sub = b.join(SECRET, JoinOptions::default()).await.unwrap();

    let event = connected_to(&mut a_events, b.peer_id())
        .await
        .expect("A never connected to B");
    match event {
        NodeEvent::Connection { strategy, .. } => assert_eq!(strategy, Strategy::DirectConnect),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(connected_to(&mut b_events, a.peer_id()).await.is_some());

    let record = a.peer(&b.peer_id()).await.unwrap();
    assert!(record.connected);
    assert_eq!(record.strategy, Some(Strategy::DirectConnect));
    assert!(record.proxies.is_empty());

    assert_eq!(a_sub.id(), b_sub.id());
    assert!(b_sub.members().await.contains(&a.peer_id()));
}

/// Port-restricted peers behind symmetric NATs cannot punch through; after
/// two silent handshake rounds they route through the introducer.
#[tokio::test(start_paused = true)]
async fn test_failed_punch_falls_back_to_proxy() {
    let mut mesh = Mesh::new("fallback");
    let seed = mesh.add_seed(1);
    let a = mesh.add_node(2, Some(NatBehavior::SYMMETRIC), Some(NatType::PORT_RESTRICTED));
    let b = mesh.add_node(3, Some(NatBehavior::SYMMETRIC), Some(NatType::PORT_RESTRICTED));

    let mut a_events = a.subscribe();
    seed.init().await.unwrap();
    a.init().await.unwrap();
    b.init().await.unwrap();
    assert!(connected_to(&mut a_events, seed.peer_id()).await.is_some());

    a.join(SECRET, JoinOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.join(SECRET, JoinOptions::default()).await.unwrap();

    let event = proxied_to(&mut a_events, b.peer_id())
        .await
        .expect("A never fell back to a proxy");
    match event {
        NodeEvent::Proxied { proxy, .. } => assert_eq!(proxy, seed.peer_id()),
        other => panic!("unexpected event {:?}", other),
    }

    let record = a.peer(&b.peer_id()).await.unwrap();
    assert!(!record.connected);
    assert_eq!(record.strategy, Some(Strategy::Proxy));
    assert!(record.proxies.contains(&seed.peer_id()));
}

/// Two endpoint-restricted peers skip punching and stream through the seed.
#[tokio::test(start_paused = true)]
async fn test_endpoint_restricted_pair_streams_through_proxy() {
    let mut mesh = Mesh::new("proxy");
    let seed = mesh.add_seed(1);
    let a = mesh.add_node(
        2,
        Some(NatBehavior::SYMMETRIC),
        Some(NatType::ENDPOINT_RESTRICTED),
    );
    let b = mesh.add_node(
        3,
        Some(NatBehavior::SYMMETRIC),
        Some(NatType::ENDPOINT_RESTRICTED),
    );

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    seed.init().await.unwrap();
    a.init().await.unwrap();
    b.init().await.unwrap();
    assert!(connected_to(&mut a_events, seed.peer_id()).await.is_some());
    assert!(connected_to(&mut b_events, seed.peer_id()).await.is_some());

    let a_sub = a.join(SECRET, JoinOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b_sub = b.join(SECRET, JoinOptions::default()).await.unwrap();

    assert!(proxied_to(&mut b_events, a.peer_id()).await.is_some());
    let mut direct = a_sub.on("direct");

    b_sub.stream(a.peer_id(), "direct", b"hi").await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), direct.recv())
        .await
        .expect("stream never arrived")
        .unwrap();
    assert_eq!(message.value, b"hi");
    assert_eq!(message.from, Some(b.peer_id()));

    // A learned the path back to B from the relayed packet
    let record = a.peer(&b.peer_id()).await.unwrap();
    assert!(!record.connected);
    assert!(record.proxies.contains(&seed.peer_id()));
}

// ============================================================================
// Gossip
// ============================================================================

/// A late joiner receives earlier publishes from the seed's cache.
#[tokio::test(start_paused = true)]
async fn test_late_joiner_catches_up_from_cache() {
    let mut mesh = Mesh::new("catch-up");
    let seed = mesh.add_seed(1);
    let a = mesh.add_node(2, None, Some(NatType::UNRESTRICTED));
    let b = mesh.add_node(3, None, Some(NatType::UNRESTRICTED));

    let mut b_events = b.subscribe();
    seed.init().await.unwrap();
    a.init().await.unwrap();
    b.init().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = a
        .publish(SECRET, "greeting", b"hello mesh", PublishOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seed.cache_contains(&id).await);
    assert_eq!(a.info().await.unpublished, 0);

    b.join(SECRET, JoinOptions::default()).await.unwrap();

    let event = wait_for(&mut b_events, Duration::from_secs(5), |e| {
        matches!(e, NodeEvent::Message(m) if m.packet_id == id)
    })
    .await
    .expect("B never received the cached publish");
    match event {
        NodeEvent::Message(message) => {
            assert_eq!(message.name, "greeting");
            assert_eq!(message.value, b"hello mesh");
            assert_eq!(message.from, Some(a.peer_id()));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(b.cache_contains(&id).await);
    assert!(b.peer(&a.peer_id()).await.is_none_or(|p| !p.connected));
}

/// An oversized value is rejected before anything reaches the network.
#[tokio::test(start_paused = true)]
async fn test_oversized_publish_sends_nothing() {
    let mut mesh = Mesh::new("capacity");
    let seed = mesh.add_seed(1);
    let a = mesh.add_node(2, None, Some(NatType::UNRESTRICTED));
    seed.init().await.unwrap();
    a.init().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let before = mesh.net.sent_from(Mesh::ip(2));
    let value = vec![0u8; driftmesh_core::MAX_MESSAGE_SIZE + 1];
    let result = a
        .publish(SECRET, "big", &value, PublishOptions::default())
        .await;

    assert!(matches!(result, Err(NodeError::Capacity { .. })));
    assert_eq!(mesh.net.sent_from(Mesh::ip(2)), before);
    assert_eq!(a.info().await.cache_size, 0);
}

/// Joins at the hop ceiling are handled but never relayed.
#[tokio::test(start_paused = true)]
async fn test_hop_ceiling_stops_relaying() {
    let mut mesh = Mesh::new("hops");
    let seed = mesh.add_seed(1);
    let node = mesh.add_node(2, None, Some(NatType::UNRESTRICTED));
    seed.init().await.unwrap();
    node.init().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let target = node.local_addr().await.unwrap();
    let raw = mesh.net.add_host(Mesh::ip(9), None).bind_socket(0).unwrap();
    let max_hops = node.config().gossip.max_hops;

    let join_with_hops = |requester: u8, hops: u8| {
        let join = JoinMessage {
            requester: descriptor(PeerId::from_bytes([requester; 32])),
            rendezvous_target: None,
            timestamp: 1_000,
        };
        PacketBuilder::new(PacketKind::Join, mesh.cluster_id())
            .subcluster(SubclusterId::from_bytes([7; 32]))
            .clock(1)
            .hops(hops)
            .message(encode_body(&join).unwrap())
            .build()
            .unwrap()
            .encode()
            .unwrap()
    };

    for (requester, hops) in [(20, max_hops), (21, max_hops + 1)] {
        let before = mesh.net.sent_from(Mesh::ip(2));
        raw.send_to(&join_with_hops(requester, hops), target)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            mesh.net.sent_from(Mesh::ip(2)),
            before,
            "join with {} hops was relayed",
            hops
        );
    }

    let before = mesh.net.sent_from(Mesh::ip(2));
    raw.send_to(&join_with_hops(22, max_hops - 1), target)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mesh.net.sent_from(Mesh::ip(2)) > before);
}

/// Publishes made offline are queued and flushed by the first tick after
/// connectivity returns.
#[tokio::test(start_paused = true)]
async fn test_offline_publishes_flush_when_online() {
    let mut mesh = Mesh::new("offline");
    let seed = mesh.add_seed(1);
    let availability = Arc::new(ManualAvailability::new(false));
    let shared: Arc<dyn NetworkAvailability> = availability.clone();
    let node = mesh.add_node_with(
        2,
        None,
        mesh.config(Some(NatType::UNRESTRICTED)),
        Identity::generate(),
        Some(shared),
    );
    seed.init().await.unwrap();
    node.init().await.unwrap();

    let id = node
        .publish(SECRET, "queued", b"later", PublishOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.info().await.unpublished, 1);
    assert!(!seed.cache_contains(&id).await);

    availability.set_online(true);
    tokio::time::sleep(node.config().timing.keepalive + Duration::from_secs(1)).await;

    assert_eq!(node.info().await.unpublished, 0);
    assert!(seed.cache_contains(&id).await);
}

// ============================================================================
// NAT Reflection
// ============================================================================

async fn reflect(behavior: NatBehavior) -> (NatType, Option<SocketAddr>) {
    let mut mesh = Mesh::new("reflection");
    let first = mesh.add_seed(1);
    let second = mesh.add_seed(2);
    let node = mesh.add_node(7, Some(behavior), None);

    let mut events = node.subscribe();
    first.init().await.unwrap();
    second.init().await.unwrap();
    node.init().await.unwrap();

    let event = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, NodeEvent::NatResolved { .. })
    })
    .await
    .expect("reflection never resolved");
    match event {
        NodeEvent::NatResolved { nat_type, address } => {
            assert_eq!(node.nat_type().await, nat_type);
            (nat_type, address)
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// A full-cone NAT keeps its port and admits both unsolicited replies.
#[tokio::test(start_paused = true)]
async fn test_reflection_classifies_full_cone() {
    let (nat_type, address) = reflect(NatBehavior::FULL_CONE).await;
    assert_eq!(nat_type, NatType::UNRESTRICTED);
    assert_eq!(address.map(|a| a.ip()), Some(Mesh::ip(7)));
}

/// A symmetric NAT changes port per helper and filters every unsolicited reply.
#[tokio::test(start_paused = true)]
async fn test_reflection_classifies_symmetric() {
    let (nat_type, _) = reflect(NatBehavior::SYMMETRIC).await;
    assert_eq!(nat_type, NatType::ENDPOINT_RESTRICTED);
}

/// A node with a declared NAT type never runs reflection.
#[tokio::test(start_paused = true)]
async fn test_static_nat_type_skips_reflection() {
    let mut mesh = Mesh::new("static");
    let seed = mesh.add_seed(1);
    let node = mesh.add_node(2, None, Some(NatType::ADDR_RESTRICTED));

    let mut events = node.subscribe();
    seed.init().await.unwrap();
    node.init().await.unwrap();

    let event = wait_for(&mut events, Duration::from_secs(1), |e| {
        matches!(e, NodeEvent::NatResolved { .. })
    })
    .await
    .unwrap();
    assert!(matches!(
        event,
        NodeEvent::NatResolved { nat_type, .. } if nat_type == NatType::ADDR_RESTRICTED
    ));
    assert_eq!(node.nat_type().await, NatType::ADDR_RESTRICTED);
}

// ============================================================================
// Sockets
// ============================================================================

/// A recoverable receive error rebinds the same port and the node keeps
/// answering pings.
#[tokio::test(start_paused = true)]
async fn test_receive_error_rebinds_same_port() {
    let mesh = Mesh::new("rebind");
    let mut config = mesh.config(Some(NatType::UNRESTRICTED));
    config.port = SEED_PORT;
    let node = mesh.add_node_with(2, None, config, Identity::generate(), None);
    node.init().await.unwrap();

    let address = node.local_addr().await.unwrap();
    assert_eq!(address.port(), SEED_PORT);
    assert!(mesh.net.inject_error(address, io::ErrorKind::ConnectionReset));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(node.local_addr().await, Some(address));

    let raw = mesh.net.add_host(Mesh::ip(9), None).bind_socket(0).unwrap();
    let ping = PingMessage {
        request_id: 42,
        requester: descriptor(PeerId::from_bytes([9; 32])),
        subclusters: Vec::new(),
        is_connection: false,
        is_heartbeat: false,
        reflection: None,
        cache_summary: None,
    };
    let packet = PacketBuilder::new(PacketKind::Ping, mesh.cluster_id())
        .message(encode_body(&ping).unwrap())
        .build()
        .unwrap();
    raw.send_to(&packet.encode().unwrap(), address).await.unwrap();

    let reply = recv_packet(&raw).await.expect("no pong after rebind");
    assert_eq!(reply.kind(), PacketKind::Pong);
    let pong: PongMessage = decode_body(reply.message()).unwrap();
    assert_eq!(pong.request_id, 42);
    assert_eq!(pong.responder.peer_id, node.peer_id());
    assert_eq!(pong.observed, raw.local_addr().unwrap());
}

// ============================================================================
// Persistence
// ============================================================================

/// A snapshot restores peers and cache, and only for the identity that took it.
#[tokio::test(start_paused = true)]
async fn test_snapshot_restores_state() {
    let mut mesh = Mesh::new("snapshot");
    let seed = mesh.add_seed(1);
    let config = mesh.config(Some(NatType::UNRESTRICTED));
    let identity = Identity::generate();
    let node = mesh.add_node_with(2, None, config.clone(), identity.clone(), None);

    let mut events = node.subscribe();
    seed.init().await.unwrap();
    node.init().await.unwrap();
    assert!(connected_to(&mut events, seed.peer_id()).await.is_some());

    let id = node
        .publish(SECRET, "kept", b"across restarts", PublishOptions::default())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    node.snapshot().await.save(&path).unwrap();
    node.close().await;

    let loaded = NodeSnapshot::load(&path).unwrap();
    assert_eq!(loaded.cache.len(), 1);
    assert!(!loaded.peers.is_empty());

    let stranger = Node::builder(config.clone())
        .identity(Identity::generate())
        .restore(loaded.clone())
        .build();
    assert!(matches!(stranger, Err(NodeError::Validation(_))));

    let mut restored_config = config;
    restored_config.bind_ip = Mesh::ip(12);
    let restored = Node::builder(restored_config)
        .identity(identity)
        .socket_factory(Arc::new(mesh.net.add_host(Mesh::ip(12), None)))
        .restore(loaded)
        .build()
        .unwrap();

    let info = restored.info().await;
    assert!(info.peers >= 1);
    assert_eq!(info.connected_peers, 0);
    assert!(restored.cache_contains(&id).await);

    let mut restored_events = restored.subscribe();
    restored.init().await.unwrap();
    assert!(connected_to(&mut restored_events, seed.peer_id()).await.is_some());
}

/// A restored node with no bootstrap list reaches its old peers directly.
#[tokio::test(start_paused = true)]
async fn test_snapshot_resumes_peers_without_bootstrap() {
    let mut mesh = Mesh::new("resume");
    let seed = mesh.add_seed(1);
    let config = mesh.config(Some(NatType::UNRESTRICTED));
    let identity = Identity::generate();
    let a = mesh.add_node_with(2, None, config.clone(), identity.clone(), None);
    let x = mesh.add_node(3, None, Some(NatType::UNRESTRICTED));

    let mut a_events = a.subscribe();
    seed.init().await.unwrap();
    a.init().await.unwrap();
    x.init().await.unwrap();
    a.join(SECRET, JoinOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    x.join(SECRET, JoinOptions::default()).await.unwrap();
    assert!(connected_to(&mut a_events, x.peer_id()).await.is_some());

    let snapshot = a.snapshot().await;
    a.close().await;
    seed.close().await;

    let mut restored_config = config;
    restored_config.bootstrap = vec![];
    restored_config.bind_ip = Mesh::ip(12);
    let restored = Node::builder(restored_config)
        .identity(identity)
        .socket_factory(Arc::new(mesh.net.add_host(Mesh::ip(12), None)))
        .restore(snapshot)
        .build()
        .unwrap();

    let mut restored_events = restored.subscribe();
    restored.init().await.unwrap();
    assert!(
        connected_to(&mut restored_events, x.peer_id()).await.is_some(),
        "restored node never reached its old peer"
    );

    let record = x.peer(&restored.peer_id()).await.unwrap();
    assert_eq!(record.address.map(|a| a.ip()), Some(Mesh::ip(12)));
}
