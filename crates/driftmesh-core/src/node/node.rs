//! Node implementation

use crate::id::{ClusterId, PeerId, SubclusterId};
use crate::messages::{PeerDescriptor, PingMessage};
use crate::nat::NatType;
use crate::node::config::NodeConfig;
use crate::node::error::{NodeError, Result};
use crate::node::events::{AlwaysOnline, EVENT_CHANNEL_CAPACITY, NetworkAvailability, NodeEvent};
use crate::node::rate_limiter::RateLimitMetrics;
use crate::node::snapshot::NodeSnapshot;
use crate::node::sockets::{LocalSocket, Sockets};
use crate::node::state::{Clock, NodeState};
use crate::packet::{Packet, PacketBuilder, PacketKind, encode_body};
use crate::peer::{RemotePeer, Route};
use driftmesh_crypto::Identity;
use driftmesh_transport::{SocketFactory, UdpSocketFactory};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::borrow::Cow;
use std::cmp::Reverse;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

/// Kind of ping being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingKind {
    /// One-off ping
    Plain,
    /// Keepalive carrying a cache summary
    Heartbeat,
    /// Connection attempt, resent on the retry schedule
    Connection,
    /// Connection attempt sent once, used for port spraying
    Punch,
}

/// Inner node state (shared via Arc)
pub(crate) struct NodeInner {
    /// Node identity
    pub(crate) identity: Identity,

    /// Peer id (identity public key)
    pub(crate) peer_id: PeerId,

    /// Cluster namespace
    pub(crate) cluster_id: ClusterId,

    /// Node configuration
    pub(crate) config: NodeConfig,

    /// Binds sockets
    pub(crate) factory: Arc<dyn SocketFactory>,

    /// Host connectivity
    pub(crate) availability: Arc<dyn NetworkAvailability>,

    /// Event fan-out
    pub(crate) events: broadcast::Sender<NodeEvent>,

    /// Everything handlers mutate
    pub(crate) state: Mutex<NodeState>,

    /// Set once by `init`
    pub(crate) initialized: AtomicBool,

    /// Set once by `close`
    pub(crate) closing: AtomicBool,

    /// Millisecond clock
    pub(crate) clock: Clock,
}

/// driftmesh node
///
/// Cheap to clone; clones share one underlying node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

/// Point-in-time summary of a node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Our peer id
    pub peer_id: PeerId,
    /// Cluster namespace
    pub cluster_id: ClusterId,
    /// Reflected external address
    pub address: Option<SocketAddr>,
    /// Primary socket address
    pub local_address: Option<SocketAddr>,
    /// Probe socket address
    pub probe_address: Option<SocketAddr>,
    /// Our NAT classification
    pub nat_type: NatType,
    /// Time since the node was built
    pub uptime: Duration,
    /// Known peers
    pub peers: usize,
    /// Peers with a direct path
    pub connected_peers: usize,
    /// Cached packets
    pub cache_size: usize,
    /// Publishes waiting for connectivity
    pub unpublished: usize,
    /// Subclusters currently joined
    pub subclusters: usize,
    /// Open punch sockets
    pub punch_sockets: usize,
    /// Inbound rate limiting counters
    pub rate_limit: RateLimitMetrics,
}

/// Builder for [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    identity: Option<Identity>,
    factory: Option<Arc<dyn SocketFactory>>,
    availability: Option<Arc<dyn NetworkAvailability>>,
    snapshot: Option<NodeSnapshot>,
}

impl NodeBuilder {
    /// Use an existing identity instead of generating one
    #[must_use]
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Bind sockets through `factory` instead of real UDP
    #[must_use]
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Report connectivity through `availability`
    #[must_use]
    pub fn availability(mut self, availability: Arc<dyn NetworkAvailability>) -> Self {
        self.availability = Some(availability);
        self
    }

    /// Start from a persisted snapshot
    #[must_use]
    pub fn restore(mut self, snapshot: NodeSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Build the node. Sockets are not bound until [`Node::init`].
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] for a bad configuration and
    /// [`NodeError::Validation`] if the snapshot belongs to another identity.
    pub fn build(self) -> Result<Node> {
        let cluster_id = self.config.validate()?;
        let identity = self.identity.unwrap_or_else(Identity::generate);
        let peer_id = PeerId::from_bytes(identity.public_key());
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(UdpSocketFactory::new(self.config.bind_ip)));
        let availability = self
            .availability
            .unwrap_or_else(|| Arc::new(AlwaysOnline));

        let clock = Clock::start();
        let mut state = NodeState::new(&self.config, cluster_id);
        if self.config.indexed && self.config.nat.static_type.is_none() {
            state.nat_type = NatType::UNRESTRICTED;
        }
        if let Some(snapshot) = &self.snapshot {
            let restored = snapshot.restore(peer_id, cluster_id)?;
            state.apply_restored(restored, clock.now_ms());
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::debug!("Built node {} for cluster {}", peer_id.short(), cluster_id.short());

        Ok(Node {
            inner: Arc::new(NodeInner {
                identity,
                peer_id,
                cluster_id,
                config: self.config,
                factory,
                availability,
                events,
                state: Mutex::new(state),
                initialized: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                clock,
            }),
        })
    }
}

impl Node {
    /// Start building a node
    #[must_use]
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            identity: None,
            factory: None,
            availability: None,
            snapshot: None,
        }
    }

    /// Bind sockets, contact bootstrap peers and start background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if called twice or after
    /// [`Node::close`], and [`NodeError::TransportInit`] if a socket cannot be
    /// bound.
    pub async fn init(&self) -> Result<()> {
        if self.is_closing() {
            return Err(NodeError::invalid_state("Node is closed"));
        }
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState(Cow::Borrowed(
                "Node already initialized",
            )));
        }

        let config = &self.inner.config;
        let mut st = self.inner.state.lock().await;

        let primary = self.inner.factory.bind(config.port).await.map_err(|e| {
            NodeError::TransportInit(format!("Failed to bind primary socket: {}", e).into())
        })?;
        let probe = self.inner.factory.bind(config.probe_port).await.map_err(|e| {
            NodeError::TransportInit(format!("Failed to bind probe socket: {}", e).into())
        })?;

        tracing::info!(
            "Starting node {} on {:?} (probe {:?})",
            self.peer_id().short(),
            primary.local_addr().ok(),
            probe.local_addr().ok()
        );

        // Receive loops (defined in sockets.rs)
        let primary_loop = self.spawn_receiver(Arc::clone(&primary), LocalSocket::Primary);
        let probe_loop = self.spawn_receiver(Arc::clone(&probe), LocalSocket::Probe);
        st.tasks.push(primary_loop);
        st.tasks.push(probe_loop);

        // A node that knows its NAT advertises its bound address until
        // reflection says otherwise
        if (config.indexed || config.nat.static_type.is_some()) && !config.bind_ip.is_unspecified()
        {
            st.address = primary.local_addr().ok();
        }
        st.sockets = Some(Sockets::new(primary, probe));

        let now = self.now_ms();
        for bootstrap in &config.bootstrap {
            if bootstrap.peer_id == self.peer_id() {
                continue;
            }
            st.peers
                .entry(bootstrap.peer_id)
                .or_insert_with(|| RemotePeer::indexed(bootstrap.peer_id, bootstrap.address, now));
        }

        // Peers restored from a snapshot are pinged at their last address so
        // the table resumes without going through the bootstrap list
        let mut resumed: Vec<(PeerId, SocketAddr)> = st
            .peers
            .values()
            .filter(|p| !p.indexed && !p.connected)
            .filter_map(|p| p.address.map(|address| (p.peer_id, address)))
            .collect();
        resumed.sort_by_key(|(id, _)| *id);
        for (peer_id, address) in resumed {
            tracing::debug!("Resuming {} at {}", peer_id.short(), address);
            self.send_ping(
                &mut st,
                address,
                LocalSocket::Primary,
                PingKind::Connection,
                Some(peer_id),
            )
            .await;
        }

        // Maintenance loop (defined in maintenance.rs)
        let maintenance = self.spawn_maintenance();
        st.tasks.push(maintenance);

        if st.nat_type.is_resolved() {
            let address = st.public_address();
            self.emit(NodeEvent::NatResolved {
                nat_type: st.nat_type,
                address,
            });
        }

        drop(st);

        // First maintenance pass; the interval takes over after `keepalive`
        self.tick().await;

        tracing::info!("Node started: {}", self.peer_id());
        Ok(())
    }

    /// Stop every task and close every socket. Idempotent.
    pub async fn close(&self) {
        if self
            .inner
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        tracing::info!("Stopping node {}", self.peer_id().short());
        let mut st = self.inner.state.lock().await;
        self.close_sockets(&mut st).await;
        st.handshakes.clear();
        tracing::info!("Node stopped");
    }

    /// Our peer id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Cluster namespace
    #[must_use]
    pub fn cluster_id(&self) -> ClusterId {
        self.inner.cluster_id
    }

    /// Node identity
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Returns true once [`Node::close`] has been called
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Subscribe to node events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Primary socket address, once initialized
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let st = self.inner.state.lock().await;
        st.sockets
            .as_ref()
            .and_then(|s| s.local_addr(LocalSocket::Primary))
    }

    /// Our NAT classification
    pub async fn nat_type(&self) -> NatType {
        self.inner.state.lock().await.nat_type
    }

    /// Summary of the node
    pub async fn info(&self) -> NodeInfo {
        let st = self.inner.state.lock().await;
        NodeInfo {
            peer_id: self.peer_id(),
            cluster_id: self.cluster_id(),
            address: st.address,
            local_address: st
                .sockets
                .as_ref()
                .and_then(|s| s.local_addr(LocalSocket::Primary)),
            probe_address: st
                .sockets
                .as_ref()
                .and_then(|s| s.local_addr(LocalSocket::Probe)),
            nat_type: st.nat_type,
            uptime: self.inner.clock.uptime(),
            peers: st.peers.len(),
            connected_peers: st.peers.values().filter(|p| p.connected).count(),
            cache_size: st.cache.len(),
            unpublished: st.unpublished.len(),
            subclusters: st.active_subclusters().len(),
            punch_sockets: st.sockets.as_ref().map_or(0, Sockets::pool_len),
            rate_limit: st.rate_limiter.metrics(),
        }
    }

    /// Copy of one peer's record
    pub async fn peer(&self, peer_id: &PeerId) -> Option<RemotePeer> {
        self.inner.state.lock().await.peers.get(peer_id).cloned()
    }

    /// Copies of every peer record, sorted by id
    pub async fn peers(&self) -> Vec<RemotePeer> {
        let st = self.inner.state.lock().await;
        let mut peers: Vec<RemotePeer> = st.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    /// Returns true if the packet with `id` is cached
    pub async fn cache_contains(&self, id: &crate::id::PacketId) -> bool {
        self.inner.state.lock().await.cache.has(id)
    }

    /// Ping an address from the primary socket.
    ///
    /// A connection ping is resent on the retry schedule until the peer
    /// answers.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] before [`Node::init`] or after
    /// [`Node::close`].
    pub async fn ping(&self, address: SocketAddr, is_connection: bool) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() || st.sockets.is_none() {
            return Err(NodeError::invalid_state("Node is not running"));
        }
        let kind = if is_connection {
            PingKind::Connection
        } else {
            PingKind::Plain
        };
        let peer = st.peer_by_address(address);
        if self
            .send_ping(&mut st, address, LocalSocket::Primary, kind, peer)
            .await
        {
            Ok(())
        } else {
            Err(NodeError::transport("Ping could not be sent"))
        }
    }

    /// Gossip `packet` to up to `fanout` peers, skipping `ignore`.
    ///
    /// Returns the number of peers the packet was sent to.
    pub async fn mcast(&self, packet: Packet, ignore: &[PeerId]) -> usize {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return 0;
        }
        self.mcast_packet(&mut st, packet, ignore).await
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    pub(crate) fn ms(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn descriptor(&self, st: &NodeState) -> PeerDescriptor {
        st.descriptor(self.peer_id(), self.inner.config.indexed)
    }

    /// Build a control packet around `body`
    pub(crate) fn control_packet<T: Serialize>(
        &self,
        st: &mut NodeState,
        kind: PacketKind,
        subcluster: SubclusterId,
        body: &T,
    ) -> Result<Packet> {
        let message = encode_body(body)?;
        Ok(PacketBuilder::new(kind, self.cluster_id())
            .subcluster(subcluster)
            .clock(st.next_clock())
            .timestamp(self.now_ms())
            .message(message)
            .build()?)
    }

    /// Build and send a control packet. Returns true if it left the socket.
    pub(crate) async fn send_control<T: Serialize + Sync>(
        &self,
        st: &mut NodeState,
        kind: PacketKind,
        subcluster: SubclusterId,
        body: &T,
        to: SocketAddr,
        via: LocalSocket,
    ) -> bool {
        match self.control_packet(st, kind, subcluster, body) {
            Ok(packet) => self.send_packet(st, &packet, to, via).await,
            Err(e) => {
                tracing::debug!("Failed to build {:?}: {}", kind, e);
                false
            }
        }
    }

    pub(crate) fn ping_message(&self, st: &NodeState, kind: PingKind) -> PingMessage {
        let cluster_id = self.cluster_id();
        PingMessage {
            request_id: rand::random(),
            requester: self.descriptor(st),
            subclusters: st.active_subclusters(),
            is_connection: matches!(kind, PingKind::Connection | PingKind::Punch),
            is_heartbeat: kind == PingKind::Heartbeat,
            reflection: None,
            cache_summary: (kind == PingKind::Heartbeat)
                .then(|| st.cache.summarize(|p| p.cluster_id() == cluster_id)),
        }
    }

    /// Send a ping to `to`. Connection pings are retried until `peer`
    /// becomes connected.
    pub(crate) async fn send_ping(
        &self,
        st: &mut NodeState,
        to: SocketAddr,
        via: LocalSocket,
        kind: PingKind,
        peer: Option<PeerId>,
    ) -> bool {
        let ping = self.ping_message(st, kind);
        let packet = match self.control_packet(st, PacketKind::Ping, SubclusterId::default(), &ping)
        {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Failed to build ping: {}", e);
                return false;
            }
        };

        let now = self.now_ms();
        if let Some(p) = peer.and_then(|id| st.peers.get_mut(&id)) {
            p.last_request = now;
        }

        let sent = self.send_packet(st, &packet, to, via).await;
        if kind == PingKind::Connection {
            self.schedule_ping_retries(packet, to, via, peer);
        }
        sent
    }

    fn schedule_ping_retries(
        &self,
        packet: Packet,
        to: SocketAddr,
        via: LocalSocket,
        peer: Option<PeerId>,
    ) {
        let node = self.clone();
        let delays = self.inner.config.timing.ping_retries.clone();
        tokio::spawn(async move {
            for delay in delays {
                tokio::time::sleep(delay).await;
                if !node.retry_ping(&packet, to, via, peer).await {
                    break;
                }
            }
        });
    }

    async fn retry_ping(
        &self,
        packet: &Packet,
        to: SocketAddr,
        via: LocalSocket,
        peer: Option<PeerId>,
    ) -> bool {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return false;
        }
        if peer
            .and_then(|id| st.peers.get(&id))
            .is_some_and(|p| p.connected)
        {
            return false;
        }
        self.send_packet(&mut st, packet, to, via).await;
        true
    }

    /// Ping every peer we have a direct path to
    pub(crate) async fn heartbeat(&self, st: &mut NodeState) {
        let mut targets: Vec<(PeerId, Route)> = st
            .peers
            .values()
            .filter_map(|p| p.direct_route().map(|r| (p.peer_id, r)))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        for (peer_id, route) in targets {
            self.send_ping(
                st,
                route.address(),
                route.socket(),
                PingKind::Heartbeat,
                Some(peer_id),
            )
            .await;
        }
    }

    /// Gossip core: increment hops and send to up to `fanout` directly
    /// reachable peers, subcluster members first, then indexed peers.
    pub(crate) async fn mcast_packet(
        &self,
        st: &mut NodeState,
        mut packet: Packet,
        ignore: &[PeerId],
    ) -> usize {
        if packet.hops() >= self.inner.config.gossip.max_hops {
            tracing::trace!("Not relaying {}: hop limit", packet.packet_id().short());
            return 0;
        }
        packet.increment_hops();

        let cluster = packet.cluster_id();
        let subcluster = packet.subcluster_id();
        let mut candidates: Vec<(u8, PeerId, Route)> = st
            .peers
            .values()
            .filter(|p| !ignore.contains(&p.peer_id))
            .filter_map(|p| {
                let score = if p.is_member(&cluster, &subcluster) {
                    2
                } else {
                    u8::from(p.indexed)
                };
                p.direct_route().map(|r| (score, p.peer_id, r))
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by_key(|(score, _, _)| Reverse(*score));
        candidates.truncate(self.inner.config.gossip.fanout);

        let mut sent = 0;
        for (_, peer_id, route) in candidates {
            if self
                .send_packet(st, &packet, route.address(), route.socket())
                .await
            {
                sent += 1;
            } else {
                tracing::trace!("Gossip to {} failed", peer_id.short());
            }
        }
        sent
    }

    /// Snapshot of the persistable state
    pub async fn snapshot(&self) -> NodeSnapshot {
        let st = self.inner.state.lock().await;
        NodeSnapshot::capture(self.peer_id(), self.cluster_id(), &st)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.inner.peer_id)
            .field("cluster_id", &self.inner.cluster_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftmesh_transport::MemoryNetwork;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_node(net: &MemoryNetwork, last_octet: u8) -> Node {
        let host = net.add_host(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), None);
        let mut config = NodeConfig::for_cluster(ClusterId::from_name("node-tests"));
        config.nat.static_type = Some(NatType::UNRESTRICTED);
        Node::builder(config)
            .socket_factory(Arc::new(host))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_cluster() {
        let result = Node::builder(NodeConfig::default()).build();
        assert!(matches!(result, Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_identity_sets_peer_id() {
        let identity = Identity::from_bytes(&[7u8; 32]);
        let expected = PeerId::from_bytes(identity.public_key());
        let node = Node::builder(NodeConfig::for_cluster(ClusterId::from_name("x")))
            .identity(identity)
            .build()
            .unwrap();
        assert_eq!(node.peer_id(), expected);
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let net = MemoryNetwork::new();
        let node = test_node(&net, 1);
        node.init().await.unwrap();
        assert!(matches!(
            node.init().await,
            Err(NodeError::InvalidState(_))
        ));
        node.close().await;
    }

    #[tokio::test]
    async fn test_init_after_close_fails() {
        let net = MemoryNetwork::new();
        let node = test_node(&net, 1);
        node.close().await;
        assert!(node.init().await.is_err());
    }

    #[tokio::test]
    async fn test_info_after_init() {
        let net = MemoryNetwork::new();
        let node = test_node(&net, 2);
        assert!(node.local_addr().await.is_none());
        node.init().await.unwrap();

        let info = node.info().await;
        assert_eq!(info.peer_id, node.peer_id());
        assert_eq!(info.nat_type, NatType::UNRESTRICTED);
        assert!(info.local_address.is_some());
        assert!(info.probe_address.is_some());
        assert_ne!(info.local_address, info.probe_address);
        assert_eq!(info.peers, 0);

        node.close().await;
        node.close().await;
        assert!(node.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_ping_requires_init() {
        let net = MemoryNetwork::new();
        let node = test_node(&net, 3);
        let result = node
            .ping(SocketAddr::from(([10, 0, 0, 9], 1000)), false)
            .await;
        assert!(matches!(result, Err(NodeError::InvalidState(_))));
    }
}
