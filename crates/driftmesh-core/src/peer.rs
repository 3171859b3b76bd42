//! Remote peer bookkeeping.
//!
//! A [`RemotePeer`] is everything a node knows about one other node: where
//! it was last seen, through which local socket, its NAT type, its
//! subcluster memberships, and the proxies that can relay to it when no
//! direct path exists.

use crate::id::{ClusterId, PacketId, PeerId, SubclusterId};
use crate::messages::PeerDescriptor;
use crate::nat::{NatType, Strategy};
use crate::node::{LocalSocket, NodeError};
use crate::packet::PacketKind;
use crate::subcluster::{PackParams, pack};
use driftmesh_crypto::SubclusterKeys;
use driftmesh_transport::Transport;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// How to reach a peer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Straight to the peer's address
    Direct {
        /// Peer address
        address: SocketAddr,
        /// Local socket to send from
        socket: LocalSocket,
    },
    /// Through a proxy that is directly reachable
    Proxy {
        /// The proxy
        proxy: PeerId,
        /// Proxy address
        address: SocketAddr,
        /// Local socket to send from
        socket: LocalSocket,
    },
}

impl Route {
    /// Next-hop address
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        match self {
            Route::Direct { address, .. } | Route::Proxy { address, .. } => *address,
        }
    }

    /// Local socket to send from
    #[must_use]
    pub fn socket(&self) -> LocalSocket {
        match self {
            Route::Direct { socket, .. } | Route::Proxy { socket, .. } => *socket,
        }
    }
}

/// Everything known about one remote node
#[derive(Debug, Clone)]
pub struct RemotePeer {
    /// Peer id
    pub peer_id: PeerId,
    /// Last known address
    pub address: Option<SocketAddr>,
    /// Local socket the peer is reached through
    pub socket: LocalSocket,
    /// Advertised NAT type
    pub nat_type: NatType,
    /// A packet arrived directly from this peer
    pub connected: bool,
    /// Strategy used (or chosen) to connect
    pub strategy: Option<Strategy>,
    /// Peers that relay to this one
    pub proxies: HashSet<PeerId>,
    /// Subcluster memberships per cluster
    pub clusters: HashMap<ClusterId, HashSet<SubclusterId>>,
    /// Configured bootstrap peer; never pruned
    pub indexed: bool,
    /// Last time we heard from the peer (milliseconds since the Unix epoch)
    pub last_update: u64,
    /// Last time we sent the peer a request
    pub last_request: u64,
    /// Already used as a reflection helper
    pub reflection_probed: bool,
}

/// Parameters of a unicast write
#[derive(Debug, Clone, Copy)]
pub struct WriteParams<'a> {
    /// Cluster the packet belongs to
    pub cluster_id: ClusterId,
    /// Originating node
    pub sender: PeerId,
    /// Lamport clock to stamp
    pub clock: u64,
    /// Current time
    pub now: u64,
    /// Time to live
    pub ttl: u64,
    /// Event name
    pub event: &'a str,
    /// Event value
    pub value: &'a [u8],
}

impl RemotePeer {
    /// A peer seen for the first time
    #[must_use]
    pub fn new(peer_id: PeerId, now: u64) -> Self {
        Self {
            peer_id,
            address: None,
            socket: LocalSocket::Primary,
            nat_type: NatType::UNKNOWN,
            connected: false,
            strategy: None,
            proxies: HashSet::new(),
            clusters: HashMap::new(),
            indexed: false,
            last_update: now,
            last_request: 0,
            reflection_probed: false,
        }
    }

    /// A configured bootstrap peer
    #[must_use]
    pub fn indexed(peer_id: PeerId, address: SocketAddr, now: u64) -> Self {
        Self {
            address: Some(address),
            nat_type: NatType::UNRESTRICTED,
            indexed: true,
            ..Self::new(peer_id, now)
        }
    }

    /// Record a packet received directly from the peer.
    ///
    /// Returns true if this is the first direct contact.
    pub fn touch(&mut self, from: SocketAddr, socket: LocalSocket, now: u64) -> bool {
        let newly = !self.connected;
        self.address = Some(from);
        self.socket = socket;
        self.connected = true;
        self.last_update = now;
        newly
    }

    /// Fold in what the peer says about itself
    pub fn observe(&mut self, descriptor: &PeerDescriptor) {
        if descriptor.indexed {
            self.nat_type = NatType::UNRESTRICTED;
        } else if descriptor.nat_type.is_resolved() {
            self.nat_type = descriptor.nat_type;
        }
        if self.address.is_none() {
            self.address = descriptor.address;
        }
    }

    /// Record membership in a subcluster
    pub fn join(&mut self, cluster: ClusterId, subcluster: SubclusterId) {
        self.clusters.entry(cluster).or_default().insert(subcluster);
    }

    /// Replace the membership list for `cluster`
    pub fn set_memberships(&mut self, cluster: ClusterId, subclusters: &[SubclusterId]) {
        let entry = self.clusters.entry(cluster).or_default();
        entry.clear();
        entry.extend(subclusters.iter().copied());
    }

    /// Returns true if the peer is a member of `subcluster`
    #[must_use]
    pub fn is_member(&self, cluster: &ClusterId, subcluster: &SubclusterId) -> bool {
        self.clusters
            .get(cluster)
            .is_some_and(|subs| subs.contains(subcluster))
    }

    /// Returns true if packets can be sent straight to the peer
    #[must_use]
    pub fn has_direct_route(&self) -> bool {
        self.address.is_some() && (self.connected || self.indexed)
    }

    /// Returns true if the peer can serve as a reflection helper
    #[must_use]
    pub fn is_pingable(&self) -> bool {
        self.has_direct_route() && (self.indexed || self.nat_type.is_resolved())
    }

    /// Direct route, if any
    #[must_use]
    pub fn direct_route(&self) -> Option<Route> {
        if !self.has_direct_route() {
            return None;
        }
        self.address.map(|address| Route::Direct {
            address,
            socket: self.socket,
        })
    }

    /// Seal, sign and send an event to this peer over `route`.
    ///
    /// A direct route carries a Publish addressed to the peer; a proxy route
    /// carries a PublishProxied that the proxy unwraps and forwards.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] if the sealed event does not fit in
    /// one packet, or a transport error if the send fails.
    pub async fn write(
        &self,
        keys: &SubclusterKeys,
        params: WriteParams<'_>,
        route: Route,
        transport: &dyn Transport,
    ) -> Result<PacketId, NodeError> {
        let kind = match route {
            Route::Direct { .. } => PacketKind::Publish,
            Route::Proxy { .. } => PacketKind::PublishProxied,
        };
        let packet = pack(
            keys,
            PackParams {
                kind,
                cluster_id: params.cluster_id,
                event: params.event,
                value: params.value,
                ttl: params.ttl,
                clock: params.clock,
                timestamp: params.now,
                sender: params.sender,
                recipient: Some(self.peer_id),
            },
        )?;
        let bytes = packet.encode()?;
        transport.send_to(&bytes, route.address()).await?;

        tracing::trace!(
            "Wrote {} to {} via {:?}",
            packet.packet_id().short(),
            self.peer_id.short(),
            route
        );
        Ok(packet.packet_id())
    }
}

/// Remove peers silent for longer than `max_silence`, then any peer whose
/// only proxies were just removed.
///
/// Indexed peers are never removed. Peers reached only through proxies do not
/// heartbeat us directly and are judged by their proxies instead.
pub fn prune_stale(
    peers: &mut HashMap<PeerId, RemotePeer>,
    now: u64,
    max_silence: u64,
) -> Vec<PeerId> {
    let mut removed: HashSet<PeerId> = peers
        .values()
        .filter(|p| !p.indexed)
        .filter(|p| p.connected || p.proxies.is_empty())
        .filter(|p| now.saturating_sub(p.last_update) > max_silence)
        .map(|p| p.peer_id)
        .collect();
    for id in &removed {
        peers.remove(id);
    }

    loop {
        let orphans: Vec<PeerId> = peers
            .values()
            .filter(|p| !p.indexed && !p.connected && !p.proxies.is_empty())
            .filter(|p| p.proxies.iter().all(|proxy| removed.contains(proxy)))
            .map(|p| p.peer_id)
            .collect();
        if orphans.is_empty() {
            break;
        }
        for id in orphans {
            peers.remove(&id);
            removed.insert(id);
        }
    }

    for peer in peers.values_mut() {
        peer.proxies.retain(|proxy| !removed.contains(proxy));
    }

    removed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_touch_reports_first_contact() {
        let mut peer = RemotePeer::new(id(1), 0);
        assert!(!peer.has_direct_route());
        assert!(peer.touch(addr(1000), LocalSocket::Primary, 5));
        assert!(!peer.touch(addr(1000), LocalSocket::Primary, 6));
        assert!(peer.has_direct_route());
        assert_eq!(peer.last_update, 6);
    }

    #[test]
    fn test_observe_descriptor() {
        let mut peer = RemotePeer::new(id(1), 0);
        peer.observe(&PeerDescriptor {
            peer_id: id(1),
            address: Some(addr(1)),
            nat_type: NatType::UNKNOWN,
            indexed: false,
        });
        assert_eq!(peer.nat_type, NatType::UNKNOWN);
        assert_eq!(peer.address, Some(addr(1)));

        peer.observe(&PeerDescriptor {
            peer_id: id(1),
            address: Some(addr(2)),
            nat_type: NatType::ADDR_RESTRICTED,
            indexed: false,
        });
        assert_eq!(peer.nat_type, NatType::ADDR_RESTRICTED);
        assert_eq!(peer.address, Some(addr(1)));
    }

    #[test]
    fn test_membership() {
        let cluster = ClusterId::from_name("c");
        let sub = SubclusterId::from_bytes([5; 32]);
        let mut peer = RemotePeer::new(id(1), 0);
        assert!(!peer.is_member(&cluster, &sub));
        peer.join(cluster, sub);
        assert!(peer.is_member(&cluster, &sub));
        peer.set_memberships(cluster, &[]);
        assert!(!peer.is_member(&cluster, &sub));
    }

    #[test]
    fn test_prune_keeps_indexed_and_fresh() {
        let mut peers = HashMap::new();
        peers.insert(id(1), RemotePeer::indexed(id(1), addr(1), 0));
        let mut fresh = RemotePeer::new(id(2), 0);
        fresh.touch(addr(2), LocalSocket::Primary, 900);
        peers.insert(id(2), fresh);
        let mut stale = RemotePeer::new(id(3), 0);
        stale.touch(addr(3), LocalSocket::Primary, 0);
        peers.insert(id(3), stale);

        let removed = prune_stale(&mut peers, 1_000, 500);
        assert_eq!(removed, vec![id(3)]);
        assert!(peers.contains_key(&id(1)));
        assert!(peers.contains_key(&id(2)));
    }

    #[test]
    fn test_prune_cascades_through_proxies() {
        let mut peers = HashMap::new();
        let mut proxy = RemotePeer::new(id(1), 0);
        proxy.touch(addr(1), LocalSocket::Primary, 0);
        peers.insert(id(1), proxy);

        let mut behind = RemotePeer::new(id(2), 0);
        behind.proxies.insert(id(1));
        peers.insert(id(2), behind);

        let mut behind_two = RemotePeer::new(id(3), 0);
        behind_two.proxies.insert(id(1));
        behind_two.proxies.insert(id(4));
        peers.insert(id(3), behind_two);
        let mut other_proxy = RemotePeer::new(id(4), 0);
        other_proxy.touch(addr(4), LocalSocket::Primary, 1_000);
        peers.insert(id(4), other_proxy);

        let mut removed = prune_stale(&mut peers, 1_000, 500);
        removed.sort();
        assert_eq!(removed, vec![id(1), id(2)]);
        let survivor = &peers[&id(3)];
        assert_eq!(survivor.proxies.len(), 1);
        assert!(survivor.proxies.contains(&id(4)));
    }
}
