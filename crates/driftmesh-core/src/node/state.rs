//! Mutable node state.
//!
//! Everything the packet handlers, timers and API calls change lives in one
//! [`NodeState`] behind a single async mutex. Each handler runs to
//! completion while holding it, so per-peer bookkeeping never interleaves.

use crate::cache::Cache;
use crate::gate::Gate;
use crate::id::{ClusterId, PacketId, PeerId, SubclusterId};
use crate::messages::PeerDescriptor;
use crate::nat::{NatType, Reflection, Strategy};
use crate::node::config::NodeConfig;
use crate::node::rate_limiter::RateLimiter;
use crate::node::sockets::{LocalSocket, Sockets};
use crate::peer::{RemotePeer, Route};
use crate::subcluster::SubclusterEvent;
use driftmesh_crypto::SubclusterKeys;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of each subcluster's event channel
pub(crate) const SUBCLUSTER_CHANNEL_CAPACITY: usize = 256;

/// Millisecond clock anchored to the Unix epoch at startup and advanced by
/// the Tokio clock, so paused-time tests see consistent timestamps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    origin: Instant,
    epoch_ms: u64,
}

impl Clock {
    pub(crate) fn start() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            origin: Instant::now(),
            epoch_ms,
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_ms.saturating_add(elapsed)
    }

    pub(crate) fn uptime(&self) -> std::time::Duration {
        self.origin.elapsed()
    }
}

/// Options for a joined subcluster
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Raise the inbound rate ceiling for this subcluster's traffic
    pub rate_limit: Option<u32>,
}

/// A subcluster this node has joined
pub(crate) struct JoinedSubcluster {
    pub(crate) keys: Arc<SubclusterKeys>,
    pub(crate) events: broadcast::Sender<SubclusterEvent>,
    pub(crate) options: JoinOptions,
    /// Still re-announced every tick
    pub(crate) active: bool,
}

/// Progress of an introduction-driven connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    /// First punch sent, waiting for contact
    Probing {
        token: u64,
        connector: PeerId,
        strategy: Strategy,
    },
    /// Second punch sent after the first timed out
    AwaitingSecondResponse {
        token: u64,
        connector: PeerId,
        strategy: Strategy,
    },
    /// Gave up on a direct path; the connector relays
    FallbackProxy { connector: PeerId },
}

/// Mutable node state
pub(crate) struct NodeState {
    pub(crate) sockets: Option<Sockets>,
    /// Our external primary address, once reflected
    pub(crate) address: Option<SocketAddr>,
    pub(crate) nat_type: NatType,
    pub(crate) peers: HashMap<PeerId, RemotePeer>,
    pub(crate) cache: Cache,
    pub(crate) gate: Gate<PacketId>,
    pub(crate) intro_gate: Gate<(PeerId, PeerId)>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) subclusters: HashMap<SubclusterId, JoinedSubcluster>,
    pub(crate) reflection: Reflection,
    pub(crate) reflection_timer: Option<JoinHandle<()>>,
    pub(crate) handshakes: HashMap<PeerId, HandshakeState>,
    pub(crate) unpublished: HashSet<PacketId>,
    pub(crate) join_clocks: HashMap<(PeerId, SubclusterId), u64>,
    pub(crate) clock: u64,
    pub(crate) last_update: u64,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl NodeState {
    pub(crate) fn new(config: &NodeConfig, cluster_id: ClusterId) -> Self {
        let max_ttl = u64::try_from(config.gossip.max_ttl.as_millis()).unwrap_or(u64::MAX);
        let mut cache = Cache::new(max_ttl);
        cache.add_cluster(cluster_id);

        Self {
            sockets: None,
            address: None,
            nat_type: config.nat.static_type.unwrap_or(NatType::UNKNOWN),
            peers: HashMap::new(),
            cache,
            gate: Gate::new(),
            intro_gate: Gate::new(),
            rate_limiter: RateLimiter::new(config.rate_limit),
            subclusters: HashMap::new(),
            reflection: Reflection::new(),
            reflection_timer: None,
            handshakes: HashMap::new(),
            unpublished: HashSet::new(),
            join_clocks: HashMap::new(),
            clock: 0,
            last_update: 0,
            tasks: Vec::new(),
        }
    }

    /// Advance and return the Lamport clock
    pub(crate) fn next_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Fold a remote clock into ours
    pub(crate) fn observe_clock(&mut self, remote: u64) {
        self.clock = self.clock.max(remote);
    }

    /// Subclusters we currently announce
    pub(crate) fn active_subclusters(&self) -> Vec<SubclusterId> {
        let mut subs: Vec<SubclusterId> = self
            .subclusters
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(id, _)| *id)
            .collect();
        subs.sort_unstable();
        subs.truncate(crate::MAX_ADVERTISED_SUBCLUSTERS);
        subs
    }

    /// Address peers should use for us
    pub(crate) fn public_address(&self) -> Option<SocketAddr> {
        self.address.or_else(|| {
            self.sockets
                .as_ref()
                .and_then(|s| s.local_addr(LocalSocket::Primary))
        })
    }

    /// Returns true if `addr` is one of our own sockets
    pub(crate) fn is_own_address(&self, addr: SocketAddr) -> bool {
        self.address == Some(addr)
            || self
                .sockets
                .as_ref()
                .is_some_and(|s| s.local_addrs().contains(&addr))
    }

    /// Peer last seen at `addr`
    pub(crate) fn peer_by_address(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.address == Some(addr))
            .map(|p| p.peer_id)
    }

    /// Drop finished proxy fallbacks so later introductions can try a
    /// direct path again. Returns how many were dropped.
    pub(crate) fn clear_fallbacks(&mut self) -> usize {
        let before = self.handshakes.len();
        self.handshakes
            .retain(|_, h| !matches!(h, HandshakeState::FallbackProxy { .. }));
        before - self.handshakes.len()
    }

    /// Descriptor we advertise
    pub(crate) fn descriptor(&self, peer_id: PeerId, indexed: bool) -> PeerDescriptor {
        PeerDescriptor {
            peer_id,
            address: self.address,
            nat_type: self.nat_type,
            indexed,
        }
    }

    /// Best route to `peer_id`: direct if possible, else the first proxy that
    /// is itself directly reachable
    pub(crate) fn route_to(&self, peer_id: &PeerId) -> Option<Route> {
        let peer = self.peers.get(peer_id)?;
        if let Some(route) = peer.direct_route() {
            return Some(route);
        }
        let mut proxies: Vec<&PeerId> = peer.proxies.iter().collect();
        proxies.sort_unstable();
        proxies.into_iter().find_map(|proxy_id| {
            let proxy = self.peers.get(proxy_id)?;
            let Some(Route::Direct { address, socket }) = proxy.direct_route() else {
                return None;
            };
            Some(Route::Proxy {
                proxy: *proxy_id,
                address,
                socket,
            })
        })
    }

    /// Peers that can serve as reflection helpers, indexed peers first
    pub(crate) fn reflection_helpers(&self) -> Vec<(PeerId, SocketAddr, bool)> {
        let mut helpers: Vec<(PeerId, SocketAddr, bool)> = self
            .peers
            .values()
            .filter(|p| p.is_pingable())
            .filter_map(|p| p.address.map(|a| (p.peer_id, a, p.reflection_probed)))
            .collect();
        helpers.sort_by_key(|(id, _, _)| {
            let indexed = self.peers.get(id).is_some_and(|p| p.indexed);
            (!indexed, *id)
        });
        helpers
    }
}
