//! Persisting node state across restarts.
//!
//! A snapshot holds the peer table, the gossip cache and the queue of
//! unpublished packets as JSON. Identifiers and packets are hex encoded.
//! Restoring validates every record and skips the ones that do not parse,
//! so a partially corrupted file still brings back what it can.

use crate::id::{ClusterId, PacketId, PeerId, SubclusterId};
use crate::nat::NatType;
use crate::node::error::{NodeError, Result};
use crate::node::state::NodeState;
use crate::packet::Packet;
use crate::peer::RemotePeer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistable node state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Format version
    pub version: u32,
    /// Owner's peer id (hex)
    pub peer_id: String,
    /// Cluster namespace (hex)
    pub cluster_id: String,
    /// Lamport clock
    pub clock: u64,
    /// Known peers
    #[serde(default)]
    pub peers: Vec<PeerRecord>,
    /// Cached packets
    #[serde(default)]
    pub cache: Vec<CacheRecord>,
    /// Ids of cached packets not yet gossiped (hex)
    #[serde(default)]
    pub unpublished: Vec<String>,
}

/// One peer table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer id (hex)
    pub peer_id: String,
    /// Last known address
    pub address: Option<SocketAddr>,
    /// NAT type bits
    pub nat_type: u8,
    /// Bootstrap peer
    #[serde(default)]
    pub indexed: bool,
    /// Proxies (hex peer ids)
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Subclusters per cluster (hex ids)
    #[serde(default)]
    pub memberships: Vec<MembershipRecord>,
    /// Last heard from (milliseconds since the Unix epoch)
    pub last_update: u64,
}

/// Subcluster memberships within one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    /// Cluster id (hex)
    pub cluster_id: String,
    /// Subcluster ids (hex)
    pub subclusters: Vec<String>,
}

/// One cached packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Encoded packet (hex)
    pub packet: String,
    /// When it was cached
    pub inserted_at: u64,
}

/// Validated contents of a snapshot
pub(crate) struct Restored {
    clock: u64,
    peers: Vec<RemotePeer>,
    cache: Vec<(Packet, u64)>,
    unpublished: Vec<PacketId>,
}

impl NodeSnapshot {
    pub(crate) fn capture(peer_id: PeerId, cluster_id: ClusterId, st: &NodeState) -> Self {
        let mut peers: Vec<PeerRecord> = st
            .peers
            .values()
            .map(|p| {
                let mut proxies: Vec<String> = p.proxies.iter().map(PeerId::to_hex).collect();
                proxies.sort_unstable();
                let mut memberships: Vec<MembershipRecord> = p
                    .clusters
                    .iter()
                    .map(|(cluster, subs)| {
                        let mut subclusters: Vec<String> =
                            subs.iter().map(SubclusterId::to_hex).collect();
                        subclusters.sort_unstable();
                        MembershipRecord {
                            cluster_id: cluster.to_hex(),
                            subclusters,
                        }
                    })
                    .collect();
                memberships.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
                PeerRecord {
                    peer_id: p.peer_id.to_hex(),
                    address: p.address,
                    nat_type: p.nat_type.bits(),
                    indexed: p.indexed,
                    proxies,
                    memberships,
                    last_update: p.last_update,
                }
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let cache = st
            .cache
            .entries()
            .filter_map(|entry| {
                let bytes = entry.packet.encode().ok()?;
                Some(CacheRecord {
                    packet: hex::encode(bytes),
                    inserted_at: entry.inserted_at,
                })
            })
            .collect();

        let mut unpublished: Vec<String> = st.unpublished.iter().map(PacketId::to_hex).collect();
        unpublished.sort_unstable();

        Self {
            version: SNAPSHOT_VERSION,
            peer_id: peer_id.to_hex(),
            cluster_id: cluster_id.to_hex(),
            clock: st.clock,
            peers,
            cache,
            unpublished,
        }
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Serialization`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Io`] if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Io`] if the file cannot be read and
    /// [`NodeError::Serialization`] if it does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Validate against the identity and cluster restoring it
    pub(crate) fn restore(&self, peer_id: PeerId, cluster_id: ClusterId) -> Result<Restored> {
        if self.version != SNAPSHOT_VERSION {
            return Err(NodeError::validation("unsupported snapshot version"));
        }
        if PeerId::from_hex(&self.peer_id)? != peer_id {
            return Err(NodeError::validation("snapshot belongs to another peer"));
        }
        if ClusterId::from_hex(&self.cluster_id)? != cluster_id {
            return Err(NodeError::validation("snapshot belongs to another cluster"));
        }

        let peers: Vec<RemotePeer> = self
            .peers
            .iter()
            .filter_map(|record| {
                let peer = record.to_peer(peer_id);
                if peer.is_none() {
                    tracing::warn!("Skipping invalid peer record {}", record.peer_id);
                }
                peer
            })
            .collect();

        let cache: Vec<(Packet, u64)> = self
            .cache
            .iter()
            .filter_map(|record| {
                let packet = hex::decode(&record.packet)
                    .ok()
                    .and_then(|bytes| Packet::parse(&bytes))
                    .filter(|p| p.kind().is_publish() && p.has_valid_signature());
                if packet.is_none() {
                    tracing::warn!("Skipping invalid cache record");
                }
                packet.map(|p| (p, record.inserted_at))
            })
            .collect();

        let cached: HashSet<PacketId> = cache.iter().map(|(p, _)| p.packet_id()).collect();
        let unpublished = self
            .unpublished
            .iter()
            .filter_map(|id| PacketId::from_hex(id).ok())
            .filter(|id| cached.contains(id))
            .collect();

        Ok(Restored {
            clock: self.clock,
            peers,
            cache,
            unpublished,
        })
    }
}

impl PeerRecord {
    fn to_peer(&self, own_id: PeerId) -> Option<RemotePeer> {
        let peer_id = PeerId::from_hex(&self.peer_id).ok()?;
        if peer_id == own_id {
            return None;
        }
        let nat_type = NatType::from_bits(self.nat_type)?;

        let mut peer = match (self.indexed, self.address) {
            (true, Some(address)) => RemotePeer::indexed(peer_id, address, self.last_update),
            (true, None) => return None,
            (false, _) => {
                let mut peer = RemotePeer::new(peer_id, self.last_update);
                peer.address = self.address;
                peer.nat_type = nat_type;
                peer
            }
        };
        for proxy in &self.proxies {
            peer.proxies.insert(PeerId::from_hex(proxy).ok()?);
        }
        for membership in &self.memberships {
            let cluster = ClusterId::from_hex(&membership.cluster_id).ok()?;
            for sub in &membership.subclusters {
                peer.join(cluster, SubclusterId::from_hex(sub).ok()?);
            }
        }
        Some(peer)
    }
}

impl NodeState {
    /// Load validated snapshot contents.
    ///
    /// Restored peers start disconnected and must answer a resume ping
    /// before they are used directly. Their silence is counted from `now`.
    pub(crate) fn apply_restored(&mut self, restored: Restored, now: u64) {
        self.observe_clock(restored.clock);
        for mut peer in restored.peers {
            peer.last_update = peer.last_update.max(now);
            self.peers.insert(peer.peer_id, peer);
        }
        for (packet, inserted_at) in restored.cache {
            self.cache.restore(packet, inserted_at);
        }
        self.unpublished.extend(restored.unpublished);
        tracing::debug!(
            "Restored {} peers and {} cached packets",
            self.peers.len(),
            self.cache.len()
        );
    }
}
