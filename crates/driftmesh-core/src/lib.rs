//! # driftmesh Core
//!
//! Core protocol implementation for driftmesh.
//!
//! This crate provides:
//! - Packet encoding/decoding for the six packet kinds
//! - A content-addressed gossip cache with TTL eviction
//! - Dedup gating and adaptive per-source rate limiting
//! - NAT classification, reflection and connection strategy selection
//! - Remote peer bookkeeping and the node event loop
//! - Subcluster (topic) pub/sub on top of shared secrets

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod gate;
pub mod id;
pub mod messages;
pub mod nat;
pub mod node;
pub mod packet;
pub mod peer;
pub mod subcluster;

pub use cache::{Cache, CacheSummary};
pub use error::{IdError, PacketError};
pub use gate::Gate;
pub use id::{ClusterId, PacketId, PeerId, SubclusterId};
pub use nat::{NatType, Strategy};
pub use node::{
    JoinOptions, LocalSocket, Node, NodeBuilder, NodeConfig, NodeError, NodeEvent, NodeInfo,
    NodeSnapshot, PublishOptions,
};
pub use packet::{Packet, PacketBuilder, PacketKind};
pub use peer::RemotePeer;
pub use subcluster::{EventListener, Subcluster, SubclusterEvent};

/// Protocol version carried in byte 0 of every packet
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum sealed message size carried by one packet (bytes)
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Maximum encoded packet size (one datagram)
pub const MAX_PACKET_SIZE: usize = driftmesh_transport::MAX_DATAGRAM_SIZE;

/// Packet header size preceding the body (version + kind)
pub const PACKET_HEADER_SIZE: usize = 2;

/// Maximum number of subclusters advertised in one ping
pub const MAX_ADVERTISED_SUBCLUSTERS: usize = 16;

/// Number of keepalive intervals without a heartbeat before a peer is pruned
pub const PEER_SILENCE_INTERVALS: u32 = 4;
