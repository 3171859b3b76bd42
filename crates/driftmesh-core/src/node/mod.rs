//! Node orchestration layer for driftmesh
//!
//! A [`Node`] owns the sockets, the peer table, the gossip cache and every
//! timer, and exposes the user-facing API:
//! - Joining subclusters and publishing or streaming events to them
//! - NAT reflection and introduction-driven connection setup
//! - Periodic maintenance: heartbeats, cache eviction, pruning, re-announcing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Node API / Subcluster facade               │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet handlers │ Reflection │ Handshakes │ Maintenance│
//! ├─────────────────────────────────────────────────────────┤
//! │  Cache │ Gates │ Rate limiter │ Peer table │ Sockets    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use driftmesh_core::{ClusterId, Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::for_cluster(ClusterId::from_name("example"));
//!     let node = Node::builder(config).build()?;
//!     node.init().await?;
//!
//!     let chat = node.join(b"shared secret", Default::default()).await?;
//!     chat.publish("hello", b"world").await?;
//!
//!     node.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
mod handshake;
mod maintenance;
#[allow(clippy::module_inception)]
pub mod node;
mod packet_handler;
pub mod publish;
pub mod rate_limiter;
mod reflection;
pub mod snapshot;
pub mod sockets;
pub(crate) mod state;

pub use config::{BootstrapPeer, GossipConfig, NatConfig, NodeConfig, TimingConfig};
pub use error::{NodeError, Result};
pub use events::{AlwaysOnline, ManualAvailability, NetworkAvailability, NodeEvent};
pub use node::{Node, NodeBuilder, NodeInfo};
pub use publish::PublishOptions;
pub use rate_limiter::{RateLimitConfig, RateLimitMetrics, RateLimiter};
pub use snapshot::NodeSnapshot;
pub use sockets::LocalSocket;
pub use state::JoinOptions;
