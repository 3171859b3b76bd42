//! In-memory mesh fixture
//!
//! Builds nodes on a [`MemoryNetwork`] so scenarios with NAT devices run
//! deterministically under a paused Tokio clock.
//!
//! # Example
//!
//! ```no_run
//! use driftmesh_integration_tests::fixtures::Mesh;
//!
//! # async fn demo() {
//! let mut mesh = Mesh::new("demo");
//! let seed = mesh.add_seed(1);
//! let node = mesh.add_node(2, None, None);
//! seed.init().await.unwrap();
//! node.init().await.unwrap();
//! # }
//! ```

use driftmesh_core::node::{BootstrapPeer, NetworkAvailability};
use driftmesh_core::{ClusterId, NatType, Node, NodeConfig, NodeEvent};
use driftmesh_crypto::Identity;
use driftmesh_transport::{MemoryHost, MemoryNetwork, NatBehavior};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Primary port of every seed node
pub const SEED_PORT: u16 = 3456;

/// Probe port of every seed node
pub const SEED_PROBE_PORT: u16 = 3457;

/// A set of hosts sharing one in-memory network and one cluster
pub struct Mesh {
    /// The network every node is attached to
    pub net: MemoryNetwork,
    cluster_id: ClusterId,
    seeds: Vec<BootstrapPeer>,
}

impl Mesh {
    /// Empty mesh for the cluster named `cluster`
    pub fn new(cluster: &str) -> Self {
        Self {
            net: MemoryNetwork::new(),
            cluster_id: ClusterId::from_name(cluster),
            seeds: Vec::new(),
        }
    }

    /// Address of host `last` (10.0.0.`last`)
    pub fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    /// Cluster every node joins
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Seeds registered so far
    pub fn seeds(&self) -> &[BootstrapPeer] {
        &self.seeds
    }

    /// Node configuration for this mesh.
    ///
    /// `declared` skips reflection and advertises that NAT type.
    pub fn config(&self, declared: Option<NatType>) -> NodeConfig {
        let mut config = NodeConfig::for_cluster(self.cluster_id);
        config.bootstrap = self.seeds.clone();
        config.nat.static_type = declared;
        config
    }

    /// Add an indexed seed on a public host; later nodes bootstrap from it
    pub fn add_seed(&mut self, last: u8) -> Node {
        let host = self.net.add_host(Self::ip(last), None);
        let mut config = self.config(None);
        config.bind_ip = Self::ip(last);
        config.indexed = true;
        config.port = SEED_PORT;
        config.probe_port = SEED_PROBE_PORT;

        let node = build(host, config, Identity::generate(), None);
        self.seeds.push(BootstrapPeer {
            peer_id: node.peer_id(),
            address: SocketAddr::new(Self::ip(last), SEED_PORT),
        });
        node
    }

    /// Add a node on host `last`, optionally behind a NAT device
    pub fn add_node(&self, last: u8, nat: Option<NatBehavior>, declared: Option<NatType>) -> Node {
        self.add_node_with(last, nat, self.config(declared), Identity::generate(), None)
    }

    /// Add a node with full control over its configuration.
    ///
    /// A node on a public host binds its host address so it can advertise it.
    pub fn add_node_with(
        &self,
        last: u8,
        nat: Option<NatBehavior>,
        mut config: NodeConfig,
        identity: Identity,
        availability: Option<Arc<dyn NetworkAvailability>>,
    ) -> Node {
        if nat.is_none() && config.bind_ip.is_unspecified() {
            config.bind_ip = Self::ip(last);
        }
        let host = self.net.add_host(Self::ip(last), nat);
        build(host, config, identity, availability)
    }
}

fn build(
    host: MemoryHost,
    config: NodeConfig,
    identity: Identity,
    availability: Option<Arc<dyn NetworkAvailability>>,
) -> Node {
    let mut builder = Node::builder(config)
        .identity(identity)
        .socket_factory(Arc::new(host));
    if let Some(availability) = availability {
        builder = builder.availability(availability);
    }
    builder.build().expect("mesh node config is valid")
}

/// Wait up to `within` for an event matching `matches`
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<NodeEvent>,
    within: Duration,
    mut matches: F,
) -> Option<NodeEvent>
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
