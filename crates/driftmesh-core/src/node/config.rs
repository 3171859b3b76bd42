//! Node configuration

use crate::id::{ClusterId, PeerId};
use crate::nat::NatType;
use crate::node::error::{NodeError, Result};
use crate::node::rate_limiter::RateLimitConfig;
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Largest number of sockets the punch pool may hold
pub const MAX_PUNCH_SOCKETS: usize = 256;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Cluster namespace. Required.
    pub cluster_id: Option<ClusterId>,

    /// Interface to bind on
    pub bind_ip: IpAddr,

    /// Primary socket port (0 = OS-assigned)
    pub port: u16,

    /// Probe socket port (0 = OS-assigned)
    pub probe_port: u16,

    /// Run as a well-known, always reachable peer
    pub indexed: bool,

    /// Peers contacted at startup
    pub bootstrap: Vec<BootstrapPeer>,

    /// Gossip configuration
    pub gossip: GossipConfig,

    /// NAT configuration
    pub nat: NatConfig,

    /// Timing configuration
    pub timing: TimingConfig,

    /// Inbound rate limits
    pub rate_limit: RateLimitConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster_id: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            probe_port: 0,
            indexed: false,
            bootstrap: Vec::new(),
            gossip: GossipConfig::default(),
            nat: NatConfig::default(),
            timing: TimingConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Configuration for `cluster_id` with defaults everywhere else
    #[must_use]
    pub fn for_cluster(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id: Some(cluster_id),
            ..Self::default()
        }
    }

    /// Check the configuration before the node is built.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<ClusterId> {
        let cluster_id = self
            .cluster_id
            .ok_or(NodeError::InvalidConfig(Cow::Borrowed("cluster_id is required")))?;

        if self.gossip.max_hops == 0 {
            return Err(invalid("gossip.max_hops must be at least 1"));
        }
        if self.gossip.fanout == 0 {
            return Err(invalid("gossip.fanout must be at least 1"));
        }
        if self.gossip.dedup_credit == 0 {
            return Err(invalid("gossip.dedup_credit must be at least 1"));
        }
        if self.gossip.max_ttl.is_zero() {
            return Err(invalid("gossip.max_ttl must be non-zero"));
        }
        if self.nat.punch_sockets > MAX_PUNCH_SOCKETS {
            return Err(invalid("nat.punch_sockets exceeds 256"));
        }
        if self.timing.keepalive.is_zero() {
            return Err(invalid("timing.keepalive must be non-zero"));
        }
        if self.rate_limit.replicable_quota == 0 || self.rate_limit.control_quota == 0 {
            return Err(invalid("rate limit quotas must be non-zero"));
        }
        if let Some(nat) = self.nat.static_type {
            if !nat.is_resolved() {
                return Err(invalid("nat.static_type must name a firewall and a mapping"));
            }
        }
        Ok(cluster_id)
    }
}

fn invalid(context: &'static str) -> NodeError {
    NodeError::InvalidConfig(Cow::Borrowed(context))
}

/// Well-known peer contacted at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    /// Peer id
    pub peer_id: PeerId,

    /// Address
    pub address: SocketAddr,
}

/// Gossip and cache configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Relay ceiling; packets at this hop count are not forwarded
    pub max_hops: u8,

    /// Peers chosen per multicast
    pub fanout: usize,

    /// Ticks a packet id stays in the dedup gate
    pub dedup_credit: u32,

    /// Ticks an introduction pair stays suppressed
    pub intro_credit: u32,

    /// Default time to live for published packets
    pub default_ttl: Duration,

    /// Cap on any packet's cached lifetime
    pub max_ttl: Duration,

    /// Cached packets pushed to a peer that joins directly
    pub catch_up_limit: usize,

    /// Members a connector introduces per join
    pub max_introductions: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_hops: 16,
            fanout: 3,
            dedup_credit: 32,
            intro_credit: 4,
            default_ttl: Duration::from_secs(10 * 60),
            max_ttl: Duration::from_secs(30 * 60),
            catch_up_limit: 32,
            max_introductions: 8,
        }
    }
}

/// NAT reflection and traversal configuration
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Skip reflection and use this type
    pub static_type: Option<NatType>,

    /// How long a reflection stage waits for its pongs
    pub reflection_timeout: Duration,

    /// How long unsolicited probe replies are counted after stage two
    pub probe_window: Duration,

    /// Re-run reflection after this long
    pub reflection_refresh: Duration,

    /// Pool sockets opened for one dependent-mapping punch
    pub punch_sockets: usize,

    /// Idle time before a pool socket is reclaimed
    pub punch_idle_timeout: Duration,

    /// Ports tried above the peer's last known port when predicting
    pub prediction_span: u16,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            static_type: None,
            reflection_timeout: Duration::from_secs(2),
            probe_window: Duration::from_millis(500),
            reflection_refresh: Duration::from_secs(10 * 60),
            punch_sockets: 32,
            punch_idle_timeout: Duration::from_secs(90),
            prediction_span: 16,
        }
    }
}

/// Timing configuration
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Maintenance tick and heartbeat interval
    pub keepalive: Duration,

    /// Wait between handshake escalation steps
    pub intro_timeout: Duration,

    /// Resend delays for connection pings
    pub ping_retries: Vec<Duration>,

    /// Poll interval of socket receive loops
    pub recv_poll: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            intro_timeout: Duration::from_secs(2),
            ping_retries: vec![Duration::from_millis(256), Duration::from_millis(512)],
            recv_poll: Duration::from_millis(100),
        }
    }
}
