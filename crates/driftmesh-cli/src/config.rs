//! Configuration system for the driftmesh CLI.

use anyhow::Context;
use driftmesh_core::node::{BootstrapPeer, NodeConfig};
use driftmesh_core::{ClusterId, NatType, PeerId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// driftmesh configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity and cluster
    #[serde(default)]
    pub node: NodeSection,
    /// Socket configuration
    #[serde(default)]
    pub network: NetworkSection,
    /// Well-known peers
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    /// Gossip tuning
    #[serde(default)]
    pub gossip: GossipSection,
    /// NAT handling
    #[serde(default)]
    pub nat: NatSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Node identity and cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Cluster name; every peer of one deployment uses the same one
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Hex identity key file
    #[serde(default = "default_identity_path")]
    pub identity_file: PathBuf,
    /// Persisted peer table, cache and queue
    #[serde(default = "default_snapshot_path")]
    pub snapshot_file: PathBuf,
    /// Serve as an always reachable bootstrap peer
    #[serde(default)]
    pub indexed: bool,
}

/// Socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Interface to bind on
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Primary port (0 = OS-assigned)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Probe port (0 = OS-assigned)
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    /// Maintenance interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// Well-known peers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BootstrapSection {
    /// Entries of the form `<peer id hex>@<ip>:<port>`
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Gossip tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipSection {
    /// Peers per multicast
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Relay ceiling
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    /// Default publish lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

/// NAT handling
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatSection {
    /// Skip reflection: `unrestricted`, `addr-restricted`,
    /// `port-restricted` or `endpoint-restricted`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_type: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("driftmesh")
}

fn default_cluster() -> String {
    "driftmesh".to_string()
}

fn default_identity_path() -> PathBuf {
    data_dir().join("identity")
}

fn default_snapshot_path() -> PathBuf {
    data_dir().join("state.json")
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3456
}

fn default_probe_port() -> u16 {
    3457
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_fanout() -> usize {
    3
}

fn default_max_hops() -> u8 {
    16
}

fn default_ttl_secs() -> u64 {
    10 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            identity_file: default_identity_path(),
            snapshot_file: default_snapshot_path(),
            indexed: false,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            probe_port: default_probe_port(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            fanout: default_fanout(),
            max_hops: default_max_hops(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("driftmesh/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.cluster.trim().is_empty() {
            anyhow::bail!("node.cluster must not be empty");
        }
        self.bind_ip()?;
        if self.network.keepalive_secs == 0 {
            anyhow::bail!("network.keepalive_secs must be at least 1");
        }
        if self.network.port != 0 && self.network.port == self.network.probe_port {
            anyhow::bail!("network.port and network.probe_port must differ");
        }
        if self.gossip.fanout == 0 || self.gossip.fanout > 64 {
            anyhow::bail!("gossip.fanout must be between 1 and 64");
        }
        if self.gossip.max_hops == 0 {
            anyhow::bail!("gossip.max_hops must be at least 1");
        }
        if self.gossip.ttl_secs == 0 {
            anyhow::bail!("gossip.ttl_secs must be at least 1");
        }
        self.static_nat_type()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        for entry in &self.bootstrap.peers {
            parse_bootstrap(entry)?;
        }
        Ok(())
    }

    fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.network
            .bind_ip
            .parse()
            .with_context(|| format!("Invalid network.bind_ip: {}", self.network.bind_ip))
    }

    fn static_nat_type(&self) -> anyhow::Result<Option<NatType>> {
        let Some(name) = &self.nat.static_type else {
            return Ok(None);
        };
        let nat = match name.to_lowercase().as_str() {
            "unrestricted" => NatType::UNRESTRICTED,
            "addr-restricted" => NatType::ADDR_RESTRICTED,
            "port-restricted" => NatType::PORT_RESTRICTED,
            "endpoint-restricted" => NatType::ENDPOINT_RESTRICTED,
            other => anyhow::bail!("Invalid nat.static_type: {}", other),
        };
        Ok(Some(nat))
    }

    /// Build the library configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a field does not parse.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::for_cluster(ClusterId::from_name(&self.node.cluster));
        config.bind_ip = self.bind_ip()?;
        config.port = self.network.port;
        config.probe_port = self.network.probe_port;
        config.indexed = self.node.indexed;
        config.bootstrap = self
            .bootstrap
            .peers
            .iter()
            .map(|entry| parse_bootstrap(entry))
            .collect::<anyhow::Result<_>>()?;
        config.gossip.fanout = self.gossip.fanout;
        config.gossip.max_hops = self.gossip.max_hops;
        config.gossip.default_ttl = Duration::from_secs(self.gossip.ttl_secs);
        if config.gossip.max_ttl < config.gossip.default_ttl {
            config.gossip.max_ttl = config.gossip.default_ttl;
        }
        config.nat.static_type = self.static_nat_type()?;
        config.timing.keepalive = Duration::from_secs(self.network.keepalive_secs);
        Ok(config)
    }
}

/// Parse `<peer id hex>@<ip>:<port>`
fn parse_bootstrap(entry: &str) -> anyhow::Result<BootstrapPeer> {
    let (id, address) = entry
        .split_once('@')
        .with_context(|| format!("Bootstrap peer '{}' must look like <peer id>@<ip>:<port>", entry))?;
    let peer_id = PeerId::from_hex(id)
        .with_context(|| format!("Bootstrap peer '{}' has an invalid peer id", entry))?;
    let address: SocketAddr = address
        .parse()
        .with_context(|| format!("Bootstrap peer '{}' has an invalid address", entry))?;
    if address.port() == 0 {
        anyhow::bail!("Bootstrap peer '{}' has invalid port: 0", entry);
    }
    Ok(BootstrapPeer { peer_id, address })
}
