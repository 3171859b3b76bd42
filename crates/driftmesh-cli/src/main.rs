//! driftmesh CLI
//!
//! NAT-aware peer-to-peer gossip from the command line.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use driftmesh_core::node::NodeConfig;
use driftmesh_core::{JoinOptions, Node, NodeEvent, NodeSnapshot, PublishOptions};
use driftmesh_crypto::Identity;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use config::Config;

/// driftmesh - gossip across NATs
#[derive(Parser)]
#[command(name = "driftmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity key
    Keygen {
        /// Output file (defaults to `node.identity_file`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Run a node until Ctrl+C, printing everything it receives
    Run {
        /// Shared secrets of the subclusters to join
        #[arg(short, long = "secret")]
        secrets: Vec<String>,
    },

    /// Publish one event and stay up long enough to gossip it
    Publish {
        /// Subcluster shared secret
        #[arg(short, long)]
        secret: String,

        /// Event name
        #[arg(short, long)]
        event: String,

        /// Event value
        #[arg(required = true)]
        value: String,

        /// Time to live in seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Seconds to keep gossiping before exiting
        #[arg(long, default_value_t = 5)]
        linger: u64,
    },

    /// Show identity, configuration and persisted state
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // RUST_LOG wins, then --verbose, then the config file
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Keygen { output, force } => {
            let path = output.unwrap_or_else(|| config.node.identity_file.clone());
            generate_identity(&path, force)?;
        }
        Commands::Run { secrets } => {
            run_node(&config, secrets).await?;
        }
        Commands::Publish {
            secret,
            event,
            value,
            ttl,
            linger,
        } => {
            publish_event(&config, &secret, &event, value.as_bytes(), ttl, linger).await?;
        }
        Commands::Info => {
            show_info(&config).await?;
        }
    }

    Ok(())
}

/// Generate a new identity key
fn generate_identity(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }

    println!("Generating new Ed25519 identity...");
    let identity = Identity::generate();
    println!("Peer id: {}", hex::encode(identity.public_key()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, identity.to_hex())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Identity saved to: {}", path.display());
    println!("\nKeep this file private. It is your node's signing key.");
    Ok(())
}

/// Load the identity file, creating one on first use
fn load_identity(path: &Path) -> anyhow::Result<Identity> {
    if !path.exists() {
        tracing::info!("No identity at {}, generating one", path.display());
        generate_identity(path, false)?;
    }
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Identity::from_hex(encoded.trim())
        .with_context(|| format!("Invalid identity in {}", path.display()))
}

/// Build a node, resuming from the snapshot file when it belongs to us
fn build_node(config: &Config, node_config: NodeConfig, identity: Identity) -> anyhow::Result<Node> {
    let path = &config.node.snapshot_file;
    if path.exists() {
        match NodeSnapshot::load(path) {
            Ok(snapshot) => {
                match Node::builder(node_config.clone())
                    .identity(identity.clone())
                    .restore(snapshot)
                    .build()
                {
                    Ok(node) => {
                        tracing::info!("Resumed from {}", path.display());
                        return Ok(node);
                    }
                    Err(e) => tracing::warn!("Ignoring snapshot {}: {}", path.display(), e),
                }
            }
            Err(e) => tracing::warn!("Ignoring snapshot {}: {}", path.display(), e),
        }
    }
    Ok(Node::builder(node_config).identity(identity).build()?)
}

async fn start(config: &Config) -> anyhow::Result<Node> {
    let identity = load_identity(&config.node.identity_file)?;
    let node = build_node(config, config.to_node_config()?, identity)?;
    node.init().await.context("Failed to start node")?;
    Ok(node)
}

async fn save_and_close(config: &Config, node: &Node) -> anyhow::Result<()> {
    let snapshot = node.snapshot().await;
    node.close().await;
    snapshot
        .save(&config.node.snapshot_file)
        .with_context(|| format!("Failed to save {}", config.node.snapshot_file.display()))?;
    tracing::info!("Saved state to {}", config.node.snapshot_file.display());
    Ok(())
}

/// Run a node until Ctrl+C
async fn run_node(config: &Config, secrets: Vec<String>) -> anyhow::Result<()> {
    let node = start(config).await?;
    let mut events = node.subscribe();

    let info = node.info().await;
    println!("driftmesh node");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Peer id: {}", info.peer_id);
    println!("Cluster: {}", config.node.cluster);
    if let Some(addr) = info.local_address {
        println!("Listen: {}", addr);
    }

    for secret in &secrets {
        let subcluster = node.join(secret.as_bytes(), JoinOptions::default()).await?;
        println!("Joined subcluster {}", subcluster.id().short());
    }

    println!("\nPress Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("\nShutting down...");
    save_and_close(config, &node).await
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::Connection { peer_id, strategy } => {
            println!("connected    {} ({:?})", peer_id.short(), strategy);
        }
        NodeEvent::Proxied { peer_id, proxy } => {
            println!("proxied      {} via {}", peer_id.short(), proxy.short());
        }
        NodeEvent::Disconnection { peer_id } => {
            println!("disconnected {}", peer_id.short());
        }
        NodeEvent::NatResolved { nat_type, address } => match address {
            Some(addr) => println!("nat          {} at {}", nat_type, addr),
            None => println!("nat          {}", nat_type),
        },
        NodeEvent::Message(message) => {
            let from = message
                .from
                .map(|p| p.short())
                .unwrap_or_else(|| "?".to_string());
            println!(
                "message      [{}] {} from {}: {}",
                message.subcluster_id.short(),
                message.name,
                from,
                String::from_utf8_lossy(&message.value)
            );
        }
        NodeEvent::Error { message } => {
            eprintln!("error        {}", message);
        }
    }
}

/// Publish one event
async fn publish_event(
    config: &Config,
    secret: &str,
    event: &str,
    value: &[u8],
    ttl: Option<u64>,
    linger: u64,
) -> anyhow::Result<()> {
    let node = start(config).await?;
    let options = PublishOptions {
        ttl: ttl.map(Duration::from_secs),
    };
    let id = node
        .publish(secret.as_bytes(), event, value, options)
        .await
        .context("Publish failed")?;
    println!("Published {}", id);

    tokio::time::sleep(Duration::from_secs(linger)).await;
    let queued = node.info().await.unpublished;
    if queued > 0 {
        println!("{} publish(es) still queued; they are kept for the next run", queued);
    }
    save_and_close(config, &node).await
}

/// Show identity, configuration and persisted state
async fn show_info(config: &Config) -> anyhow::Result<()> {
    let identity = load_identity(&config.node.identity_file)?;
    let node = build_node(config, config.to_node_config()?, identity)?;
    let info = node.info().await;

    println!("driftmesh");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Identity:");
    println!("  Peer id: {}", info.peer_id);
    println!("  File: {}", config.node.identity_file.display());
    println!();

    println!("Configuration:");
    println!("  Cluster: {} ({})", config.node.cluster, info.cluster_id.short());
    println!("  Bind: {}:{}", config.network.bind_ip, config.network.port);
    println!("  Probe port: {}", config.network.probe_port);
    println!("  Indexed: {}", config.node.indexed);
    println!("  Bootstrap peers: {}", config.bootstrap.peers.len());
    println!("  Keepalive: {}s", config.network.keepalive_secs);
    println!();

    println!("Persisted state:");
    println!("  NAT type: {}", info.nat_type);
    println!("  Known peers: {}", info.peers);
    println!("  Cached packets: {}", info.cache_size);
    println!("  Queued publishes: {}", info.unpublished);

    node.close().await;
    Ok(())
}
