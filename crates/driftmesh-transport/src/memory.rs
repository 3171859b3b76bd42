//! In-memory datagram network with simulated NAT devices.
//!
//! Every host owns one IP address. A host without a NAT receives datagrams on
//! its bound ports directly. A host behind a NAT gets an external port
//! allocated for each outbound mapping, and inbound datagrams reach the
//! internal socket only if the NAT's filtering rule admits the sender:
//!
//! ```text
//!  socket 10.0.0.7:50000 ──send──▶ NAT(mapping) ──▶ 10.0.0.7:40000 ──▶ peer
//!                                  ▲
//!  peer ──reply──▶ 10.0.0.7:40000 ─┘ filtering(contacted set) ──▶ socket
//! ```
//!
//! Delivery is immediate and in order, which keeps node tests deterministic
//! under a paused Tokio clock.

use crate::transport::{SocketFactory, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const FIRST_EPHEMERAL_PORT: u16 = 50_000;
const FIRST_EXTERNAL_PORT: u16 = 40_000;

/// Which inbound senders a NAT lets through an existing mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filtering {
    /// Anyone may send to a mapped port (full cone).
    AllowAny,
    /// Only IPs the mapping has sent to.
    AllowKnownIp,
    /// Only exact address and port pairs the mapping has sent to.
    AllowKnownIpAndPort,
}

/// How a NAT allocates external ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// One external port per internal socket.
    EndpointIndependent,
    /// A new external port per destination (symmetric NAT).
    EndpointDependent,
}

/// Behaviour of a simulated NAT device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatBehavior {
    /// Inbound filtering rule
    pub filtering: Filtering,
    /// Outbound mapping rule
    pub mapping: Mapping,
}

impl NatBehavior {
    /// Full-cone NAT: independent mapping, no filtering.
    pub const FULL_CONE: Self = Self {
        filtering: Filtering::AllowAny,
        mapping: Mapping::EndpointIndependent,
    };

    /// Symmetric NAT with the strictest filtering.
    pub const SYMMETRIC: Self = Self {
        filtering: Filtering::AllowKnownIpAndPort,
        mapping: Mapping::EndpointDependent,
    };
}

type Datagram = Result<(Vec<u8>, SocketAddr), io::ErrorKind>;

struct NatMapping {
    local_port: u16,
    contacted: HashSet<SocketAddr>,
}

struct Host {
    nat: Option<NatBehavior>,
    sockets: HashMap<u16, mpsc::UnboundedSender<Datagram>>,
    /// external port -> mapping
    mappings: HashMap<u16, NatMapping>,
    /// (local port, destination for dependent mappings) -> external port
    bindings: HashMap<(u16, Option<SocketAddr>), u16>,
    next_ephemeral: u16,
    next_external: u16,
    sent: u64,
}

impl Host {
    fn new(nat: Option<NatBehavior>) -> Self {
        Self {
            nat,
            sockets: HashMap::new(),
            mappings: HashMap::new(),
            bindings: HashMap::new(),
            next_ephemeral: FIRST_EPHEMERAL_PORT,
            next_external: FIRST_EXTERNAL_PORT,
            sent: 0,
        }
    }

    fn allocate_ephemeral(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let port = self.next_ephemeral;
            self.next_ephemeral = self.next_ephemeral.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.sockets.contains_key(&port) {
                return Some(port);
            }
        }
        None
    }

    /// Translate an outbound datagram's source through the NAT, recording
    /// the destination on the mapping it used.
    fn translate_outbound(&mut self, ip: IpAddr, local_port: u16, dest: SocketAddr) -> SocketAddr {
        let Some(nat) = self.nat else {
            return SocketAddr::new(ip, local_port);
        };

        let key = match nat.mapping {
            Mapping::EndpointIndependent => (local_port, None),
            Mapping::EndpointDependent => (local_port, Some(dest)),
        };

        let external = match self.bindings.get(&key) {
            Some(port) => *port,
            None => {
                let port = self.next_external;
                self.next_external = self.next_external.checked_add(1).unwrap_or(FIRST_EXTERNAL_PORT);
                self.bindings.insert(key, port);
                self.mappings.insert(
                    port,
                    NatMapping {
                        local_port,
                        contacted: HashSet::new(),
                    },
                );
                port
            }
        };

        if let Some(mapping) = self.mappings.get_mut(&external) {
            mapping.contacted.insert(dest);
        }
        SocketAddr::new(ip, external)
    }

    /// Resolve the internal port an inbound datagram is delivered to, if any.
    fn admit_inbound(&self, port: u16, source: SocketAddr) -> Option<u16> {
        let Some(nat) = self.nat else {
            return Some(port);
        };
        let mapping = self.mappings.get(&port)?;
        let admitted = match nat.filtering {
            Filtering::AllowAny => true,
            Filtering::AllowKnownIp => mapping.contacted.iter().any(|a| a.ip() == source.ip()),
            Filtering::AllowKnownIpAndPort => mapping.contacted.contains(&source),
        };
        admitted.then_some(mapping.local_port)
    }
}

#[derive(Default)]
struct Fabric {
    hosts: HashMap<IpAddr, Host>,
    dropped: u64,
}

/// Shared in-memory datagram network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fabric(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a host, optionally behind a NAT device.
    ///
    /// Re-adding an existing address replaces that host and drops its sockets.
    pub fn add_host(&self, ip: IpAddr, nat: Option<NatBehavior>) -> MemoryHost {
        self.fabric().hosts.insert(ip, Host::new(nat));
        MemoryHost {
            network: self.clone(),
            ip,
        }
    }

    /// Number of datagrams sent by sockets on `ip`.
    #[must_use]
    pub fn sent_from(&self, ip: IpAddr) -> u64 {
        self.fabric().hosts.get(&ip).map_or(0, |h| h.sent)
    }

    /// Number of datagrams that reached no socket.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.fabric().dropped
    }

    /// Make the next receive on `addr` fail with the given error kind.
    ///
    /// Returns false if no socket is bound there.
    pub fn inject_error(&self, addr: SocketAddr, kind: io::ErrorKind) -> bool {
        let fabric = self.fabric();
        fabric
            .hosts
            .get(&addr.ip())
            .and_then(|h| h.sockets.get(&addr.port()))
            .is_some_and(|inbox| inbox.send(Err(kind)).is_ok())
    }

    fn route(&self, from: SocketAddr, dest: SocketAddr, buf: &[u8]) {
        let mut fabric = self.fabric();

        let source = match fabric.hosts.get_mut(&from.ip()) {
            Some(host) => {
                host.sent += 1;
                host.translate_outbound(from.ip(), from.port(), dest)
            }
            None => return,
        };

        let delivered = fabric
            .hosts
            .get(&dest.ip())
            .and_then(|host| {
                let port = host.admit_inbound(dest.port(), source)?;
                host.sockets.get(&port)
            })
            .is_some_and(|inbox| inbox.send(Ok((buf.to_vec(), source))).is_ok());

        if !delivered {
            fabric.dropped += 1;
            tracing::trace!("memory network dropped datagram {} -> {}", source, dest);
        }
    }

    fn release(&self, addr: SocketAddr) {
        if let Some(host) = self.fabric().hosts.get_mut(&addr.ip()) {
            host.sockets.remove(&addr.port());
        }
    }
}

/// One host on a [`MemoryNetwork`]; binds sockets for a node.
#[derive(Clone)]
pub struct MemoryHost {
    network: MemoryNetwork,
    ip: IpAddr,
}

impl MemoryHost {
    /// Address of this host.
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Bind a socket synchronously.
    ///
    /// # Errors
    /// Returns an `AddrInUse` I/O error if the port is taken, and
    /// `BindFailed` if the host was removed from the network.
    pub fn bind_socket(&self, port: u16) -> TransportResult<MemorySocket> {
        let mut fabric = self.network.fabric();
        let host = fabric
            .hosts
            .get_mut(&self.ip)
            .ok_or_else(|| TransportError::BindFailed(format!("no host {}", self.ip)))?;

        let port = if port == 0 {
            host.allocate_ephemeral()
                .ok_or_else(|| TransportError::BindFailed("ephemeral ports exhausted".into()))?
        } else if host.sockets.contains_key(&port) {
            return Err(TransportError::Io(io::Error::from(io::ErrorKind::AddrInUse)));
        } else {
            port
        };

        let (tx, rx) = mpsc::unbounded_channel();
        host.sockets.insert(port, tx);

        Ok(MemorySocket {
            network: self.network.clone(),
            local: SocketAddr::new(self.ip, port),
            inbox: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl SocketFactory for MemoryHost {
    async fn bind(&self, port: u16) -> TransportResult<Arc<dyn Transport>> {
        Ok(Arc::new(self.bind_socket(port)?))
    }
}

/// A socket bound on a [`MemoryHost`].
pub struct MemorySocket {
    network: MemoryNetwork,
    local: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: AtomicBool,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[async_trait]
impl Transport for MemorySocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.network.route(self.local, addr, buf);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(Ok((data, from))) => {
                let size = data.len().min(buf.len());
                buf[..size].copy_from_slice(&data[..size]);
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                Ok((size, from))
            }
            Some(Err(kind)) => Err(TransportError::Io(io::Error::from(kind))),
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local)
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.network.release(self.local);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: 0,
            recv_errors: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    async fn recv(socket: &MemorySocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 1500];
        let (size, from) = socket.recv_from(&mut buf).await.unwrap();
        buf.truncate(size);
        (buf, from)
    }

    #[tokio::test]
    async fn test_open_hosts_deliver_directly() {
        let net = MemoryNetwork::new();
        let a = net.add_host(ip(1), None).bind_socket(0).unwrap();
        let b = net.add_host(ip(2), None).bind_socket(7000).unwrap();

        a.send_to(b"hi", b.local_addr().unwrap()).await.unwrap();
        let (data, from) = recv(&b).await;
        assert_eq!(data, b"hi");
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(net.sent_from(ip(1)), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_addr_in_use() {
        let net = MemoryNetwork::new();
        let host = net.add_host(ip(1), None);
        let _first = host.bind_socket(7000).unwrap();
        let err = host.bind_socket(7000).err().unwrap();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_independent_mapping_reuses_port() {
        let net = MemoryNetwork::new();
        let natted = net
            .add_host(ip(1), Some(NatBehavior::FULL_CONE))
            .bind_socket(0)
            .unwrap();
        let b = net.add_host(ip(2), None).bind_socket(7000).unwrap();
        let c = net.add_host(ip(3), None).bind_socket(7000).unwrap();

        natted.send_to(b"x", b.local_addr().unwrap()).await.unwrap();
        natted.send_to(b"x", c.local_addr().unwrap()).await.unwrap();
        let (_, seen_b) = recv(&b).await;
        let (_, seen_c) = recv(&c).await;
        assert_eq!(seen_b, seen_c);
        assert_ne!(seen_b, natted.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dependent_mapping_changes_port() {
        let net = MemoryNetwork::new();
        let natted = net
            .add_host(ip(1), Some(NatBehavior::SYMMETRIC))
            .bind_socket(0)
            .unwrap();
        let b = net.add_host(ip(2), None).bind_socket(7000).unwrap();
        let c = net.add_host(ip(3), None).bind_socket(7000).unwrap();

        natted.send_to(b"x", b.local_addr().unwrap()).await.unwrap();
        natted.send_to(b"x", c.local_addr().unwrap()).await.unwrap();
        let (_, seen_b) = recv(&b).await;
        let (_, seen_c) = recv(&c).await;
        assert_ne!(seen_b.port(), seen_c.port());
    }

    #[tokio::test]
    async fn test_filtering_rules() {
        let net = MemoryNetwork::new();
        let behavior = NatBehavior {
            filtering: Filtering::AllowKnownIp,
            mapping: Mapping::EndpointIndependent,
        };
        let natted = net.add_host(ip(1), Some(behavior)).bind_socket(0).unwrap();
        let b_host = net.add_host(ip(2), None);
        let b_main = b_host.bind_socket(7000).unwrap();
        let b_other = b_host.bind_socket(7001).unwrap();
        let stranger = net.add_host(ip(3), None).bind_socket(7000).unwrap();

        natted.send_to(b"open", b_main.local_addr().unwrap()).await.unwrap();
        let (_, external) = recv(&b_main).await;

        // Same IP, different port passes an AllowKnownIp filter.
        b_other.send_to(b"known ip", external).await.unwrap();
        let (data, _) = recv(&natted).await;
        assert_eq!(data, b"known ip");

        // An unknown IP is filtered.
        let dropped = net.dropped();
        stranger.send_to(b"blocked", external).await.unwrap();
        assert_eq!(net.dropped(), dropped + 1);
    }

    #[tokio::test]
    async fn test_unsolicited_inbound_to_nat_is_dropped() {
        let net = MemoryNetwork::new();
        let _natted = net
            .add_host(ip(1), Some(NatBehavior::FULL_CONE))
            .bind_socket(7000)
            .unwrap();
        let b = net.add_host(ip(2), None).bind_socket(0).unwrap();
        b.send_to(b"x", SocketAddr::new(ip(1), 7000)).await.unwrap();
        assert_eq!(net.dropped(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_port_and_ends_recv() {
        let net = MemoryNetwork::new();
        let host = net.add_host(ip(1), None);
        let socket = host.bind_socket(7000).unwrap();
        socket.close().await.unwrap();
        assert!(socket.is_closed());
        assert!(matches!(
            socket.recv_from(&mut [0u8; 8]).await,
            Err(TransportError::Closed)
        ));
        assert!(host.bind_socket(7000).is_ok());
    }

    #[tokio::test]
    async fn test_inject_error() {
        let net = MemoryNetwork::new();
        let socket = net.add_host(ip(1), None).bind_socket(7000).unwrap();
        assert!(net.inject_error(socket.local_addr().unwrap(), io::ErrorKind::ConnectionReset));
        let err = socket.recv_from(&mut [0u8; 8]).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
