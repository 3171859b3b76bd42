//! Async UDP transport implementation.
//!
//! [`AsyncUdpTransport`] wraps a Tokio `UdpSocket` configured through
//! `socket2`; [`UdpSocketFactory`] binds them for a node.

use crate::transport::{SocketFactory, Transport, TransportError, TransportResult, TransportStats};
use crate::{RECV_BUFFER_SIZE, SEND_BUFFER_SIZE};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Async UDP transport using Tokio.
pub struct AsyncUdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
    counters: Counters,
}

impl AsyncUdpTransport {
    /// Bind a UDP socket to `addr`. Port 0 selects an ephemeral port.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the address cannot be bound (the
    /// error kind is preserved so callers can recognise `AddrInUse`), and
    /// `TransportError::BindFailed` if socket configuration fails.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let addr = addr.into();

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .set_recv_buffer_size(RECV_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_send_buffer_size(SEND_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2.bind(&addr.into())?;

        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        tracing::debug!("Bound UDP socket on {:?}", socket.local_addr().ok());

        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.counters
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.counters
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// Binds real UDP sockets on a fixed local interface.
#[derive(Debug, Clone, Copy)]
pub struct UdpSocketFactory {
    ip: IpAddr,
}

impl UdpSocketFactory {
    /// Create a factory binding on `ip` (use `0.0.0.0` for all interfaces).
    #[must_use]
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }
}

#[async_trait]
impl SocketFactory for UdpSocketFactory {
    async fn bind(&self, port: u16) -> TransportResult<Arc<dyn Transport>> {
        let transport = AsyncUdpTransport::bind(SocketAddr::new(self.ip, port)).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_udp_bind() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport = AsyncUdpTransport::bind(addr).await.unwrap();
        let bound_addr = transport.local_addr().unwrap();
        assert_ne!(bound_addr.port(), 0);
        assert!(bound_addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_udp_send_recv_and_stats() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = AsyncUdpTransport::bind(addr).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = AsyncUdpTransport::bind(addr).await.unwrap();

        let sent = client.send_to(b"driftmesh", server_addr).await.unwrap();
        assert_eq!(sent, 9);

        let mut buf = vec![0u8; 1500];
        let (size, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();

        assert_eq!(&buf[..size], b"driftmesh");
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().bytes_received, 9);
    }

    #[tokio::test]
    async fn test_udp_close() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport = AsyncUdpTransport::bind(addr).await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_to(b"test", "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_bind_in_use_is_recoverable() {
        let first = AsyncUdpTransport::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();
        match AsyncUdpTransport::bind(taken).await {
            Err(e) => assert!(e.is_recoverable()),
            Ok(_) => panic!("second bind on {taken} should fail"),
        }
    }

    #[tokio::test]
    async fn test_factory_binds_ephemeral() {
        let factory = UdpSocketFactory::new("127.0.0.1".parse().unwrap());
        let transport = factory.bind(0).await.unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }
}
