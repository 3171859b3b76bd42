//! Transport trait abstraction.
//!
//! A node never touches sockets directly. It binds through a
//! [`SocketFactory`] and talks to the resulting [`Transport`] objects, so the
//! same node runs over real UDP or over the in-memory network.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),
}

impl TransportError {
    /// Returns true for socket failures that are fixed by binding again.
    ///
    /// Connection reset, connection refused, address in use and timeouts all
    /// leave the node able to continue on a fresh socket.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::AddrInUse
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// # Examples
///
/// ```no_run
/// use driftmesh_transport::transport::Transport;
/// use driftmesh_transport::udp_async::AsyncUdpTransport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = AsyncUdpTransport::bind(addr).await?;
///
/// transport.send_to(b"ping", "127.0.0.1:9820".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// println!("Received {} bytes from {}", size, from);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to a remote address.
    ///
    /// # Errors
    /// Returns `TransportError` if the send operation fails
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram, returning its size and sender.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport. Subsequent operations return `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Binds datagram sockets on behalf of a node.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Bind a socket on `port` (0 picks an ephemeral port).
    ///
    /// # Errors
    /// Returns `TransportError` if the port is unavailable
    async fn bind(&self, port: u16) -> TransportResult<Arc<dyn Transport>>;
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::AddrInUse,
            io::ErrorKind::TimedOut,
        ] {
            assert!(TransportError::Io(io::Error::from(kind)).is_recoverable());
        }
    }

    #[test]
    fn test_unrecoverable_kinds() {
        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_recoverable());
        assert!(!TransportError::Closed.is_recoverable());
        assert!(!TransportError::BindFailed("nope".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "Transport is closed");
    }
}
