//! # driftmesh Transport
//!
//! Datagram transport layer for the driftmesh protocol.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) trait every socket implements
//! - The [`SocketFactory`](transport::SocketFactory) trait nodes bind through
//! - Async UDP sockets built on `socket2` and Tokio
//! - An in-memory datagram network that simulates NAT mapping and filtering,
//!   used to exercise reflection and hole punching without real routers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod udp_async;

pub use memory::{Filtering, Mapping, MemoryHost, MemoryNetwork, MemorySocket, NatBehavior};
pub use transport::{SocketFactory, Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::{AsyncUdpTransport, UdpSocketFactory};

/// Largest datagram any driftmesh socket reads or writes
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Socket receive buffer size requested from the OS
pub const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Socket send buffer size requested from the OS
pub const SEND_BUFFER_SIZE: usize = 256 * 1024;
