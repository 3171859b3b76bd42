//! Error types for the Node API
//!
//! Errors are categorized to support retry logic.
//!
//! # Error Categories
//!
//! - **Transient**: Temporary failures that may succeed on retry (socket errors, unreachable peers)
//! - **Permanent**: Failures that will not succeed without intervention (invalid config, oversize payload)
//!
//! # Example
//!
//! ```no_run
//! use driftmesh_core::node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use crate::error::{IdError, PacketError};
use crate::id::PeerId;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Failed to bind the node's sockets
    #[error("Transport initialization failed: {0}")]
    TransportInit(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Cryptographic Errors ============
    /// Sealing, opening or signature verification failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============ Payload Errors ============
    /// Payload does not fit in a single packet
    #[error("Payload too large: {size} bytes (max {max})")]
    Capacity {
        /// Requested size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// Input failed validation
    #[error("Validation failed: {0}")]
    Validation(Cow<'static, str>),

    // ============ Peer Errors ============
    /// Peer not in the peer table
    #[error("Peer not found: {}", .0.short())]
    PeerNotFound(PeerId),

    /// Peer known but no direct or proxied route exists
    #[error("Peer unreachable: {}", .0.short())]
    PeerUnreachable(PeerId),

    // ============ I/O Errors ============
    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Generic error for edge cases
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_) | NodeError::Transport(_) | NodeError::PeerUnreachable(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::Capacity { .. }
                | NodeError::Validation(_)
                | NodeError::PeerNotFound(_)
                | NodeError::InvalidState(_)
        )
    }

    /// Returns true if this error should trigger a retry with backoff
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient() && !matches!(self, NodeError::Timeout(_))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a validation error with static context (zero allocation)
    #[must_use]
    pub const fn validation(context: &'static str) -> Self {
        NodeError::Validation(Cow::Borrowed(context))
    }

    /// Create a serialization error with static context (zero allocation)
    #[must_use]
    pub const fn serialization(context: &'static str) -> Self {
        NodeError::Serialization(Cow::Borrowed(context))
    }
}

impl From<driftmesh_crypto::CryptoError> for NodeError {
    fn from(err: driftmesh_crypto::CryptoError) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<driftmesh_transport::TransportError> for NodeError {
    fn from(err: driftmesh_transport::TransportError) -> Self {
        NodeError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<PacketError> for NodeError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::PayloadTooLarge { size, max } => NodeError::Capacity { size, max },
            other => NodeError::Serialization(Cow::Owned(other.to_string())),
        }
    }
}

impl From<IdError> for NodeError {
    fn from(err: IdError) -> Self {
        NodeError::Validation(Cow::Owned(err.to_string()))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;
