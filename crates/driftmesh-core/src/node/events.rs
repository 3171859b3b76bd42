//! Node events and network availability.

use crate::id::PeerId;
use crate::nat::{NatType, Strategy};
use crate::subcluster::SubclusterEvent;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capacity of the node event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events broadcast by a node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// First direct contact with a peer
    Connection {
        /// The peer
        peer_id: PeerId,
        /// Strategy that connected us
        strategy: Strategy,
    },

    /// A peer is now reached through a proxy
    Proxied {
        /// The peer
        peer_id: PeerId,
        /// Proxy relaying to it
        proxy: PeerId,
    },

    /// A peer was pruned
    Disconnection {
        /// The peer
        peer_id: PeerId,
    },

    /// Reflection finished
    NatResolved {
        /// Our classification
        nat_type: NatType,
        /// Our external primary address
        address: Option<SocketAddr>,
    },

    /// A subcluster message was delivered
    Message(SubclusterEvent),

    /// A socket failed in a way rebinding does not fix
    Error {
        /// Description
        message: String,
    },
}

/// Tells the node whether the host currently has network access.
///
/// While offline, publishes are queued and flushed by the first tick after
/// the network returns.
pub trait NetworkAvailability: Send + Sync {
    /// Returns true if the host is online
    fn is_online(&self) -> bool;
}

/// Availability that always reports online
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkAvailability for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Availability toggled by the embedding application
#[derive(Debug)]
pub struct ManualAvailability {
    online: AtomicBool,
}

impl ManualAvailability {
    /// Start in the given state
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Change the reported state
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl NetworkAvailability for ManualAvailability {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_availability() {
        let availability = ManualAvailability::new(false);
        assert!(!availability.is_online());
        availability.set_online(true);
        assert!(availability.is_online());
        assert!(AlwaysOnline.is_online());
    }
}
