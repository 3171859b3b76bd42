//! Subcluster membership and publishing.

use crate::MAX_MESSAGE_SIZE;
use crate::id::{PacketId, PeerId, SubclusterId};
use crate::messages::JoinMessage;
use crate::node::error::{NodeError, Result};
use crate::node::node::Node;
use crate::node::sockets::LocalSocket;
use crate::node::state::{JoinOptions, JoinedSubcluster, NodeState, SUBCLUSTER_CHANNEL_CAPACITY};
use crate::packet::PacketKind;
use crate::peer::WriteParams;
use crate::subcluster::{PackParams, Subcluster, pack};
use driftmesh_crypto::SubclusterKeys;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Options for one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Time to live; the gossip default when `None`
    pub ttl: Option<Duration>,
}

fn check_capacity(value: &[u8]) -> Result<()> {
    if value.len() > MAX_MESSAGE_SIZE {
        return Err(NodeError::Capacity {
            size: value.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

impl Node {
    /// Join the subcluster derived from `shared_secret`.
    ///
    /// Joining again reactivates the subcluster and replaces its options.
    /// The join is announced right away when the node is running and online,
    /// and again on every tick.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] after [`Node::close`].
    pub async fn join(&self, shared_secret: &[u8], options: JoinOptions) -> Result<Subcluster> {
        if self.is_closing() {
            return Err(NodeError::invalid_state("Node is closed"));
        }
        let keys = Arc::new(SubclusterKeys::derive(shared_secret));
        let id = SubclusterId::from_bytes(keys.public_key());

        let mut st = self.inner.state.lock().await;
        let events = match st.subclusters.get_mut(&id) {
            Some(joined) => {
                joined.active = true;
                joined.options = options;
                joined.events.clone()
            }
            None => {
                let (events, _) = broadcast::channel(SUBCLUSTER_CHANNEL_CAPACITY);
                st.subclusters.insert(
                    id,
                    JoinedSubcluster {
                        keys: Arc::clone(&keys),
                        events: events.clone(),
                        options,
                        active: true,
                    },
                );
                events
            }
        };
        tracing::info!("Joined subcluster {}", id.short());

        if st.sockets.is_some() && self.inner.availability.is_online() {
            self.send_join(&mut st, id).await;
        }
        Ok(Subcluster::new(self.clone(), keys, id, events))
    }

    /// Stop announcing and delivering a subcluster
    pub async fn leave(&self, subcluster_id: &SubclusterId) {
        let mut st = self.inner.state.lock().await;
        if let Some(joined) = st.subclusters.get_mut(subcluster_id) {
            joined.active = false;
            tracing::info!("Left subcluster {}", subcluster_id.short());
        }
    }

    /// Publish an event to the subcluster derived from `shared_secret`.
    ///
    /// The node does not need to have joined it.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] if the value does not fit in one
    /// packet. Nothing is sent in that case.
    pub async fn publish(
        &self,
        shared_secret: &[u8],
        event: &str,
        value: &[u8],
        options: PublishOptions,
    ) -> Result<PacketId> {
        let keys = SubclusterKeys::derive(shared_secret);
        self.publish_with(&keys, event, value, options).await
    }

    pub(crate) async fn publish_with(
        &self,
        keys: &SubclusterKeys,
        event: &str,
        value: &[u8],
        options: PublishOptions,
    ) -> Result<PacketId> {
        check_capacity(value)?;
        let ttl = Self::ms(options.ttl.unwrap_or(self.inner.config.gossip.default_ttl));

        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return Err(NodeError::invalid_state("Node is closed"));
        }

        let now = self.now_ms();
        let packet = pack(
            keys,
            PackParams {
                kind: PacketKind::Publish,
                cluster_id: self.cluster_id(),
                event,
                value,
                ttl,
                clock: st.next_clock(),
                timestamp: now,
                sender: self.peer_id(),
                recipient: None,
            },
        )?;
        let id = packet.packet_id();
        st.gate.mark(id, self.inner.config.gossip.dedup_credit);
        st.cache.insert(packet.clone(), now);

        if st.sockets.is_none() || !self.inner.availability.is_online() {
            tracing::debug!("Queued {} until the node is online", id.short());
            st.unpublished.insert(id);
            return Ok(id);
        }

        let sent = self.mcast_packet(&mut st, packet, &[]).await;
        if sent == 0 {
            tracing::debug!("No peers for {}, queued", id.short());
            st.unpublished.insert(id);
        }
        Ok(id)
    }

    /// Send an event to one peer, directly or through a proxy.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] for an oversized value,
    /// [`NodeError::PeerNotFound`] for an unknown peer and
    /// [`NodeError::PeerUnreachable`] when neither a direct path nor a
    /// reachable proxy exists.
    pub(crate) async fn stream_with(
        &self,
        keys: &SubclusterKeys,
        peer_id: PeerId,
        event: &str,
        value: &[u8],
        options: PublishOptions,
    ) -> Result<PacketId> {
        check_capacity(value)?;
        let ttl = Self::ms(options.ttl.unwrap_or(self.inner.config.gossip.default_ttl));

        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return Err(NodeError::invalid_state("Node is closed"));
        }
        if !st.peers.contains_key(&peer_id) {
            return Err(NodeError::PeerNotFound(peer_id));
        }
        let route = st
            .route_to(&peer_id)
            .ok_or(NodeError::PeerUnreachable(peer_id))?;
        let transport = st
            .sockets
            .as_ref()
            .and_then(|s| {
                s.get(route.socket())
                    .or_else(|| s.get(LocalSocket::Primary))
            })
            .ok_or(NodeError::invalid_state("Node is not running"))?;

        let params = WriteParams {
            cluster_id: self.cluster_id(),
            sender: self.peer_id(),
            clock: st.next_clock(),
            now: self.now_ms(),
            ttl,
            event,
            value,
        };
        let peer = st
            .peers
            .get(&peer_id)
            .ok_or(NodeError::PeerNotFound(peer_id))?;
        let id = peer.write(keys, params, route, transport.as_ref()).await?;
        st.gate.mark(id, self.inner.config.gossip.dedup_credit);
        Ok(id)
    }

    /// Announce membership of `subcluster` to the mesh
    pub(crate) async fn send_join(&self, st: &mut NodeState, subcluster: SubclusterId) -> usize {
        let join = JoinMessage {
            requester: self.descriptor(st),
            rendezvous_target: None,
            timestamp: self.now_ms(),
        };
        let packet = match self.control_packet(st, PacketKind::Join, subcluster, &join) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Failed to build join: {}", e);
                return 0;
            }
        };
        st.gate
            .mark(packet.packet_id(), self.inner.config.gossip.dedup_credit);
        let sent = self.mcast_packet(st, packet, &[]).await;
        tracing::trace!("Announced {} to {} peers", subcluster.short(), sent);
        sent
    }

    /// Members of `subcluster` we can currently reach, sorted by id
    pub async fn members(&self, subcluster_id: &SubclusterId) -> Vec<PeerId> {
        let st = self.inner.state.lock().await;
        let cluster = self.cluster_id();
        let mut members: Vec<PeerId> = st
            .peers
            .values()
            .filter(|p| p.is_member(&cluster, subcluster_id))
            .filter(|p| st.route_to(&p.peer_id).is_some())
            .map(|p| p.peer_id)
            .collect();
        members.sort_unstable();
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bound() {
        assert!(check_capacity(&[0u8; MAX_MESSAGE_SIZE]).is_ok());
        assert!(matches!(
            check_capacity(&[0u8; MAX_MESSAGE_SIZE + 1]),
            Err(NodeError::Capacity { size, max }) if size == MAX_MESSAGE_SIZE + 1 && max == MAX_MESSAGE_SIZE
        ));
    }

    #[test]
    fn test_default_options() {
        assert_eq!(PublishOptions::default().ttl, None);
    }
}
