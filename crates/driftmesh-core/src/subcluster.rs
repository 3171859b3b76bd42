//! Subclusters: encrypted topics inside a cluster.
//!
//! Everyone holding the same shared secret derives the same keys, and the
//! subcluster id is the derived public key. Publishes are sealed with the
//! sealing key and signed with the signing key, so relays that do not hold
//! the secret can still verify them but cannot read them.

use crate::MAX_MESSAGE_SIZE;
use crate::id::{ClusterId, PacketId, PeerId, SubclusterId};
use crate::messages::EventEnvelope;
use crate::node::{Node, NodeError, PublishOptions};
use crate::packet::{Packet, PacketBuilder, PacketKind, Tags, decode_body, encode_body};
use driftmesh_crypto::SubclusterKeys;
use driftmesh_crypto::hash::hash;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Inputs to [`pack`]
#[derive(Debug, Clone, Copy)]
pub struct PackParams<'a> {
    /// Publish or PublishProxied
    pub kind: PacketKind,
    /// Cluster namespace
    pub cluster_id: ClusterId,
    /// Event name
    pub event: &'a str,
    /// Event value
    pub value: &'a [u8],
    /// Time to live (milliseconds)
    pub ttl: u64,
    /// Lamport clock
    pub clock: u64,
    /// Creation time (milliseconds since the Unix epoch)
    pub timestamp: u64,
    /// Originating node
    pub sender: PeerId,
    /// Single recipient for a unicast; `None` gossips to the subcluster
    pub recipient: Option<PeerId>,
}

/// A message delivered from a subcluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubclusterEvent {
    /// Subcluster it arrived on
    pub subcluster_id: SubclusterId,
    /// Packet that carried it
    pub packet_id: PacketId,
    /// Event name
    pub name: String,
    /// Event value
    pub value: Vec<u8>,
    /// Originating node, when tagged
    pub from: Option<PeerId>,
}

fn associated_data(cluster_id: &ClusterId, subcluster_id: &SubclusterId) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(cluster_id.as_bytes());
    aad[32..].copy_from_slice(subcluster_id.as_bytes());
    aad
}

/// Seal and sign an event into a publish packet.
///
/// # Errors
///
/// Returns [`NodeError::Capacity`] if the value or the sealed envelope does
/// not fit in one packet.
pub fn pack(keys: &SubclusterKeys, params: PackParams<'_>) -> Result<Packet, NodeError> {
    if params.value.len() > MAX_MESSAGE_SIZE {
        return Err(NodeError::Capacity {
            size: params.value.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let subcluster_id = SubclusterId::from_bytes(keys.public_key());
    let envelope = encode_body(&EventEnvelope {
        name: params.event.to_string(),
        value: params.value.to_vec(),
    })?;
    let sealed = keys.seal(
        &envelope,
        &associated_data(&params.cluster_id, &subcluster_id),
    )?;
    if sealed.len() > MAX_MESSAGE_SIZE {
        return Err(NodeError::Capacity {
            size: sealed.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let tags = Tags {
        event: Some(hash(params.event.as_bytes())),
        sender_key: Some(*params.sender.as_bytes()),
        proxy_recipient: params.recipient,
        proxy_sender: params.recipient.map(|_| params.sender),
        rendezvous: None,
    };
    let mut packet = PacketBuilder::new(params.kind, params.cluster_id)
        .subcluster(subcluster_id)
        .clock(params.clock)
        .ttl(params.ttl)
        .timestamp(params.timestamp)
        .message(sealed)
        .tags(tags)
        .build()?;
    let signature = keys.sign(packet.packet_id().as_bytes());
    packet.set_signature(signature.to_vec());
    Ok(packet)
}

/// Verify and open a publish packet.
///
/// # Errors
///
/// Fails if the packet belongs to another subcluster, the signature does not
/// verify, the envelope does not decrypt, or its name does not match the
/// event tag.
pub fn unpack(keys: &SubclusterKeys, packet: &Packet) -> Result<EventEnvelope, NodeError> {
    let subcluster_id = SubclusterId::from_bytes(keys.public_key());
    if packet.subcluster_id() != subcluster_id {
        return Err(NodeError::validation("packet belongs to another subcluster"));
    }
    let signature = packet
        .signature()
        .ok_or_else(|| NodeError::Crypto("missing signature".to_string()))?;
    keys.verify(packet.packet_id().as_bytes(), signature)?;

    let plaintext = keys.open(
        packet.message(),
        &associated_data(&packet.cluster_id(), &subcluster_id),
    )?;
    let envelope: EventEnvelope = decode_body(&plaintext)?;

    if let Some(tag) = packet.tags().event {
        if tag != hash(envelope.name.as_bytes()) {
            return Err(NodeError::validation("event tag does not match envelope"));
        }
    }
    Ok(envelope)
}

/// Handle to a joined subcluster
#[derive(Clone)]
pub struct Subcluster {
    node: Node,
    keys: Arc<SubclusterKeys>,
    id: SubclusterId,
    events: broadcast::Sender<SubclusterEvent>,
}

impl Subcluster {
    pub(crate) fn new(
        node: Node,
        keys: Arc<SubclusterKeys>,
        id: SubclusterId,
        events: broadcast::Sender<SubclusterEvent>,
    ) -> Self {
        Self {
            node,
            keys,
            id,
            events,
        }
    }

    /// Subcluster id (the derived public key)
    #[must_use]
    pub fn id(&self) -> SubclusterId {
        self.id
    }

    /// Gossip an event to every member.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] for an oversized value.
    pub async fn publish(&self, event: &str, value: &[u8]) -> Result<PacketId, NodeError> {
        self.node
            .publish_with(&self.keys, event, value, PublishOptions::default())
            .await
    }

    /// Gossip an event with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] for an oversized value.
    pub async fn publish_with_options(
        &self,
        event: &str,
        value: &[u8],
        options: PublishOptions,
    ) -> Result<PacketId, NodeError> {
        self.node
            .publish_with(&self.keys, event, value, options)
            .await
    }

    /// Send an event to one member.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] or [`NodeError::PeerUnreachable`]
    /// when there is no path to the peer.
    pub async fn stream(
        &self,
        peer_id: PeerId,
        event: &str,
        value: &[u8],
    ) -> Result<PacketId, NodeError> {
        self.node
            .stream_with(&self.keys, peer_id, event, value, PublishOptions::default())
            .await
    }

    /// Send an event to every reachable member, or gossip it when no member
    /// is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] for an oversized value.
    pub async fn emit(&self, event: &str, value: &[u8]) -> Result<Vec<PacketId>, NodeError> {
        let members = self.members().await;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match self.stream(member, event, value).await {
                Ok(id) => ids.push(id),
                Err(e @ NodeError::Capacity { .. }) => return Err(e),
                Err(e) => tracing::debug!("Stream to {} failed: {}", member.short(), e),
            }
        }
        if ids.is_empty() {
            ids.push(self.publish(event, value).await?);
        }
        Ok(ids)
    }

    /// Seal and sign an event without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Capacity`] for an oversized value.
    pub fn pack(&self, event: &str, value: &[u8]) -> Result<Packet, NodeError> {
        pack(
            &self.keys,
            PackParams {
                kind: PacketKind::Publish,
                cluster_id: self.node.cluster_id(),
                event,
                value,
                ttl: Node::ms(self.node.config().gossip.default_ttl),
                clock: 0,
                timestamp: self.node.now_ms(),
                sender: self.node.peer_id(),
                recipient: None,
            },
        )
    }

    /// Verify and open a packet of this subcluster.
    ///
    /// # Errors
    ///
    /// See [`unpack`].
    pub fn unpack(&self, packet: &Packet) -> Result<EventEnvelope, NodeError> {
        unpack(&self.keys, packet)
    }

    /// Reachable members, sorted by id
    pub async fn members(&self) -> Vec<PeerId> {
        self.node.members(&self.id).await
    }

    /// Every delivered event
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SubclusterEvent> {
        self.events.subscribe()
    }

    /// Delivered events named `name`
    #[must_use]
    pub fn on(&self, name: &str) -> EventListener {
        EventListener {
            name: name.to_string(),
            receiver: self.events.subscribe(),
        }
    }

    /// Stop announcing and delivering this subcluster
    pub async fn leave(&self) {
        self.node.leave(&self.id).await;
    }
}

impl std::fmt::Debug for Subcluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subcluster").field("id", &self.id).finish()
    }
}

/// Receives the events of one name
#[derive(Debug)]
pub struct EventListener {
    name: String,
    receiver: broadcast::Receiver<SubclusterEvent>,
}

impl EventListener {
    /// Next matching event; `None` once the subcluster is gone
    pub async fn recv(&mut self) -> Option<SubclusterEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.name == self.name => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Listener for {} lagged by {}", self.name, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(event: &'a str, value: &'a [u8]) -> PackParams<'a> {
        PackParams {
            kind: PacketKind::Publish,
            cluster_id: ClusterId::from_name("subcluster-tests"),
            event,
            value,
            ttl: 60_000,
            clock: 1,
            timestamp: 1_000,
            sender: PeerId::from_bytes([4; 32]),
            recipient: None,
        }
    }

    #[test]
    fn test_pack_then_unpack() {
        let keys = SubclusterKeys::derive(b"secret");
        let packet = pack(&keys, params("greeting", b"hello")).unwrap();

        assert_eq!(packet.subcluster_id().as_bytes(), &keys.public_key());
        assert!(packet.has_valid_signature());
        assert_eq!(packet.tags().sender_key, Some([4; 32]));
        assert!(packet.tags().proxy_recipient.is_none());

        let envelope = unpack(&keys, &packet).unwrap();
        assert_eq!(envelope.name, "greeting");
        assert_eq!(envelope.value, b"hello");
    }

    #[test]
    fn test_message_is_sealed() {
        let keys = SubclusterKeys::derive(b"secret");
        let packet = pack(&keys, params("greeting", b"plaintext marker")).unwrap();
        let message = packet.message();
        assert!(!message
            .windows(b"plaintext marker".len())
            .any(|w| w == b"plaintext marker"));
    }

    #[test]
    fn test_wrong_secret_cannot_unpack() {
        let keys = SubclusterKeys::derive(b"secret");
        let other = SubclusterKeys::derive(b"another secret");
        let packet = pack(&keys, params("greeting", b"hello")).unwrap();
        assert!(matches!(
            unpack(&other, &packet),
            Err(NodeError::Validation(_))
        ));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let keys = SubclusterKeys::derive(b"secret");
        let value = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            pack(&keys, params("big", &value)),
            Err(NodeError::Capacity { .. })
        ));

        // Fits the raw bound but not once sealed
        let value = vec![0u8; MAX_MESSAGE_SIZE - 8];
        assert!(matches!(
            pack(&keys, params("big", &value)),
            Err(NodeError::Capacity { .. })
        ));
    }

    #[test]
    fn test_unicast_tags() {
        let keys = SubclusterKeys::derive(b"secret");
        let recipient = PeerId::from_bytes([9; 32]);
        let mut p = params("direct", b"x");
        p.kind = PacketKind::PublishProxied;
        p.recipient = Some(recipient);
        let packet = pack(&keys, p).unwrap();

        assert_eq!(packet.kind(), PacketKind::PublishProxied);
        assert_eq!(packet.tags().proxy_recipient, Some(recipient));
        assert_eq!(packet.tags().proxy_sender, Some(PeerId::from_bytes([4; 32])));
    }

    #[tokio::test]
    async fn test_listener_filters_by_name() {
        let (tx, _) = broadcast::channel(8);
        let mut listener = EventListener {
            name: "wanted".to_string(),
            receiver: tx.subscribe(),
        };
        let event = |name: &str| SubclusterEvent {
            subcluster_id: SubclusterId::from_bytes([1; 32]),
            packet_id: PacketId::from_bytes([2; 32]),
            name: name.to_string(),
            value: Vec::new(),
            from: None,
        };
        tx.send(event("other")).unwrap();
        tx.send(event("wanted")).unwrap();
        drop(tx);

        assert_eq!(listener.recv().await.unwrap().name, "wanted");
        assert!(listener.recv().await.is_none());
    }
}
