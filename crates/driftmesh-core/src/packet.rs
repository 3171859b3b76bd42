//! Packet encoding and decoding for the driftmesh wire protocol.
//!
//! Layout of one datagram:
//!
//! ```text
//! +---------+------+--------------------------------------+
//! | version | kind | body (bincode, fixed-width integers) |
//! |   1 B   | 1 B  |                                      |
//! +---------+------+--------------------------------------+
//! ```
//!
//! The body carries the shared header (cluster, subcluster, ids, clock,
//! hops, ttl, timestamp), the message bytes and the relay tags. Every packet
//! fits in a single datagram; there is no fragmentation.

use crate::error::PacketError;
use crate::id::{ClusterId, PacketId, PeerId, SubclusterId};
use crate::messages::Rendezvous;
use crate::{MAX_MESSAGE_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PROTOCOL_VERSION};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Packet kinds as they appear in byte 1 of every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    /// Liveness and reflection request
    Ping = 0x01,
    /// Response to a ping
    Pong = 0x02,
    /// Connector introducing two peers
    Intro = 0x03,
    /// Subcluster membership announcement
    Join = 0x04,
    /// Sealed subcluster message
    Publish = 0x05,
    /// Sealed message handed to a proxy for its recipient
    PublishProxied = 0x06,
}

impl PacketKind {
    /// Kinds that are replicated across the network and rate limited from
    /// the smaller replicable budget
    #[must_use]
    pub const fn is_replicable(self) -> bool {
        matches!(
            self,
            PacketKind::Join | PacketKind::Publish | PacketKind::PublishProxied
        )
    }

    /// Kinds whose message is a sealed subcluster payload
    #[must_use]
    pub const fn is_publish(self) -> bool {
        matches!(self, PacketKind::Publish | PacketKind::PublishProxied)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::Intro),
            0x04 => Ok(Self::Join),
            0x05 => Ok(Self::Publish),
            0x06 => Ok(Self::PublishProxied),
            _ => Err(PacketError::UnknownKind(value)),
        }
    }
}

/// Relay tags carried alongside the message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    /// BLAKE3 hash of the event name
    pub event: Option<[u8; 32]>,
    /// Public key of the originating node
    pub sender_key: Option<[u8; 32]>,
    /// Final recipient of a unicast or proxied publish
    pub proxy_recipient: Option<PeerId>,
    /// Originator of a unicast or proxied publish
    pub proxy_sender: Option<PeerId>,
    /// Relay offering to introduce members to a joining peer. Attached in
    /// flight, so it is not covered by the packet id.
    pub rendezvous: Option<Rendezvous>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Body {
    cluster_id: ClusterId,
    subcluster_id: SubclusterId,
    packet_id: PacketId,
    previous_id: Option<PacketId>,
    next_id: Option<PacketId>,
    clock: u64,
    hops: u8,
    ttl: u64,
    timestamp: u64,
    message: Vec<u8>,
    tags: Tags,
    signature: Option<Vec<u8>>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PACKET_SIZE as u64)
        .reject_trailing_bytes()
}

/// Serialize a control body with the wire options.
///
/// # Errors
///
/// Returns [`PacketError::Malformed`] if serialization fails.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, PacketError> {
    Ok(wire_options().serialize(value)?)
}

/// Deserialize a control body with the wire options.
///
/// # Errors
///
/// Returns [`PacketError::Malformed`] for truncated or trailing bytes.
pub fn decode_body<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, PacketError> {
    Ok(wire_options().deserialize(bytes)?)
}

/// A decoded driftmesh packet.
///
/// Everything except the hop count and the relay-time fields is fixed once
/// the packet is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    version: u8,
    kind: PacketKind,
    body: Body,
}

impl Packet {
    /// Decode a packet from a datagram.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer, an unsupported version, an unknown kind, a
    /// malformed body, an oversized message, or a publish whose id does not
    /// match its content.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(data[0]));
        }
        let kind = PacketKind::try_from(data[1])?;
        let body: Body = wire_options().deserialize(&data[PACKET_HEADER_SIZE..])?;

        if body.message.len() > MAX_MESSAGE_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: body.message.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        // Publish messages are never rewritten in flight, so their id must
        // still be the content address.
        if kind.is_publish() && body.packet_id != PacketId::of(&body.message) {
            return Err(PacketError::Malformed("packet id mismatch".into()));
        }

        Ok(Self {
            version: data[0],
            kind,
            body,
        })
    }

    /// Decode, discarding the reason on failure
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        Self::decode(data).ok()
    }

    /// Encode into a single datagram.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PayloadTooLarge`] if the result would not fit
    /// in one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + 256 + self.body.message.len());
        out.push(self.version);
        out.push(self.kind as u8);
        wire_options()
            .serialize_into(&mut out, &self.body)
            .map_err(|_| PacketError::PayloadTooLarge {
                size: self.body.message.len(),
                max: MAX_MESSAGE_SIZE,
            })?;
        Ok(out)
    }

    /// Protocol version
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Packet kind
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Cluster namespace
    #[must_use]
    pub fn cluster_id(&self) -> ClusterId {
        self.body.cluster_id
    }

    /// Subcluster (topic) id
    #[must_use]
    pub fn subcluster_id(&self) -> SubclusterId {
        self.body.subcluster_id
    }

    /// Content address of the message
    #[must_use]
    pub fn packet_id(&self) -> PacketId {
        self.body.packet_id
    }

    /// Previous packet in a chain (unused by single-packet messages)
    #[must_use]
    pub fn previous_id(&self) -> Option<PacketId> {
        self.body.previous_id
    }

    /// Next packet in a chain (unused by single-packet messages)
    #[must_use]
    pub fn next_id(&self) -> Option<PacketId> {
        self.body.next_id
    }

    /// Lamport clock of the sender
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.body.clock
    }

    /// Relay hop count
    #[must_use]
    pub fn hops(&self) -> u8 {
        self.body.hops
    }

    /// Requested time to live in milliseconds
    #[must_use]
    pub fn ttl(&self) -> u64 {
        self.body.ttl
    }

    /// Creation time in milliseconds since the Unix epoch
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.body.timestamp
    }

    /// Message bytes
    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.body.message
    }

    /// Relay tags
    #[must_use]
    pub fn tags(&self) -> &Tags {
        &self.body.tags
    }

    /// Subcluster signature over the packet id
    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        self.body.signature.as_deref()
    }

    /// Check the subcluster signature.
    ///
    /// Anyone can do this: the subcluster id is the verifying key.
    #[must_use]
    pub fn has_valid_signature(&self) -> bool {
        self.signature().is_some_and(|sig| {
            driftmesh_crypto::identity::verify(
                self.body.subcluster_id.as_bytes(),
                self.body.packet_id.as_bytes(),
                sig,
            )
            .is_ok()
        })
    }

    pub(crate) fn increment_hops(&mut self) {
        self.body.hops = self.body.hops.saturating_add(1);
    }

    pub(crate) fn set_kind(&mut self, kind: PacketKind) {
        self.kind = kind;
    }

    pub(crate) fn set_signature(&mut self, signature: Vec<u8>) {
        self.body.signature = Some(signature);
    }

    pub(crate) fn set_rendezvous(&mut self, rendezvous: Rendezvous) {
        self.body.tags.rendezvous = Some(rendezvous);
    }
}

/// Builder for packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    kind: PacketKind,
    cluster_id: ClusterId,
    subcluster_id: SubclusterId,
    clock: u64,
    hops: u8,
    ttl: u64,
    timestamp: u64,
    message: Vec<u8>,
    tags: Tags,
}

impl PacketBuilder {
    /// Start a packet of `kind` inside `cluster_id`
    #[must_use]
    pub fn new(kind: PacketKind, cluster_id: ClusterId) -> Self {
        Self {
            kind,
            cluster_id,
            subcluster_id: SubclusterId::from_bytes([0u8; 32]),
            clock: 0,
            hops: 0,
            ttl: 0,
            timestamp: 0,
            message: Vec::new(),
            tags: Tags::default(),
        }
    }

    /// Set the subcluster
    #[must_use]
    pub fn subcluster(mut self, id: SubclusterId) -> Self {
        self.subcluster_id = id;
        self
    }

    /// Set the Lamport clock
    #[must_use]
    pub fn clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }

    /// Set the hop count
    #[must_use]
    pub fn hops(mut self, hops: u8) -> Self {
        self.hops = hops;
        self
    }

    /// Set the time to live (milliseconds)
    #[must_use]
    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the creation timestamp (milliseconds since the Unix epoch)
    #[must_use]
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the message bytes
    #[must_use]
    pub fn message(mut self, message: Vec<u8>) -> Self {
        self.message = message;
        self
    }

    /// Set the relay tags
    #[must_use]
    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Build the packet, deriving its id from the message.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PayloadTooLarge`] if the message exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub fn build(self) -> Result<Packet, PacketError> {
        if self.message.len() > MAX_MESSAGE_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: self.message.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(Packet {
            version: PROTOCOL_VERSION,
            kind: self.kind,
            body: Body {
                cluster_id: self.cluster_id,
                subcluster_id: self.subcluster_id,
                packet_id: PacketId::of(&self.message),
                previous_id: None,
                next_id: None,
                clock: self.clock,
                hops: self.hops,
                ttl: self.ttl,
                timestamp: self.timestamp,
                message: self.message,
                tags: self.tags,
                signature: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterId {
        ClusterId::from_name("test")
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = PacketBuilder::new(PacketKind::Join, cluster())
            .subcluster(SubclusterId::from_bytes([7; 32]))
            .clock(42)
            .hops(3)
            .ttl(60_000)
            .timestamp(1_700_000_000_000)
            .message(b"hello driftmesh".to_vec())
            .tags(Tags {
                event: Some([1; 32]),
                ..Tags::default()
            })
            .build()
            .unwrap();

        let encoded = packet.encode().unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], PacketKind::Join as u8);

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.clock(), 42);
        assert_eq!(decoded.hops(), 3);
        assert_eq!(decoded.message(), b"hello driftmesh");
        assert_eq!(decoded.packet_id(), PacketId::of(b"hello driftmesh"));
        assert!(decoded.previous_id().is_none());
        assert!(decoded.next_id().is_none());
    }

    #[test]
    fn test_kind_tags() {
        for tag in 1u8..=6 {
            let kind = PacketKind::try_from(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(PacketKind::try_from(0), Err(PacketError::UnknownKind(0)));
        assert_eq!(PacketKind::try_from(7), Err(PacketError::UnknownKind(7)));
    }

    #[test]
    fn test_replicable_kinds() {
        assert!(!PacketKind::Ping.is_replicable());
        assert!(!PacketKind::Pong.is_replicable());
        assert!(!PacketKind::Intro.is_replicable());
        assert!(PacketKind::Join.is_replicable());
        assert!(PacketKind::Publish.is_replicable());
        assert!(PacketKind::PublishProxied.is_replicable());
    }

    #[test]
    fn test_oversize_message_rejected() {
        let result = PacketBuilder::new(PacketKind::Publish, cluster())
            .message(vec![0u8; MAX_MESSAGE_SIZE + 1])
            .build();
        assert_eq!(
            result.unwrap_err(),
            PacketError::PayloadTooLarge {
                size: MAX_MESSAGE_SIZE + 1,
                max: MAX_MESSAGE_SIZE
            }
        );

        let max = PacketBuilder::new(PacketKind::Publish, cluster())
            .message(vec![0u8; MAX_MESSAGE_SIZE])
            .build()
            .unwrap();
        assert!(max.encode().unwrap().len() <= MAX_PACKET_SIZE);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Packet::decode(&[1]), Err(PacketError::TooShort(1)));
        assert_eq!(
            Packet::decode(&[9, 1, 0, 0]),
            Err(PacketError::UnsupportedVersion(9))
        );
        assert_eq!(
            Packet::decode(&[PROTOCOL_VERSION, 0xEE]),
            Err(PacketError::UnknownKind(0xEE))
        );
        assert!(matches!(
            Packet::decode(&[PROTOCOL_VERSION, 1, 0, 1, 2]),
            Err(PacketError::Malformed(_))
        ));
        assert!(Packet::parse(&[]).is_none());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let packet = PacketBuilder::new(PacketKind::Ping, cluster())
            .message(vec![1, 2, 3])
            .build()
            .unwrap();
        let mut encoded = packet.encode().unwrap();
        encoded.push(0);
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn test_publish_id_mismatch_rejected() {
        let mut packet = PacketBuilder::new(PacketKind::Publish, cluster())
            .message(b"original".to_vec())
            .build()
            .unwrap();
        packet.body.message = b"tampered".to_vec();
        let encoded = packet.encode().unwrap();
        assert!(matches!(
            Packet::decode(&encoded),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn test_signature_checks_against_subcluster() {
        let keys = driftmesh_crypto::SubclusterKeys::derive(b"secret");
        let mut packet = PacketBuilder::new(PacketKind::Publish, cluster())
            .subcluster(SubclusterId::from_bytes(keys.public_key()))
            .message(b"sealed".to_vec())
            .build()
            .unwrap();
        assert!(!packet.has_valid_signature());

        packet.set_signature(keys.sign(packet.packet_id().as_bytes()).to_vec());
        assert!(packet.has_valid_signature());

        let other = driftmesh_crypto::SubclusterKeys::derive(b"other");
        packet.set_signature(other.sign(packet.packet_id().as_bytes()).to_vec());
        assert!(!packet.has_valid_signature());
    }

    #[test]
    fn test_hops_saturate() {
        let mut packet = PacketBuilder::new(PacketKind::Join, cluster())
            .hops(u8::MAX)
            .build()
            .unwrap();
        packet.increment_hops();
        assert_eq!(packet.hops(), u8::MAX);
    }
}
