//! Control message bodies.
//!
//! Ping, Pong, Intro and Join packets carry one of these structures in their
//! message field, encoded with the same bincode options as the packet body.
//! Publish packets carry a sealed [`EventEnvelope`] instead.

use crate::cache::CacheSummary;
use crate::id::{PeerId, SubclusterId};
use crate::nat::NatType;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// What a peer says about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Peer id
    pub peer_id: PeerId,
    /// Reflected external address, once known
    pub address: Option<SocketAddr>,
    /// Self-classified NAT type
    pub nat_type: NatType,
    /// Well-known, always reachable peer
    pub indexed: bool,
}

/// Reflection stage a ping belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReflectionStep {
    /// Sent from the probe socket to learn its external port
    Probe,
    /// Sent from the primary socket to learn the mapping and firewall
    Classify,
}

/// Reflection fields of a ping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionRequest {
    /// Round id echoed back in the pong
    pub round: u64,
    /// Stage of the round
    pub step: ReflectionStep,
    /// External port of the requester's probe socket
    pub probe_external_port: Option<u16>,
    /// Send the unsolicited probe reply from the helper's probe socket
    pub reply_from_probe: bool,
}

/// Ping body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    /// Correlates the pong
    pub request_id: u64,
    /// Sender
    pub requester: PeerDescriptor,
    /// Subclusters the sender is a member of
    pub subclusters: Vec<SubclusterId>,
    /// First contact after an introduction
    pub is_connection: bool,
    /// Periodic keepalive
    pub is_heartbeat: bool,
    /// Present on reflection pings
    pub reflection: Option<ReflectionRequest>,
    /// Sender's cache contents for this cluster
    pub cache_summary: Option<CacheSummary>,
}

/// Pong body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMessage {
    /// Echo of the ping's request id
    pub request_id: u64,
    /// Sender
    pub responder: PeerDescriptor,
    /// Source address the ping arrived from
    pub observed: SocketAddr,
    /// Subclusters the sender is a member of
    pub subclusters: Vec<SubclusterId>,
    /// Reply to a connection ping
    pub is_connection: bool,
    /// Reflection round this answers
    pub reflection_round: Option<u64>,
    /// Unsolicited reply sent to the requester's probe socket
    pub is_probe_reply: bool,
    /// Sender's cache contents for this cluster
    pub cache_summary: Option<CacheSummary>,
}

/// Intro body: the connector telling one peer about another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroMessage {
    /// The peer being introduced
    pub peer: PeerDescriptor,
    /// Who made the introduction
    pub connector: PeerId,
    /// When the introduction was made
    pub timestamp: u64,
}

/// Rendezvous metadata attached by an unrestricted relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendezvous {
    /// The relay
    pub peer_id: PeerId,
    /// Where to reach the relay
    pub address: SocketAddr,
    /// Milliseconds since the Unix epoch after which the offer lapses
    pub deadline: u64,
}

/// Join body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMessage {
    /// The joining peer
    pub requester: PeerDescriptor,
    /// Set when asking a rendezvous relay for an introduction
    pub rendezvous_target: Option<PeerId>,
    /// When the join was issued
    pub timestamp: u64,
}

/// Plaintext of a sealed publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event name
    pub name: String,
    /// Event value
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode_body, encode_body};
    use crate::MAX_MESSAGE_SIZE;

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor {
            peer_id: PeerId::from_bytes([9; 32]),
            address: Some("203.0.113.5:3456".parse().unwrap()),
            nat_type: NatType::PORT_RESTRICTED,
            indexed: false,
        }
    }

    #[test]
    fn test_full_ping_fits_one_packet() {
        let ping = PingMessage {
            request_id: u64::MAX,
            requester: descriptor(),
            subclusters: vec![SubclusterId::from_bytes([1; 32]); crate::MAX_ADVERTISED_SUBCLUSTERS],
            is_connection: true,
            is_heartbeat: true,
            reflection: Some(ReflectionRequest {
                round: 1,
                step: ReflectionStep::Classify,
                probe_external_port: Some(40001),
                reply_from_probe: true,
            }),
            cache_summary: Some(CacheSummary::default()),
        };
        let encoded = encode_body(&ping).unwrap();
        assert!(encoded.len() <= MAX_MESSAGE_SIZE);
        assert_eq!(decode_body::<PingMessage>(&encoded).unwrap(), ping);
    }

    #[test]
    fn test_rendezvous_request() {
        let join = JoinMessage {
            requester: descriptor(),
            rendezvous_target: Some(PeerId::from_bytes([4; 32])),
            timestamp: 7,
        };
        let decoded: JoinMessage = decode_body(&encode_body(&join).unwrap()).unwrap();
        assert_eq!(decoded, join);
    }

    #[test]
    fn test_wrong_body_rejected() {
        let intro = IntroMessage {
            peer: descriptor(),
            connector: PeerId::from_bytes([2; 32]),
            timestamp: 1,
        };
        let encoded = encode_body(&intro).unwrap();
        assert!(decode_body::<PongMessage>(&encoded).is_err());
    }
}
