//! NAT classification and connection strategy selection.
//!
//! A node's reachability is a [`NatType`] bitfield combining one firewall
//! bit (which inbound sources are admitted) with one mapping bit (whether the
//! external port depends on the destination). The pair of local and remote
//! types picks the [`Strategy`] used to connect.
//!
//! Reflection (discovering our own type) is a small state machine,
//! [`Reflection`], driven by the node:
//!
//! ```text
//!   Unknown --start--> Stage1 --probe pong--> Stage2 --both pongs--> Resolving
//!      ^                 |                      |                       |
//!      +----timeout------+-----timeout----------+          probe window |
//!                                                                       v
//!                                                                   Resolved
//! ```

use crate::id::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::Duration;

/// NAT type bitfield
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatType(u8);

impl NatType {
    /// Not yet resolved
    pub const UNKNOWN: Self = Self(0);
    /// Firewall admits any source
    pub const ALLOW_ANY: Self = Self(0x01);
    /// Firewall admits sources whose IP we contacted
    pub const ALLOW_KNOWN_IP: Self = Self(0x02);
    /// Firewall admits only the exact IP and port we contacted
    pub const ALLOW_KNOWN_IP_AND_PORT: Self = Self(0x04);
    /// External port is the same for every destination
    pub const ENDPOINT_INDEPENDENT: Self = Self(0x08);
    /// External port varies per destination
    pub const ENDPOINT_DEPENDENT: Self = Self(0x10);

    /// No NAT or full cone
    pub const UNRESTRICTED: Self = Self(0x01 | 0x08);
    /// Address restricted cone
    pub const ADDR_RESTRICTED: Self = Self(0x02 | 0x08);
    /// Port restricted cone
    pub const PORT_RESTRICTED: Self = Self(0x04 | 0x08);
    /// Symmetric
    pub const ENDPOINT_RESTRICTED: Self = Self(0x04 | 0x10);

    const FIREWALL_MASK: u8 = 0x07;
    const MAPPING_MASK: u8 = 0x18;

    /// Wrap raw bits, rejecting bits outside the known set
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !(Self::FIREWALL_MASK | Self::MAPPING_MASK) != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combine a firewall and a mapping classification
    #[must_use]
    pub const fn from_parts(firewall: Firewall, mapping: Mapping) -> Self {
        let f = match firewall {
            Firewall::AllowAny => Self::ALLOW_ANY.0,
            Firewall::AllowKnownIp => Self::ALLOW_KNOWN_IP.0,
            Firewall::AllowKnownIpAndPort => Self::ALLOW_KNOWN_IP_AND_PORT.0,
        };
        let m = match mapping {
            Mapping::EndpointIndependent => Self::ENDPOINT_INDEPENDENT.0,
            Mapping::EndpointDependent => Self::ENDPOINT_DEPENDENT.0,
        };
        Self(f | m)
    }

    /// Firewall classification, if exactly one firewall bit is set
    #[must_use]
    pub fn firewall(self) -> Option<Firewall> {
        match self.0 & Self::FIREWALL_MASK {
            0x01 => Some(Firewall::AllowAny),
            0x02 => Some(Firewall::AllowKnownIp),
            0x04 => Some(Firewall::AllowKnownIpAndPort),
            _ => None,
        }
    }

    /// Mapping classification, if exactly one mapping bit is set
    #[must_use]
    pub fn mapping(self) -> Option<Mapping> {
        match self.0 & Self::MAPPING_MASK {
            0x08 => Some(Mapping::EndpointIndependent),
            0x10 => Some(Mapping::EndpointDependent),
            _ => None,
        }
    }

    /// Both halves are known
    #[must_use]
    pub fn is_resolved(self) -> bool {
        self.firewall().is_some() && self.mapping().is_some()
    }

    /// Reachable by anyone without coordination
    #[must_use]
    pub fn is_unrestricted(self) -> bool {
        self == Self::UNRESTRICTED
    }

    fn class(self) -> Option<NatClass> {
        match (self.firewall()?, self.mapping()?) {
            (_, Mapping::EndpointDependent) => Some(NatClass::EndpointDependent),
            (Firewall::AllowAny, _) => Some(NatClass::Unrestricted),
            (Firewall::AllowKnownIp, _) => Some(NatClass::AddrRestricted),
            (Firewall::AllowKnownIpAndPort, _) => Some(NatClass::PortRestricted),
        }
    }
}

impl BitOr for NatType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NatType({self})")
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            Some(NatClass::Unrestricted) => write!(f, "Unrestricted"),
            Some(NatClass::AddrRestricted) => write!(f, "Address Restricted"),
            Some(NatClass::PortRestricted) => write!(f, "Port Restricted"),
            Some(NatClass::EndpointDependent) => write!(f, "Endpoint Dependent"),
            None if self.0 == 0 => write!(f, "Unknown"),
            None => write!(f, "Partial(0x{:02X})", self.0),
        }
    }
}

/// Which inbound sources the firewall admits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Firewall {
    /// Any source
    AllowAny,
    /// Sources whose IP was contacted
    AllowKnownIp,
    /// Only the exact IP and port contacted
    AllowKnownIpAndPort,
}

/// How the external port is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mapping {
    /// Same external port for every destination
    EndpointIndependent,
    /// New external port per destination
    EndpointDependent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NatClass {
    Unrestricted,
    AddrRestricted,
    PortRestricted,
    EndpointDependent,
}

/// How to connect to a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Send straight to the known address
    DirectConnect,
    /// Both sides ping each other simultaneously
    TraversalConnect,
    /// Port prediction against a dependent mapping
    TraversalOpen,
    /// Relay through the connector
    Proxy,
    /// A side is unresolved; retry later
    Defer,
}

/// Pick a connection strategy for a local and remote NAT type.
///
/// Total over all inputs: anything unresolved defers.
///
/// ```text
/// local \ remote   U       A          P          E
///   U            Direct  Traversal  Traversal  Traversal
///   A            Direct  Traversal  Traversal  Traversal
///   P            Direct  Traversal  Traversal  Open
///   E            Direct  Traversal  Open       Proxy
/// ```
#[must_use]
pub fn strategy(local: NatType, remote: NatType) -> Strategy {
    use NatClass::{AddrRestricted, EndpointDependent, PortRestricted, Unrestricted};

    let (Some(local), Some(remote)) = (local.class(), remote.class()) else {
        return Strategy::Defer;
    };
    match (local, remote) {
        (_, Unrestricted) => Strategy::DirectConnect,
        (EndpointDependent, EndpointDependent) => Strategy::Proxy,
        (PortRestricted, EndpointDependent) | (EndpointDependent, PortRestricted) => {
            Strategy::TraversalOpen
        }
        (_, AddrRestricted | PortRestricted | EndpointDependent) => Strategy::TraversalConnect,
    }
}

/// Classify from reflection observations.
///
/// `same_port` is whether two helpers saw the same external port;
/// `probe_replies` is how many unsolicited probe replies got through.
#[must_use]
pub fn classify(same_port: bool, probe_replies: usize) -> NatType {
    let mapping = if same_port {
        Mapping::EndpointIndependent
    } else {
        Mapping::EndpointDependent
    };
    let firewall = match probe_replies {
        0 => Firewall::AllowKnownIpAndPort,
        1 => Firewall::AllowKnownIp,
        _ => Firewall::AllowAny,
    };
    NatType::from_parts(firewall, mapping)
}

/// Cap on the reflection retry counter
pub const MAX_REFLECTION_RETRIES: u8 = 16;

/// Base unit of the reflection retry delay
pub const REFLECTION_RETRY_UNIT: Duration = Duration::from_millis(256);

/// Reflection progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionStage {
    /// Nothing in flight
    Unknown,
    /// Waiting for the probe-socket pong from the first helper
    Stage1,
    /// Waiting for primary-socket pongs from both helpers
    Stage2,
    /// Both pongs in; counting probe replies
    Resolving,
    /// Classification finished
    Resolved,
}

/// Reflection state machine.
///
/// Only the round whose id matches is advanced; late responses from an
/// abandoned round are ignored.
#[derive(Debug, Clone)]
pub struct Reflection {
    stage: ReflectionStage,
    round: u64,
    retries: u8,
    first_helper: Option<PeerId>,
    probe_external_port: Option<u16>,
    observed: Vec<(PeerId, SocketAddr)>,
    probe_replies: HashSet<PeerId>,
    resolved_at: Option<u64>,
}

impl Default for Reflection {
    fn default() -> Self {
        Self::new()
    }
}

impl Reflection {
    /// Fresh, unresolved state
    #[must_use]
    pub fn new() -> Self {
        Self {
            stage: ReflectionStage::Unknown,
            round: 0,
            retries: 0,
            first_helper: None,
            probe_external_port: None,
            observed: Vec::new(),
            probe_replies: HashSet::new(),
            resolved_at: None,
        }
    }

    /// Current stage
    #[must_use]
    pub fn stage(&self) -> ReflectionStage {
        self.stage
    }

    /// Id of the round in flight
    #[must_use]
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Retry counter
    #[must_use]
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// A round is waiting on responses
    #[must_use]
    pub fn in_flight(&self) -> bool {
        matches!(
            self.stage,
            ReflectionStage::Stage1 | ReflectionStage::Stage2 | ReflectionStage::Resolving
        )
    }

    /// When the last classification finished
    #[must_use]
    pub fn resolved_at(&self) -> Option<u64> {
        self.resolved_at
    }

    /// Helper used for stage one
    #[must_use]
    pub fn first_helper(&self) -> Option<PeerId> {
        self.first_helper
    }

    /// External port of the probe socket seen by the first helper
    #[must_use]
    pub fn probe_external_port(&self) -> Option<u16> {
        self.probe_external_port
    }

    /// Start stage one with `helper`
    pub fn begin(&mut self, round: u64, helper: PeerId) {
        self.stage = ReflectionStage::Stage1;
        self.round = round;
        self.first_helper = Some(helper);
        self.probe_external_port = None;
        self.observed.clear();
        self.probe_replies.clear();
    }

    /// Record the probe-socket pong. Returns true when stage one completes.
    pub fn on_probe_pong(&mut self, round: u64, observed: SocketAddr) -> bool {
        if self.stage != ReflectionStage::Stage1 || round != self.round {
            return false;
        }
        self.probe_external_port = Some(observed.port());
        true
    }

    /// Enter stage two under a new round id
    pub fn advance(&mut self, round: u64) {
        self.stage = ReflectionStage::Stage2;
        self.round = round;
    }

    /// Record a primary-socket pong.
    ///
    /// Returns the address the helpers agree on (or the first one seen) and
    /// whether both saw the same port, once two distinct helpers answered.
    pub fn on_stage2_pong(
        &mut self,
        round: u64,
        helper: PeerId,
        observed: SocketAddr,
    ) -> Option<(SocketAddr, bool)> {
        if self.stage != ReflectionStage::Stage2 || round != self.round {
            return None;
        }
        if self.observed.iter().any(|(p, _)| *p == helper) {
            return None;
        }
        self.observed.push((helper, observed));
        if self.observed.len() < 2 {
            return None;
        }
        self.stage = ReflectionStage::Resolving;
        let (_, first) = self.observed[0];
        let (_, second) = self.observed[1];
        Some((first, first.port() == second.port()))
    }

    /// Record an unsolicited probe reply
    pub fn on_probe_reply(&mut self, round: u64, helper: PeerId) {
        if matches!(
            self.stage,
            ReflectionStage::Stage2 | ReflectionStage::Resolving
        ) && round == self.round
        {
            self.probe_replies.insert(helper);
        }
    }

    /// Finish the round and classify
    pub fn resolve(&mut self, round: u64, now: u64) -> Option<NatType> {
        if self.stage != ReflectionStage::Resolving || round != self.round {
            return None;
        }
        let same_port = self
            .observed
            .first()
            .zip(self.observed.get(1))
            .is_some_and(|((_, a), (_, b))| a.port() == b.port());
        let nat = classify(same_port, self.probe_replies.len());
        self.stage = ReflectionStage::Resolved;
        self.retries = 0;
        self.resolved_at = Some(now);
        Some(nat)
    }

    /// Abandon the round in flight. Returns the delay before retrying.
    pub fn fail(&mut self) -> Duration {
        self.stage = ReflectionStage::Unknown;
        self.retries = (self.retries + 1).min(MAX_REFLECTION_RETRIES);
        REFLECTION_RETRY_UNIT * u32::from(self.retries)
    }

    /// Forget the last classification so the next tick reflects again
    pub fn expire(&mut self) {
        if self.stage == ReflectionStage::Resolved {
            self.stage = ReflectionStage::Unknown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [NatType; 4] = [
        NatType::UNRESTRICTED,
        NatType::ADDR_RESTRICTED,
        NatType::PORT_RESTRICTED,
        NatType::ENDPOINT_RESTRICTED,
    ];

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], port))
    }

    #[test]
    fn test_from_bits_rejects_unknown() {
        assert_eq!(NatType::from_bits(0x09), Some(NatType::UNRESTRICTED));
        assert!(NatType::from_bits(0x20).is_none());
        assert!(NatType::from_bits(0xFF).is_none());
    }

    #[test]
    fn test_parts() {
        let nat = NatType::ALLOW_KNOWN_IP | NatType::ENDPOINT_INDEPENDENT;
        assert_eq!(nat, NatType::ADDR_RESTRICTED);
        assert_eq!(nat.firewall(), Some(Firewall::AllowKnownIp));
        assert_eq!(nat.mapping(), Some(Mapping::EndpointIndependent));
        assert!(nat.is_resolved());
        assert!(!NatType::UNKNOWN.is_resolved());
        assert!(!NatType::ALLOW_ANY.is_resolved());
    }

    #[test]
    fn test_strategy_table() {
        use Strategy::*;
        let expected = [
            [DirectConnect, TraversalConnect, TraversalConnect, TraversalConnect],
            [DirectConnect, TraversalConnect, TraversalConnect, TraversalConnect],
            [DirectConnect, TraversalConnect, TraversalConnect, TraversalOpen],
            [DirectConnect, TraversalConnect, TraversalOpen, Proxy],
        ];
        for (i, local) in ALL.iter().enumerate() {
            for (j, remote) in ALL.iter().enumerate() {
                assert_eq!(
                    strategy(*local, *remote),
                    expected[i][j],
                    "local {local} remote {remote}"
                );
            }
        }
    }

    #[test]
    fn test_strategy_defers_unresolved() {
        for nat in ALL {
            assert_eq!(strategy(NatType::UNKNOWN, nat), Strategy::Defer);
            assert_eq!(strategy(nat, NatType::UNKNOWN), Strategy::Defer);
            assert_eq!(strategy(nat, NatType::ALLOW_ANY), Strategy::Defer);
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(true, 2), NatType::UNRESTRICTED);
        assert_eq!(classify(true, 1), NatType::ADDR_RESTRICTED);
        assert_eq!(classify(true, 0), NatType::PORT_RESTRICTED);
        assert_eq!(classify(false, 0), NatType::ENDPOINT_RESTRICTED);
        assert_eq!(
            classify(false, 2),
            NatType::ALLOW_ANY | NatType::ENDPOINT_DEPENDENT
        );
    }

    #[test]
    fn test_reflection_full_round() {
        let h1 = PeerId::from_bytes([1; 32]);
        let h2 = PeerId::from_bytes([2; 32]);
        let mut r = Reflection::new();

        r.begin(10, h1);
        assert_eq!(r.stage(), ReflectionStage::Stage1);
        assert!(!r.on_probe_pong(99, addr(40001)));
        assert!(r.on_probe_pong(10, addr(40001)));
        assert_eq!(r.probe_external_port(), Some(40001));

        r.advance(11);
        assert!(r.on_stage2_pong(11, h1, addr(40000)).is_none());
        assert!(r.on_stage2_pong(11, h1, addr(40000)).is_none());
        assert_eq!(
            r.on_stage2_pong(11, h2, addr(40000)),
            Some((addr(40000), true))
        );
        r.on_probe_reply(11, h1);
        r.on_probe_reply(11, h2);
        r.on_probe_reply(10, h2);

        assert_eq!(r.resolve(11, 5_000), Some(NatType::UNRESTRICTED));
        assert_eq!(r.stage(), ReflectionStage::Resolved);
        assert_eq!(r.resolved_at(), Some(5_000));
        assert!(!r.in_flight());
    }

    #[test]
    fn test_reflection_dependent_mapping() {
        let mut r = Reflection::new();
        r.begin(1, PeerId::from_bytes([1; 32]));
        r.on_probe_pong(1, addr(40001));
        r.advance(2);
        r.on_stage2_pong(2, PeerId::from_bytes([1; 32]), addr(40002));
        let (_, same) = r
            .on_stage2_pong(2, PeerId::from_bytes([2; 32]), addr(40003))
            .unwrap();
        assert!(!same);
        assert_eq!(r.resolve(2, 0), Some(NatType::ENDPOINT_RESTRICTED));
    }

    #[test]
    fn test_reflection_backoff_saturates() {
        let mut r = Reflection::new();
        r.begin(1, PeerId::from_bytes([1; 32]));
        assert_eq!(r.fail(), Duration::from_millis(256));
        assert_eq!(r.stage(), ReflectionStage::Unknown);
        assert_eq!(r.fail(), Duration::from_millis(512));
        for _ in 0..40 {
            r.fail();
        }
        assert_eq!(r.retries(), MAX_REFLECTION_RETRIES);
        assert_eq!(r.fail(), Duration::from_millis(256 * 16));
    }

    #[test]
    fn test_stale_round_ignored() {
        let mut r = Reflection::new();
        r.begin(1, PeerId::from_bytes([1; 32]));
        r.fail();
        assert!(!r.on_probe_pong(1, addr(1)));
        assert!(r.resolve(1, 0).is_none());
    }
}
