//! Packet dispatch.
//!
//! Every datagram that decodes is charged to the rate limiter, checked
//! against the hop ceiling and handed to the handler for its kind while the
//! state lock is held.

use crate::id::{PeerId, SubclusterId};
use crate::messages::{
    IntroMessage, JoinMessage, PeerDescriptor, PingMessage, PongMessage, ReflectionStep, Rendezvous,
};
use crate::nat::{self, Strategy};
use crate::node::error::{NodeError, Result};
use crate::node::events::NodeEvent;
use crate::node::node::{Node, PingKind};
use crate::node::sockets::LocalSocket;
use crate::node::state::NodeState;
use crate::packet::{Packet, PacketKind, decode_body};
use crate::peer::{RemotePeer, Route};
use crate::subcluster::{self, SubclusterEvent};
use std::net::SocketAddr;

impl Node {
    /// Handle one inbound datagram
    pub(crate) async fn handle_datagram(&self, data: &[u8], from: SocketAddr, via: LocalSocket) {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        let mut st = self.inner.state.lock().await;
        if self.is_closing() || st.is_own_address(from) {
            return;
        }

        let now = self.now_ms();
        let override_quota = st
            .subclusters
            .get(&packet.subcluster_id())
            .and_then(|s| s.options.rate_limit);
        if !st
            .rate_limiter
            .check(packet.kind(), from, now, override_quota)
        {
            tracing::trace!("Rate limited {:?} from {}", packet.kind(), from);
            return;
        }

        if packet.hops() > self.inner.config.gossip.max_hops {
            tracing::trace!("Dropping {:?} from {}: too many hops", packet.kind(), from);
            return;
        }

        st.last_update = now;
        st.observe_clock(packet.clock());

        let kind = packet.kind();
        let result = match kind {
            PacketKind::Ping => self.handle_ping(&mut st, &packet, from, via).await,
            PacketKind::Pong => self.handle_pong(&mut st, &packet, from, via).await,
            PacketKind::Intro => self.handle_intro(&mut st, &packet, from, via).await,
            PacketKind::Join => self.handle_join(&mut st, packet, from, via).await,
            PacketKind::Publish => self.handle_publish(&mut st, packet, from).await,
            PacketKind::PublishProxied => self.handle_publish_proxied(&mut st, packet, from).await,
        };

        if let Err(e) = result {
            tracing::debug!("Error handling {:?} from {}: {}", kind, from, e);
        }
    }

    async fn handle_ping(
        &self,
        st: &mut NodeState,
        packet: &Packet,
        from: SocketAddr,
        via: LocalSocket,
    ) -> Result<()> {
        let ping: PingMessage = decode_body(packet.message())?;
        let requester = ping.requester.peer_id;
        if requester == self.peer_id() {
            return Ok(());
        }

        if let Some(reflection) = ping.reflection.as_ref() {
            if reflection.step == ReflectionStep::Probe {
                // Sent from the requester's probe socket; answer without
                // touching its routing record
                let round = reflection.round;
                self.send_pong(st, &ping, from, via, Some(round), false).await;
                return Ok(());
            }
        }

        let now = self.now_ms();
        let cluster = packet.cluster_id();
        let newly = {
            let peer = st
                .peers
                .entry(requester)
                .or_insert_with(|| RemotePeer::new(requester, now));
            peer.observe(&ping.requester);
            peer.set_memberships(cluster, &ping.subclusters);
            via != LocalSocket::Probe && peer.touch(from, via, now)
        };
        if newly {
            self.on_connected(st, requester);
        } else if ping.is_connection {
            st.handshakes.remove(&requester);
        }

        if let Some(summary) = ping.cache_summary.as_ref() {
            let ours = st.cache.summarize(|p| p.cluster_id() == cluster);
            if ours.digest != summary.digest {
                tracing::trace!(
                    "Cache of {} differs ({} vs {} packets)",
                    requester.short(),
                    summary.count,
                    ours.count
                );
            }
        }

        let round = ping.reflection.as_ref().map(|r| r.round);
        self.send_pong(st, &ping, from, via, round, false).await;

        // Second reflection stage: also reply unsolicited to the requester's
        // probe socket so it can learn how its firewall filters
        if let Some(reflection) = ping
            .reflection
            .as_ref()
            .filter(|r| r.step == ReflectionStep::Classify)
        {
            if let Some(port) = reflection.probe_external_port {
                let target = SocketAddr::new(from.ip(), port);
                let socket = if reflection.reply_from_probe {
                    LocalSocket::Probe
                } else {
                    LocalSocket::Primary
                };
                self.send_pong(st, &ping, target, socket, Some(reflection.round), true)
                    .await;
            }
        }
        Ok(())
    }

    async fn send_pong(
        &self,
        st: &mut NodeState,
        ping: &PingMessage,
        to: SocketAddr,
        via: LocalSocket,
        reflection_round: Option<u64>,
        is_probe_reply: bool,
    ) -> bool {
        let cluster = self.cluster_id();
        let pong = PongMessage {
            request_id: ping.request_id,
            responder: self.descriptor(st),
            observed: to,
            subclusters: st.active_subclusters(),
            is_connection: ping.is_connection,
            reflection_round,
            is_probe_reply,
            cache_summary: ping
                .is_heartbeat
                .then(|| st.cache.summarize(|p| p.cluster_id() == cluster)),
        };
        self.send_control(st, PacketKind::Pong, SubclusterId::default(), &pong, to, via)
            .await
    }

    async fn handle_pong(
        &self,
        st: &mut NodeState,
        packet: &Packet,
        from: SocketAddr,
        via: LocalSocket,
    ) -> Result<()> {
        let pong: PongMessage = decode_body(packet.message())?;
        let responder = pong.responder.peer_id;
        if responder == self.peer_id() {
            return Ok(());
        }

        if let Some(round) = pong.reflection_round {
            self.on_reflection_pong(st, round, responder, pong.observed, pong.is_probe_reply, via)
                .await;
            if pong.is_probe_reply || via == LocalSocket::Probe {
                return Ok(());
            }
        }

        let now = self.now_ms();
        let newly = {
            let peer = st
                .peers
                .entry(responder)
                .or_insert_with(|| RemotePeer::new(responder, now));
            peer.observe(&pong.responder);
            peer.set_memberships(packet.cluster_id(), &pong.subclusters);
            via != LocalSocket::Probe && peer.touch(from, via, now)
        };
        if newly {
            self.on_connected(st, responder);
        } else if pong.is_connection {
            st.handshakes.remove(&responder);
        }
        Ok(())
    }

    async fn handle_intro(
        &self,
        st: &mut NodeState,
        packet: &Packet,
        from: SocketAddr,
        via: LocalSocket,
    ) -> Result<()> {
        let id = packet.packet_id();
        if st.gate.has_mark(&id) {
            return Ok(());
        }
        st.gate.mark(id, self.inner.config.gossip.dedup_credit);

        let intro: IntroMessage = decode_body(packet.message())?;
        let target = intro.peer.peer_id;
        if target == self.peer_id() || intro.connector == self.peer_id() {
            return Ok(());
        }

        let now = self.now_ms();
        let connector = intro.connector;
        let connector_new = via != LocalSocket::Probe
            && st
                .peers
                .entry(connector)
                .or_insert_with(|| RemotePeer::new(connector, now))
                .touch(from, via, now);
        if connector_new {
            self.on_connected(st, connector);
        }

        let local_nat = st.nat_type;
        let peer = st
            .peers
            .entry(target)
            .or_insert_with(|| RemotePeer::new(target, now));
        peer.observe(&intro.peer);
        if !peer.connected {
            if let Some(address) = intro.peer.address {
                peer.address = Some(address);
            }
        }
        peer.join(packet.cluster_id(), packet.subcluster_id());

        if peer.connected || st.handshakes.contains_key(&target) {
            return Ok(());
        }

        let strategy = nat::strategy(local_nat, peer.nat_type);
        peer.strategy = Some(strategy);
        tracing::debug!(
            "Introduced to {} by {}: {:?}",
            target.short(),
            connector.short(),
            strategy
        );
        self.begin_handshake(st, target, connector, strategy).await;
        Ok(())
    }

    async fn handle_join(
        &self,
        st: &mut NodeState,
        mut packet: Packet,
        from: SocketAddr,
        via: LocalSocket,
    ) -> Result<()> {
        let id = packet.packet_id();
        if st.gate.has_mark(&id) {
            return Ok(());
        }
        st.gate.mark(id, self.inner.config.gossip.dedup_credit);

        let join: JoinMessage = decode_body(packet.message())?;
        let requester = join.requester.peer_id;
        if requester == self.peer_id() {
            return Ok(());
        }

        let cluster = packet.cluster_id();
        let subcluster = packet.subcluster_id();
        let key = (requester, subcluster);
        if st.join_clocks.get(&key).is_some_and(|c| *c >= packet.clock()) {
            tracing::trace!("Stale join from {}", requester.short());
            return Ok(());
        }
        st.join_clocks.insert(key, packet.clock());

        let now = self.now_ms();
        let direct = packet.hops() <= 1;
        let relay = st.peer_by_address(from);
        let newly = {
            let peer = st
                .peers
                .entry(requester)
                .or_insert_with(|| RemotePeer::new(requester, now));
            peer.observe(&join.requester);
            peer.join(cluster, subcluster);
            direct && via != LocalSocket::Probe && peer.touch(from, via, now)
        };
        if newly {
            self.on_connected(st, requester);
        }

        // Asked to act as rendezvous for a specific pair
        if let Some(target) = join.rendezvous_target {
            if direct {
                self.introduce(st, requester, target, subcluster)
                    .await;
            }
            return Ok(());
        }

        if direct {
            let mut members: Vec<PeerId> = st
                .peers
                .values()
                .filter(|p| p.peer_id != requester && p.connected)
                .filter(|p| p.is_member(&cluster, &subcluster))
                .map(|p| p.peer_id)
                .collect();
            members.sort_unstable();
            members.truncate(self.inner.config.gossip.max_introductions);
            for member in members {
                self.introduce(st, requester, member, subcluster)
                    .await;
            }
            self.send_catch_up(st, subcluster, requester).await;
        }

        let is_member = st.subclusters.get(&subcluster).is_some_and(|s| s.active);
        if is_member {
            if direct {
                // Tell the requester we share the subcluster
                self.send_ping(st, from, via, PingKind::Plain, Some(requester))
                    .await;
            } else {
                self.connect_to_member(st, requester, packet.tags().rendezvous.as_ref(), subcluster)
                    .await;
            }
        }

        if packet.hops() >= self.inner.config.gossip.max_hops {
            return Ok(());
        }

        // An unrestricted node offers itself as rendezvous for a requester
        // that cannot accept unsolicited traffic
        if direct
            && packet.tags().rendezvous.is_none()
            && st.nat_type.is_unrestricted()
            && !join.requester.nat_type.is_unrestricted()
            && !join.requester.indexed
        {
            if let Some(address) = st.public_address() {
                packet.set_rendezvous(Rendezvous {
                    peer_id: self.peer_id(),
                    address,
                    deadline: now + Self::ms(self.inner.config.timing.keepalive),
                });
            }
        }

        let mut ignore = vec![requester];
        ignore.extend(relay);
        self.mcast_packet(st, packet, &ignore).await;
        Ok(())
    }

    /// A member heard about a new member through gossip
    async fn connect_to_member(
        &self,
        st: &mut NodeState,
        requester: PeerId,
        rendezvous: Option<&Rendezvous>,
        subcluster: SubclusterId,
    ) {
        if st.handshakes.contains_key(&requester) {
            return;
        }
        let Some(peer) = st.peers.get(&requester) else {
            return;
        };
        if peer.connected {
            return;
        }
        let address = peer.address;
        let strategy = nat::strategy(st.nat_type, peer.nat_type);
        let now = self.now_ms();

        match rendezvous.filter(|r| r.deadline > now && r.peer_id != self.peer_id()) {
            Some(r) if strategy != Strategy::DirectConnect => {
                self.request_introduction(st, r.address, requester, subcluster)
                    .await;
            }
            _ if strategy == Strategy::DirectConnect => {
                if let Some(address) = address {
                    self.send_ping(
                        st,
                        address,
                        LocalSocket::Primary,
                        PingKind::Connection,
                        Some(requester),
                    )
                    .await;
                }
            }
            _ => {}
        }
    }

    /// Ask the rendezvous at `address` to introduce us to `target`
    async fn request_introduction(
        &self,
        st: &mut NodeState,
        address: SocketAddr,
        target: PeerId,
        subcluster: SubclusterId,
    ) {
        let join = JoinMessage {
            requester: self.descriptor(st),
            rendezvous_target: Some(target),
            timestamp: self.now_ms(),
        };
        let mut packet = match self.control_packet(st, PacketKind::Join, subcluster, &join) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Failed to build rendezvous request: {}", e);
                return;
            }
        };
        // Unicast to the rendezvous, which must treat it as direct
        packet.increment_hops();
        st.gate
            .mark(packet.packet_id(), self.inner.config.gossip.dedup_credit);
        tracing::debug!("Asking {} to introduce {}", address, target.short());
        self.send_packet(st, &packet, address, LocalSocket::Primary)
            .await;
    }

    /// Introduce two directly reachable peers to each other
    pub(crate) async fn introduce(
        &self,
        st: &mut NodeState,
        a: PeerId,
        b: PeerId,
        subcluster: SubclusterId,
    ) {
        let pair = if a < b { (a, b) } else { (b, a) };
        if a == b || st.intro_gate.has_mark(&pair) {
            return;
        }
        let (Some(peer_a), Some(peer_b)) = (st.peers.get(&a), st.peers.get(&b)) else {
            return;
        };
        let (Some(route_a), Some(route_b)) = (peer_a.direct_route(), peer_b.direct_route()) else {
            return;
        };
        let (addr_a, sock_a) = (route_a.address(), route_a.socket());
        let (addr_b, sock_b) = (route_b.address(), route_b.socket());

        let describe = |peer: &RemotePeer, address: SocketAddr| PeerDescriptor {
            peer_id: peer.peer_id,
            address: Some(address),
            nat_type: peer.nat_type,
            indexed: peer.indexed,
        };
        let desc_a = describe(peer_a, addr_a);
        let desc_b = describe(peer_b, addr_b);
        st.intro_gate.mark(pair, self.inner.config.gossip.intro_credit);

        let now = self.now_ms();
        let to_a = IntroMessage {
            peer: desc_b,
            connector: self.peer_id(),
            timestamp: now,
        };
        let to_b = IntroMessage {
            peer: desc_a,
            connector: self.peer_id(),
            timestamp: now,
        };
        self.send_control(st, PacketKind::Intro, subcluster, &to_a, addr_a, sock_a)
            .await;
        self.send_control(st, PacketKind::Intro, subcluster, &to_b, addr_b, sock_b)
            .await;
        tracing::debug!("Introduced {} and {}", a.short(), b.short());
    }

    /// Push recent cached publishes of `subcluster` to a peer that just joined
    async fn send_catch_up(&self, st: &mut NodeState, subcluster: SubclusterId, peer_id: PeerId) {
        let Some(route) = st.peers.get(&peer_id).and_then(RemotePeer::direct_route) else {
            return;
        };
        let packets = st
            .cache
            .recent(subcluster, self.inner.config.gossip.catch_up_limit);
        let mut sent = 0;
        for packet in packets
            .iter()
            .filter(|p| p.tags().proxy_recipient.is_none())
        {
            if self
                .send_packet(st, packet, route.address(), route.socket())
                .await
            {
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::debug!("Sent {} cached packets to {}", sent, peer_id.short());
        }
    }

    async fn handle_publish(
        &self,
        st: &mut NodeState,
        packet: Packet,
        from: SocketAddr,
    ) -> Result<()> {
        let id = packet.packet_id();
        if st.gate.has_mark(&id) || st.cache.has(&id) {
            return Ok(());
        }
        st.gate.mark(id, self.inner.config.gossip.dedup_credit);

        if !packet.has_valid_signature() {
            return Err(NodeError::Crypto(format!(
                "invalid signature on {}",
                id.short()
            )));
        }

        let origin = packet.tags().sender_key.map(PeerId::from_bytes);
        if origin == Some(self.peer_id()) {
            return Ok(());
        }

        match packet.tags().proxy_recipient {
            None => {
                let now = self.now_ms();
                st.cache.insert(packet.clone(), now);
                self.deliver(st, &packet);

                let mut ignore: Vec<PeerId> = origin.into_iter().collect();
                ignore.extend(st.peer_by_address(from));
                self.mcast_packet(st, packet, &ignore).await;
            }
            Some(recipient) if recipient == self.peer_id() => {
                self.note_relay(st, origin, from);
                self.deliver(st, &packet);
            }
            Some(recipient) => match st.route_to(&recipient) {
                Some(Route::Direct { address, socket }) => {
                    self.send_packet(st, &packet, address, socket).await;
                }
                _ => {
                    tracing::trace!("No direct route to {} for {}", recipient.short(), id.short());
                }
            },
        }
        Ok(())
    }

    async fn handle_publish_proxied(
        &self,
        st: &mut NodeState,
        mut packet: Packet,
        from: SocketAddr,
    ) -> Result<()> {
        let id = packet.packet_id();
        if st.gate.has_mark(&id) {
            return Ok(());
        }
        st.gate.mark(id, self.inner.config.gossip.dedup_credit);

        if !packet.has_valid_signature() {
            return Err(NodeError::Crypto(format!(
                "invalid signature on {}",
                id.short()
            )));
        }

        let Some(recipient) = packet.tags().proxy_recipient else {
            return Err(NodeError::validation("proxied publish without recipient"));
        };
        let origin = packet.tags().sender_key.map(PeerId::from_bytes);

        if recipient == self.peer_id() {
            self.note_relay(st, origin, from);
            self.deliver(st, &packet);
            return Ok(());
        }

        match st.route_to(&recipient) {
            Some(Route::Direct { address, socket }) => {
                packet.set_kind(PacketKind::Publish);
                tracing::trace!("Relaying {} to {}", id.short(), recipient.short());
                self.send_packet(st, &packet, address, socket).await;
                Ok(())
            }
            _ => Err(NodeError::PeerUnreachable(recipient)),
        }
    }

    /// A unicast from `origin` arrived through another peer: remember that
    /// peer as a proxy so replies can take the same path
    fn note_relay(&self, st: &mut NodeState, origin: Option<PeerId>, from: SocketAddr) {
        let Some(origin) = origin else {
            return;
        };
        let Some(relay) = st.peer_by_address(from).filter(|r| *r != origin) else {
            return;
        };
        let now = self.now_ms();
        let peer = st
            .peers
            .entry(origin)
            .or_insert_with(|| RemotePeer::new(origin, now));
        if !peer.has_direct_route() {
            peer.proxies.insert(relay);
        }
    }

    /// Decrypt a publish for a joined subcluster and fan it out
    pub(crate) fn deliver(&self, st: &NodeState, packet: &Packet) {
        let Some(joined) = st
            .subclusters
            .get(&packet.subcluster_id())
            .filter(|s| s.active)
        else {
            return;
        };

        match subcluster::unpack(&joined.keys, packet) {
            Ok(envelope) => {
                let event = SubclusterEvent {
                    subcluster_id: packet.subcluster_id(),
                    packet_id: packet.packet_id(),
                    name: envelope.name,
                    value: envelope.value,
                    from: packet.tags().sender_key.map(PeerId::from_bytes),
                };
                // No listeners is fine
                let _ = joined.events.send(event.clone());
                self.emit(NodeEvent::Message(event));
            }
            Err(e) => {
                tracing::debug!("Failed to open {}: {}", packet.packet_id().short(), e);
            }
        }
    }

    /// First direct contact with a peer
    pub(crate) fn on_connected(&self, st: &mut NodeState, peer_id: PeerId) {
        let local = st.nat_type;
        let Some(peer) = st.peers.get_mut(&peer_id) else {
            return;
        };
        let strategy = match peer.strategy {
            Some(Strategy::Proxy) | None => match nat::strategy(local, peer.nat_type) {
                Strategy::Defer | Strategy::Proxy => Strategy::DirectConnect,
                s => s,
            },
            Some(s) => s,
        };
        peer.strategy = Some(strategy);
        peer.proxies.clear();
        st.handshakes.remove(&peer_id);

        tracing::info!("Connected to {} ({:?})", peer_id.short(), strategy);
        self.emit(NodeEvent::Connection { peer_id, strategy });
    }
}
