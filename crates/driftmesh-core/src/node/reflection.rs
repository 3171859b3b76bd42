//! NAT reflection driver.
//!
//! ```text
//! stage 1: probe socket ──ping──► H1        learn the probe socket's external port
//! stage 2: primary ──ping──► H1, H2         same external port on both? (mapping)
//!          H1 probe ─┐  H2 primary ─┐
//!                    └─► probe port ◄┘      how many unsolicited replies? (firewall)
//! ```
//!
//! H2 must never have been probed, otherwise the probe socket's mapping
//! would already admit it. A round that times out is abandoned and retried
//! after `retries * 256ms`.

use crate::id::{PeerId, SubclusterId};
use crate::messages::{ReflectionRequest, ReflectionStep};
use crate::nat::ReflectionStage;
use crate::node::events::NodeEvent;
use crate::node::node::{Node, PingKind};
use crate::node::sockets::LocalSocket;
use crate::node::state::NodeState;
use crate::packet::PacketKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;

impl Node {
    /// Start a reflection round if none is running
    pub(crate) async fn request_reflection(&self, st: &mut NodeState) {
        if self.inner.config.nat.static_type.is_some()
            || self.inner.config.indexed
            || st.reflection.in_flight()
        {
            return;
        }

        let helpers = st.reflection_helpers();
        // Reuse a helper that already saw the probe socket, keeping fresh
        // ones for stage two
        let first = helpers
            .iter()
            .find(|(_, _, probed)| *probed)
            .or(helpers.first())
            .copied();
        let Some((helper, address, _)) = first else {
            tracing::debug!("No reflection helpers available");
            self.ping_indexed(st).await;
            let delay = st.reflection.fail();
            self.schedule_reflection_retry(st, delay);
            return;
        };

        let round: u64 = rand::random();
        st.reflection.begin(round, helper);
        if let Some(peer) = st.peers.get_mut(&helper) {
            peer.reflection_probed = true;
        }

        let request = ReflectionRequest {
            round,
            step: ReflectionStep::Probe,
            probe_external_port: None,
            reply_from_probe: false,
        };
        self.send_reflection_ping(st, request, address, LocalSocket::Probe)
            .await;
        tracing::debug!("Reflection round started via {}", helper.short());
        self.schedule_reflection_timeout(st, round);
    }

    async fn send_reflection_ping(
        &self,
        st: &mut NodeState,
        request: ReflectionRequest,
        to: SocketAddr,
        via: LocalSocket,
    ) -> bool {
        let mut ping = self.ping_message(st, PingKind::Plain);
        ping.reflection = Some(request);
        self.send_control(st, PacketKind::Ping, SubclusterId::default(), &ping, to, via)
            .await
    }

    /// Route a pong that carries a reflection round
    pub(crate) async fn on_reflection_pong(
        &self,
        st: &mut NodeState,
        round: u64,
        responder: PeerId,
        observed: SocketAddr,
        is_probe_reply: bool,
        via: LocalSocket,
    ) {
        if is_probe_reply {
            if via == LocalSocket::Probe {
                st.reflection.on_probe_reply(round, responder);
            }
            return;
        }

        match st.reflection.stage() {
            ReflectionStage::Stage1 if via == LocalSocket::Probe => {
                if st.reflection.on_probe_pong(round, observed) {
                    self.begin_stage_two(st).await;
                }
            }
            ReflectionStage::Stage2 if via != LocalSocket::Probe => {
                if let Some((address, same_port)) =
                    st.reflection.on_stage2_pong(round, responder, observed)
                {
                    tracing::debug!(
                        "Reflected address {} (port stable: {})",
                        address,
                        same_port
                    );
                    st.address = Some(address);
                    let node = self.clone();
                    let window = self.inner.config.nat.probe_window;
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        node.finish_reflection(round).await;
                    });
                    Self::replace_reflection_timer(st, timer);
                }
            }
            _ => {}
        }
    }

    async fn begin_stage_two(&self, st: &mut NodeState) {
        let first = st
            .reflection
            .first_helper()
            .and_then(|id| st.peers.get(&id))
            .and_then(|p| p.address);
        let port = st.reflection.probe_external_port();
        let first_helper = st.reflection.first_helper();
        let second = st
            .reflection_helpers()
            .into_iter()
            .find(|(id, _, probed)| Some(*id) != first_helper && !probed);

        let (Some(first), Some(port), Some((second_id, second, _))) = (first, port, second) else {
            tracing::debug!("Not enough reflection helpers for stage two");
            if let Some(timer) = st.reflection_timer.take() {
                timer.abort();
            }
            self.ping_indexed(st).await;
            let delay = st.reflection.fail();
            self.schedule_reflection_retry(st, delay);
            return;
        };

        let round: u64 = rand::random();
        st.reflection.advance(round);
        if let Some(peer) = st.peers.get_mut(&second_id) {
            peer.reflection_probed = true;
        }

        // H1 answers from its probe socket, whose address our probe
        // socket never contacted; H2 from a host it never contacted
        let to_first = ReflectionRequest {
            round,
            step: ReflectionStep::Classify,
            probe_external_port: Some(port),
            reply_from_probe: true,
        };
        let to_second = ReflectionRequest {
            reply_from_probe: false,
            ..to_first.clone()
        };
        self.send_reflection_ping(st, to_first, first, LocalSocket::Primary)
            .await;
        self.send_reflection_ping(st, to_second, second, LocalSocket::Primary)
            .await;
        self.schedule_reflection_timeout(st, round);
    }

    fn replace_reflection_timer(st: &mut NodeState, timer: JoinHandle<()>) {
        if let Some(previous) = st.reflection_timer.replace(timer) {
            previous.abort();
        }
    }

    fn schedule_reflection_timeout(&self, st: &mut NodeState, round: u64) {
        let node = self.clone();
        let timeout = self.inner.config.nat.reflection_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            node.on_reflection_timeout(round).await;
        });
        Self::replace_reflection_timer(st, timer);
    }

    fn schedule_reflection_retry(&self, st: &mut NodeState, delay: Duration) {
        let node = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            node.retry_reflection().await;
        });
        Self::replace_reflection_timer(st, timer);
    }

    async fn on_reflection_timeout(&self, round: u64) {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() || !st.reflection.in_flight() || st.reflection.round() != round {
            return;
        }
        // This task is the current timer; detach it rather than abort itself
        st.reflection_timer = None;

        let delay = st.reflection.fail();
        tracing::debug!(
            "Reflection round timed out (attempt {}), retrying in {:?}",
            st.reflection.retries(),
            delay
        );
        self.schedule_reflection_retry(&mut st, delay);
    }

    async fn retry_reflection(&self) {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return;
        }
        st.reflection_timer = None;
        if !self.inner.availability.is_online() {
            // The next tick after connectivity returns starts a new round
            return;
        }
        self.request_reflection(&mut st).await;
    }

    async fn finish_reflection(&self, round: u64) {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return;
        }
        let now = self.now_ms();
        let Some(nat_type) = st.reflection.resolve(round, now) else {
            return;
        };
        st.reflection_timer = None;
        st.nat_type = nat_type;
        let cleared = st.clear_fallbacks();
        if cleared > 0 {
            tracing::debug!("Retrying direct paths to {} proxied peers", cleared);
        }

        tracing::info!("NAT resolved: {} at {:?}", nat_type, st.address);
        self.emit(NodeEvent::NatResolved {
            nat_type,
            address: st.address,
        });

        // Re-announce with the new classification
        self.heartbeat(&mut st).await;
        self.flush_unpublished(&mut st).await;
    }

    /// Ping indexed peers so more helpers become available
    async fn ping_indexed(&self, st: &mut NodeState) {
        let targets: Vec<(PeerId, SocketAddr)> = st
            .peers
            .values()
            .filter(|p| p.indexed)
            .filter_map(|p| p.address.map(|a| (p.peer_id, a)))
            .collect();
        for (peer_id, address) in targets {
            self.send_ping(st, address, LocalSocket::Primary, PingKind::Plain, Some(peer_id))
                .await;
        }
    }

    /// Reflection is due when unresolved, or when the classification is
    /// older than the refresh interval and an unprobed helper exists
    pub(crate) fn reflection_due(&self, st: &NodeState, now: u64) -> bool {
        if self.inner.config.nat.static_type.is_some()
            || self.inner.config.indexed
            || st.reflection.in_flight()
        {
            return false;
        }
        if !st.nat_type.is_resolved() {
            return true;
        }
        let refresh = Self::ms(self.inner.config.nat.reflection_refresh);
        let stale = st
            .reflection
            .resolved_at()
            .is_some_and(|at| now.saturating_sub(at) >= refresh);
        stale && st.reflection_helpers().iter().any(|(_, _, probed)| !probed)
    }
}
