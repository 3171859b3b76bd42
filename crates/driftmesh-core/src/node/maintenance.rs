//! Periodic maintenance.
//!
//! Runs every `keepalive`:
//! - heartbeat every directly reachable peer
//! - start or refresh reflection
//! - evict expired packets, gossiping each one a final time
//! - age the dedup and introduction gates
//! - prune silent peers
//! - re-announce joined subclusters and flush queued publishes

use crate::node::events::NodeEvent;
use crate::node::node::Node;
use crate::node::state::NodeState;
use crate::packet::Packet;
use crate::peer::prune_stale;
use tokio::task::JoinHandle;

impl Node {
    pub(crate) fn spawn_maintenance(&self) -> JoinHandle<()> {
        let node = self.clone();
        let period = self.inner.config.timing.keepalive;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; init already ran a pass
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.is_closing() {
                    break;
                }
                node.tick().await;
            }
        })
    }

    /// Run one maintenance pass now
    pub async fn tick(&self) {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() || st.sockets.is_none() {
            return;
        }

        let now = self.now_ms();
        let online = self.inner.availability.is_online();

        if online {
            self.heartbeat(&mut st).await;
            if self.reflection_due(&st, now) {
                st.reflection.expire();
                self.request_reflection(&mut st).await;
            }
        }

        let mut evicted: Vec<Packet> = Vec::new();
        let count = st.cache.sweep(now, |packet| evicted.push(packet.clone()));
        if count > 0 {
            tracing::debug!("Evicted {} expired packets", count);
        }
        if online {
            for packet in evicted
                .into_iter()
                .filter(|p| p.tags().proxy_recipient.is_none())
            {
                self.mcast_packet(&mut st, packet, &[]).await;
            }
        }

        st.gate.tick();
        st.intro_gate.tick();
        st.rate_limiter.cleanup_stale(now);
        // Receive loops of replaced sockets have exited
        st.tasks.retain(|task| !task.is_finished());

        if !online {
            return;
        }

        self.prune(&mut st, now);

        for subcluster in st.active_subclusters() {
            self.send_join(&mut st, subcluster).await;
        }
        self.flush_unpublished(&mut st).await;
    }

    fn prune(&self, st: &mut NodeState, now: u64) {
        let max_silence = Self::ms(self.inner.config.timing.keepalive)
            .saturating_mul(u64::from(crate::PEER_SILENCE_INTERVALS));
        let removed = prune_stale(&mut st.peers, now, max_silence);
        for peer_id in removed {
            st.handshakes.remove(&peer_id);
            st.join_clocks.retain(|(id, _), _| *id != peer_id);
            tracing::debug!("Pruned silent peer {}", peer_id.short());
            self.emit(NodeEvent::Disconnection { peer_id });
        }
    }

    /// Gossip queued publishes; ids stay queued until someone takes them
    pub(crate) async fn flush_unpublished(&self, st: &mut NodeState) {
        if st.unpublished.is_empty() || !self.inner.availability.is_online() {
            return;
        }
        let mut queued: Vec<_> = st.unpublished.iter().copied().collect();
        queued.sort_unstable();

        for id in queued {
            let Some(packet) = st.cache.get(&id).cloned() else {
                // Expired while queued
                st.unpublished.remove(&id);
                continue;
            };
            if self.mcast_packet(st, packet, &[]).await > 0 {
                st.unpublished.remove(&id);
            }
        }
        if !st.unpublished.is_empty() {
            tracing::trace!("{} publishes still queued", st.unpublished.len());
        }
    }
}
