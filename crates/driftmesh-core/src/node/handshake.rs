//! Introduction-driven connection setup.
//!
//! After an introduction both sides punch at the same time. A side that
//! hears nothing within `intro_timeout` punches once more, and after a
//! second silence routes through the connector instead.

use crate::id::PeerId;
use crate::nat::{Mapping, Strategy};
use crate::node::events::NodeEvent;
use crate::node::node::{Node, PingKind};
use crate::node::sockets::LocalSocket;
use crate::node::state::{HandshakeState, NodeState};
use std::net::SocketAddr;

impl Node {
    /// Start connecting to `peer_id`, introduced by `connector`
    pub(crate) async fn begin_handshake(
        &self,
        st: &mut NodeState,
        peer_id: PeerId,
        connector: PeerId,
        strategy: Strategy,
    ) {
        match strategy {
            Strategy::Defer => {
                tracing::debug!(
                    "Deferring connection to {}: NAT type unresolved",
                    peer_id.short()
                );
            }
            Strategy::Proxy => self.fall_back_to_proxy(st, peer_id, connector),
            Strategy::DirectConnect | Strategy::TraversalConnect | Strategy::TraversalOpen => {
                let token: u64 = rand::random();
                st.handshakes.insert(
                    peer_id,
                    HandshakeState::Probing {
                        token,
                        connector,
                        strategy,
                    },
                );
                self.punch(st, peer_id, strategy).await;
                self.schedule_handshake_timeout(peer_id, token);
            }
        }
    }

    async fn punch(&self, st: &mut NodeState, peer_id: PeerId, strategy: Strategy) {
        let Some(address) = st.peers.get(&peer_id).and_then(|p| p.address) else {
            return;
        };

        match strategy {
            Strategy::TraversalOpen
                if st.nat_type.mapping() == Some(Mapping::EndpointDependent) =>
            {
                // Our external port changes per destination; each fresh
                // socket is another chance the peer's filter lets through
                let mut opened = 0;
                for _ in 0..self.inner.config.nat.punch_sockets {
                    let Some(socket) = self.open_pool_socket(st).await else {
                        break;
                    };
                    self.send_ping(st, address, socket, PingKind::Punch, Some(peer_id))
                        .await;
                    opened += 1;
                }
                tracing::debug!("Punched {} from {} pool sockets", peer_id.short(), opened);
            }
            Strategy::TraversalOpen => {
                // The peer's port changes per destination: spray the ports
                // it is likely to allocate next
                let span = self.inner.config.nat.prediction_span;
                for offset in 0..span {
                    let Some(port) = address.port().checked_add(offset) else {
                        break;
                    };
                    let target = SocketAddr::new(address.ip(), port);
                    self.send_ping(st, target, LocalSocket::Primary, PingKind::Punch, Some(peer_id))
                        .await;
                }
            }
            _ => {
                self.send_ping(
                    st,
                    address,
                    LocalSocket::Primary,
                    PingKind::Connection,
                    Some(peer_id),
                )
                .await;
            }
        }
    }

    fn schedule_handshake_timeout(&self, peer_id: PeerId, token: u64) {
        let node = self.clone();
        let timeout = self.inner.config.timing.intro_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            node.on_handshake_timeout(peer_id, token).await;
        });
    }

    async fn on_handshake_timeout(&self, peer_id: PeerId, token: u64) {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return;
        }
        let Some(state) = st.handshakes.get(&peer_id).copied() else {
            return;
        };
        if st.peers.get(&peer_id).is_none_or(|p| p.connected) {
            st.handshakes.remove(&peer_id);
            return;
        }

        match state {
            HandshakeState::Probing {
                token: current,
                connector,
                strategy,
            } if current == token => {
                tracing::debug!("No answer from {}, punching again", peer_id.short());
                st.handshakes.insert(
                    peer_id,
                    HandshakeState::AwaitingSecondResponse {
                        token,
                        connector,
                        strategy,
                    },
                );
                self.punch(&mut st, peer_id, strategy).await;
                self.schedule_handshake_timeout(peer_id, token);
            }
            HandshakeState::AwaitingSecondResponse {
                token: current,
                connector,
                ..
            } if current == token => {
                self.fall_back_to_proxy(&mut st, peer_id, connector);
            }
            _ => {}
        }
    }

    /// Reach `peer_id` through `connector` from now on
    pub(crate) fn fall_back_to_proxy(&self, st: &mut NodeState, peer_id: PeerId, connector: PeerId) {
        let Some(peer) = st.peers.get_mut(&peer_id) else {
            return;
        };
        peer.proxies.insert(connector);
        peer.strategy = Some(Strategy::Proxy);
        st.handshakes
            .insert(peer_id, HandshakeState::FallbackProxy { connector });

        tracing::info!(
            "Reaching {} through proxy {}",
            peer_id.short(),
            connector.short()
        );
        self.emit(NodeEvent::Proxied {
            peer_id,
            proxy: connector,
        });
    }
}
