//! Socket management.
//!
//! A node owns a primary socket, a probe socket used only for reflection,
//! and a pool of short-lived punch sockets opened when hole punching against
//! a dependent mapping. Each socket has its own receive loop:
//!
//! ```text
//! recv_from (100ms poll) ─► handle_datagram ─► decode ─► rate limit ─► dispatch
//!      │
//!      └─ recoverable error ─► rebind (same port, else any) ─► new receive loop
//! ```

use crate::node::events::NodeEvent;
use crate::node::node::Node;
use crate::node::state::NodeState;
use crate::packet::Packet;
use driftmesh_transport::{MAX_DATAGRAM_SIZE, Transport, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Which of the node's sockets a peer is reached through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LocalSocket {
    /// Main socket; all regular traffic
    #[default]
    Primary,
    /// Reflection probe socket
    Probe,
    /// Punch pool slot
    Pool(u8),
}

pub(crate) struct PoolSlot {
    transport: Arc<dyn Transport>,
    last_active: u64,
    receiver: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

/// The node's bound sockets
pub(crate) struct Sockets {
    primary: Arc<dyn Transport>,
    probe: Arc<dyn Transport>,
    pool: HashMap<u8, PoolSlot>,
}

impl Sockets {
    pub(crate) fn new(primary: Arc<dyn Transport>, probe: Arc<dyn Transport>) -> Self {
        Self {
            primary,
            probe,
            pool: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, which: LocalSocket) -> Option<Arc<dyn Transport>> {
        match which {
            LocalSocket::Primary => Some(Arc::clone(&self.primary)),
            LocalSocket::Probe => Some(Arc::clone(&self.probe)),
            LocalSocket::Pool(i) => self.pool.get(&i).map(|s| Arc::clone(&s.transport)),
        }
    }

    fn set(&mut self, which: LocalSocket, transport: Arc<dyn Transport>) {
        match which {
            LocalSocket::Primary => self.primary = transport,
            LocalSocket::Probe => self.probe = transport,
            LocalSocket::Pool(i) => {
                if let Some(slot) = self.pool.get_mut(&i) {
                    slot.transport = transport;
                }
            }
        }
    }

    pub(crate) fn local_addr(&self, which: LocalSocket) -> Option<SocketAddr> {
        self.get(which).and_then(|t| t.local_addr().ok())
    }

    pub(crate) fn local_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = [&self.primary, &self.probe]
            .into_iter()
            .chain(self.pool.values().map(|s| &s.transport))
            .filter_map(|t| t.local_addr().ok())
            .collect();
        addrs.dedup();
        addrs
    }

    pub(crate) fn pool_len(&self) -> usize {
        self.pool.len()
    }

    fn free_slot(&self, limit: usize) -> Option<u8> {
        (0..limit.min(crate::node::config::MAX_PUNCH_SOCKETS))
            .filter_map(|i| u8::try_from(i).ok())
            .find(|i| !self.pool.contains_key(i))
    }

    fn touch(&mut self, which: LocalSocket, now: u64) {
        if let LocalSocket::Pool(i) = which {
            if let Some(slot) = self.pool.get_mut(&i) {
                slot.last_active = now;
            }
        }
    }

    fn all(&self) -> Vec<Arc<dyn Transport>> {
        [&self.primary, &self.probe]
            .into_iter()
            .cloned()
            .chain(self.pool.values().map(|s| Arc::clone(&s.transport)))
            .collect()
    }
}

impl Node {
    /// Spawn the receive loop for one socket
    pub(crate) fn spawn_receiver(
        &self,
        transport: Arc<dyn Transport>,
        via: LocalSocket,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            node.receive_loop(transport, via).await;
        })
    }

    async fn receive_loop(&self, transport: Arc<dyn Transport>, via: LocalSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let poll = self.inner.config.timing.recv_poll;

        loop {
            if self.is_closing() || transport.is_closed() {
                break;
            }

            match tokio::time::timeout(poll, transport.recv_from(&mut buf)).await {
                Ok(Ok((size, from))) => {
                    self.handle_datagram(&buf[..size], from, via).await;
                }
                Ok(Err(TransportError::Closed)) => break,
                Ok(Err(e)) if e.is_recoverable() => {
                    tracing::debug!("Receive on {:?} failed ({}), rebinding", via, e);
                    let mut st = self.inner.state.lock().await;
                    if !self.is_closing() {
                        self.rebind(&mut st, via, &transport).await;
                    }
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!("Receive error on {:?}: {}", via, e);
                    self.emit(NodeEvent::Error {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    // Timeout, continue loop
                }
            }
        }

        tracing::trace!("Receive loop for {:?} exited", via);
    }

    /// Replace a failed socket, keeping its port when possible
    pub(crate) async fn rebind(
        &self,
        st: &mut NodeState,
        via: LocalSocket,
        failed: &Arc<dyn Transport>,
    ) {
        let Some(current) = st.sockets.as_ref().and_then(|s| s.get(via)) else {
            return;
        };
        if !Arc::ptr_eq(&current, failed) {
            // Already replaced by another path
            return;
        }

        if let LocalSocket::Pool(index) = via {
            self.release_pool_slot(st, index).await;
            return;
        }

        let port = failed.local_addr().map(|a| a.port()).unwrap_or(0);
        if let Err(e) = failed.close().await {
            tracing::debug!("Error closing failed socket: {}", e);
        }

        let transport = match self.inner.factory.bind(port).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!("Port {} unavailable ({}), binding any port", port, e);
                match self.inner.factory.bind(0).await {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("Failed to rebind {:?} socket: {}", via, e);
                        self.emit(NodeEvent::Error {
                            message: format!("rebind failed: {e}"),
                        });
                        return;
                    }
                }
            }
        };

        tracing::info!(
            "Rebound {:?} socket on {:?}",
            via,
            transport.local_addr().ok()
        );
        let handle = self.spawn_receiver(Arc::clone(&transport), via);
        if let Some(sockets) = st.sockets.as_mut() {
            sockets.set(via, transport);
        }
        st.tasks.push(handle);
    }

    /// Encode and send a packet
    pub(crate) async fn send_packet(
        &self,
        st: &mut NodeState,
        packet: &Packet,
        to: SocketAddr,
        via: LocalSocket,
    ) -> bool {
        match packet.encode() {
            Ok(bytes) => self.send_bytes(st, &bytes, to, via).await,
            Err(e) => {
                tracing::debug!("Failed to encode {:?}: {}", packet.kind(), e);
                false
            }
        }
    }

    async fn send_bytes(
        &self,
        st: &mut NodeState,
        bytes: &[u8],
        to: SocketAddr,
        via: LocalSocket,
    ) -> bool {
        let now = self.now_ms();
        let Some(sockets) = st.sockets.as_mut() else {
            return false;
        };
        let (via, transport) = match sockets.get(via) {
            Some(t) => (via, t),
            None => match sockets.get(LocalSocket::Primary) {
                Some(t) => (LocalSocket::Primary, t),
                None => return false,
            },
        };
        sockets.touch(via, now);

        match transport.send_to(bytes, to).await {
            Ok(_) => true,
            Err(TransportError::Closed) => false,
            Err(e) if e.is_recoverable() => {
                tracing::debug!("Send on {:?} to {} failed ({}), rebinding", via, to, e);
                self.rebind(st, via, &transport).await;
                false
            }
            Err(e) => {
                tracing::warn!("Send on {:?} to {} failed: {}", via, to, e);
                self.emit(NodeEvent::Error {
                    message: e.to_string(),
                });
                false
            }
        }
    }

    /// Open a punch pool socket. Returns `None` when the pool is full or
    /// binding fails.
    pub(crate) async fn open_pool_socket(&self, st: &mut NodeState) -> Option<LocalSocket> {
        let index = st
            .sockets
            .as_ref()?
            .free_slot(self.inner.config.nat.punch_sockets)?;

        let transport = match self.inner.factory.bind(0).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!("Failed to open punch socket: {}", e);
                return None;
            }
        };

        let via = LocalSocket::Pool(index);
        let receiver = self.spawn_receiver(Arc::clone(&transport), via);
        let reaper = self.spawn_pool_reaper(index);
        st.sockets.as_mut()?.pool.insert(
            index,
            PoolSlot {
                transport,
                last_active: self.now_ms(),
                receiver,
                reaper,
            },
        );
        Some(via)
    }

    fn spawn_pool_reaper(&self, index: u8) -> JoinHandle<()> {
        let node = self.clone();
        let idle = self.inner.config.nat.punch_idle_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(idle).await;
                if !node.reap_if_idle(index).await {
                    break;
                }
            }
        })
    }

    /// Returns true while the slot should keep being watched
    async fn reap_if_idle(&self, index: u8) -> bool {
        let mut st = self.inner.state.lock().await;
        if self.is_closing() {
            return false;
        }
        let idle_ms =
            u64::try_from(self.inner.config.nat.punch_idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let Some(last_active) = st
            .sockets
            .as_ref()
            .and_then(|s| s.pool.get(&index))
            .map(|slot| slot.last_active)
        else {
            return false;
        };
        if self.now_ms().saturating_sub(last_active) < idle_ms {
            return true;
        }

        tracing::trace!("Reclaiming idle punch socket {}", index);
        if let Some(slot) = st.sockets.as_mut().and_then(|s| s.pool.remove(&index)) {
            // Dropping the handle detaches this task instead of aborting it
            drop(slot.reaper);
            slot.receiver.abort();
            let _ = slot.transport.close().await;
        }
        Self::fall_back_to_primary(&mut st, index);
        false
    }

    async fn release_pool_slot(&self, st: &mut NodeState, index: u8) {
        if let Some(slot) = st.sockets.as_mut().and_then(|s| s.pool.remove(&index)) {
            slot.reaper.abort();
            // May be called from the slot's own receive loop; closing the
            // transport ends it
            drop(slot.receiver);
            let _ = slot.transport.close().await;
        }
        Self::fall_back_to_primary(st, index);
    }

    fn fall_back_to_primary(st: &mut NodeState, index: u8) {
        for peer in st.peers.values_mut() {
            if peer.socket == LocalSocket::Pool(index) {
                peer.socket = LocalSocket::Primary;
            }
        }
    }

    /// Close every socket and stop every task
    pub(crate) async fn close_sockets(&self, st: &mut NodeState) {
        for task in st.tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = st.reflection_timer.take() {
            timer.abort();
        }
        if let Some(mut sockets) = st.sockets.take() {
            for (_, slot) in sockets.pool.drain() {
                slot.reaper.abort();
                slot.receiver.abort();
            }
            for transport in sockets.all() {
                if let Err(e) = transport.close().await {
                    tracing::debug!("Error closing socket: {}", e);
                }
            }
        }
    }
}
