use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::codec::MessageCodec;
use crate::config::MxLimits;
use crate::error::{ConnectionState, MxError};
use crate::exchange::{
    BoxedIo, MessageExchangeProtocol, MessageExchangeStream, StreamTimeouts, SubscriptionQueues,
};
use crate::service::RequestProcessor;
use crate::trust::thumbprint;

#[derive(Default)]
struct InboundState {
    total: usize,
    by_thumbprint: HashMap<String, HashMap<u64, CancellationToken>>,
}

/// Live inbound connections, capped in total and per client thumbprint.
pub struct InboundConnections {
    max_total: Option<usize>,
    max_per_thumbprint: Option<usize>,
    state: Mutex<InboundState>,
    next_id: AtomicU64,
}

impl InboundConnections {
    pub fn new(max_total: Option<usize>, max_per_thumbprint: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            max_total,
            max_per_thumbprint,
            state: Mutex::new(InboundState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_limits(limits: &MxLimits) -> Arc<Self> {
        Self::new(limits.max_inbound_connections, limits.max_inbound_connections_per_thumbprint)
    }

    fn state(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Claims a slot against the total cap, before the TLS handshake.
    pub fn try_reserve(self: &Arc<Self>) -> Option<InboundReservation> {
        let mut state = self.state();
        if self.max_total.is_some_and(|max| state.total >= max) {
            return None;
        }
        state.total += 1;
        Some(InboundReservation { registry: self.clone() })
    }

    /// Attaches an authenticated peer to its reservation. `kill` is
    /// cancelled if the peer's trust is revoked.
    pub fn register(
        self: &Arc<Self>,
        reservation: InboundReservation,
        thumbprint: &str,
        kill: CancellationToken,
    ) -> Option<InboundGuard> {
        let mut state = self.state();
        let live = state.by_thumbprint.get(thumbprint).map_or(0, HashMap::len);
        if self.max_per_thumbprint.is_some_and(|max| live >= max) {
            drop(state);
            drop(reservation);
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.by_thumbprint.entry(thumbprint.to_string()).or_default().insert(id, kill);
        drop(state);
        Some(InboundGuard {
            registry: self.clone(),
            thumbprint: thumbprint.to_string(),
            id,
            _reservation: reservation,
        })
    }

    pub fn count(&self) -> usize {
        self.state().total
    }

    pub fn count_for(&self, thumbprint: &str) -> usize {
        self.state().by_thumbprint.get(thumbprint).map_or(0, HashMap::len)
    }

    /// Kills every live connection from `thumbprint`; returns how many.
    pub fn revoke(&self, thumbprint: &str) -> usize {
        let state = self.state();
        let Some(connections) = state.by_thumbprint.get(thumbprint) else {
            return 0;
        };
        for kill in connections.values() {
            kill.cancel();
        }
        connections.len()
    }
}

/// A slot counted against the total inbound cap.
pub struct InboundReservation {
    registry: Arc<InboundConnections>,
}

impl Drop for InboundReservation {
    fn drop(&mut self) {
        let mut state = self.registry.state();
        state.total = state.total.saturating_sub(1);
    }
}

/// A registered connection; dropping it frees both slots.
pub struct InboundGuard {
    registry: Arc<InboundConnections>,
    thumbprint: String,
    id: u64,
    _reservation: InboundReservation,
}

impl Drop for InboundGuard {
    fn drop(&mut self) {
        let mut state = self.registry.state();
        if let Some(connections) = state.by_thumbprint.get_mut(&self.thumbprint) {
            connections.remove(&self.id);
            if connections.is_empty() {
                state.by_thumbprint.remove(&self.thumbprint);
            }
        }
    }
}

/// Everything an accepted connection needs to be served.
pub struct SecureListener {
    acceptor: TlsAcceptor,
    processor: Arc<dyn RequestProcessor>,
    queues: Arc<dyn SubscriptionQueues>,
    codec: Arc<dyn MessageCodec>,
    limits: Arc<MxLimits>,
    inbound: Arc<InboundConnections>,
}

impl SecureListener {
    pub fn new(
        acceptor: TlsAcceptor,
        processor: Arc<dyn RequestProcessor>,
        queues: Arc<dyn SubscriptionQueues>,
        codec: Arc<dyn MessageCodec>,
        limits: Arc<MxLimits>,
        inbound: Arc<InboundConnections>,
    ) -> Self {
        Self { acceptor, processor, queues, codec, limits, inbound }
    }

    /// Binds `addr` and serves connections until `stop` is cancelled.
    pub async fn bind(
        self,
        addr: &str,
        stop: CancellationToken,
    ) -> Result<ListenerHandle, MxError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| MxError::config(format!("failed to bind {}: {}", addr, err)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| MxError::config(format!("failed to read bound address: {}", err)))?;
        log::info!("mx_listener: listening on {}", local_addr);

        let task = tokio::spawn(Arc::new(self).accept_loop(listener, stop.clone()));
        Ok(ListenerHandle { local_addr, stop, task })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, stop: CancellationToken) {
        loop {
            let (socket, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("mx_listener: accept failed: {}", err);
                        continue;
                    }
                },
            };
            let Some(reservation) = self.inbound.try_reserve() else {
                log::warn!("mx_listener: refusing {}: inbound connection limit reached", peer);
                continue;
            };
            let listener = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move { listener.serve(socket, peer, reservation, stop).await });
        }
        log::info!("mx_listener: stopped accepting");
    }

    async fn serve(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        reservation: InboundReservation,
        stop: CancellationToken,
    ) {
        let _ = socket.set_nodelay(true);
        let handshake =
            tokio::time::timeout(self.limits.connect_timeout, self.acceptor.accept(socket)).await;
        let tls = match handshake {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => {
                let err = MxError::from_io(err, ConnectionState::Connecting);
                log::debug!("mx_listener: handshake with {} failed: {}", peer, err);
                return;
            }
            Err(_) => {
                log::debug!("mx_listener: handshake with {} timed out", peer);
                return;
            }
        };
        let Some(client) = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|leaf| thumbprint(leaf.as_ref()))
        else {
            log::warn!("mx_listener: {} presented no certificate", peer);
            return;
        };

        let kill = stop.child_token();
        let Some(_guard) = self.inbound.register(reservation, &client, kill.clone()) else {
            log::warn!(
                "mx_listener: refusing {} ({}): per-client connection limit reached",
                peer,
                client
            );
            return;
        };
        log::debug!("mx_listener: accepted {} ({})", peer, client);

        let io: BoxedIo = Box::new(tls);
        let stream = MessageExchangeStream::new(
            io,
            self.codec.clone(),
            StreamTimeouts::from_limits(&self.limits),
            self.limits.max_message_size,
            kill,
        );
        let mut protocol = MessageExchangeProtocol::new(stream, self.limits.clone());
        let served =
            protocol.exchange_as_server(self.processor.clone(), self.queues.as_ref(), &stop).await;
        match served {
            Ok(()) => log::debug!("mx_listener: {} ({}) disconnected", peer, client),
            Err(err) => log::debug!("mx_listener: {} ({}) dropped: {}", peer, client, err),
        }
    }
}

/// A running listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and cancels every connection this listener serves.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_total_and_per_thumbprint_caps() {
        let inbound = InboundConnections::new(Some(2), Some(1));
        let first = inbound.try_reserve().expect("first slot");
        let second = inbound.try_reserve().expect("second slot");
        assert!(inbound.try_reserve().is_none());

        let guard = inbound.register(first, "AA", CancellationToken::new()).expect("register");
        assert!(inbound.register(second, "AA", CancellationToken::new()).is_none());
        // The refused reservation was dropped with it.
        assert_eq!(inbound.count(), 1);
        assert_eq!(inbound.count_for("AA"), 1);

        drop(guard);
        assert_eq!(inbound.count(), 0);
        assert_eq!(inbound.count_for("AA"), 0);
    }

    #[test]
    fn revoke_kills_only_the_named_client() {
        let inbound = InboundConnections::new(None, None);
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let _a = inbound.register(inbound.try_reserve().expect("slot"), "AA", a.clone());
        let _b = inbound.register(inbound.try_reserve().expect("slot"), "BB", b.clone());

        assert_eq!(inbound.revoke("AA"), 1);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(inbound.revoke("CC"), 0);
    }
}
