use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::codec::MessageCodec;
use crate::config::MxLimits;
use crate::endpoint::ServiceEndPoint;
use crate::error::{ConnectionState, MxError};
use crate::exchange::{BoxedIo, MessageExchangeProtocol, MessageExchangeStream, StreamTimeouts};
use crate::pool::{ConnectionPool, Pooled};
use crate::proxy::connect_via_proxy;
use crate::tls::{client_config, server_name, TlsIdentity};

/// An outbound connection with its protocol state and pooling bookkeeping.
pub struct SecureConnection {
    id: u64,
    endpoint: ServiceEndPoint,
    protocol: MessageExchangeProtocol,
    last_used: Instant,
    uses: u32,
    idle_timeout: Duration,
    max_uses: Option<u32>,
    invalidated: bool,
    kill: CancellationToken,
}

impl SecureConnection {
    pub fn new(
        id: u64,
        endpoint: ServiceEndPoint,
        protocol: MessageExchangeProtocol,
        limits: &MxLimits,
        kill: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            protocol,
            last_used: now,
            uses: 0,
            idle_timeout: limits.pooled_connection_idle_timeout,
            max_uses: limits.pooled_connection_max_uses,
            invalidated: false,
            kill,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &ServiceEndPoint {
        &self.endpoint
    }

    pub fn uses(&self) -> u32 {
        self.uses
    }

    pub fn protocol(&mut self) -> &mut MessageExchangeProtocol {
        &mut self.protocol
    }

    /// Marks the connection so the pool will refuse it.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn kill_switch(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Ends the exchange politely and closes the socket.
    pub async fn close(mut self) {
        if !self.kill.is_cancelled() {
            self.protocol.end().await;
        }
        self.kill.cancel();
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl Pooled for SecureConnection {
    fn has_expired(&self) -> bool {
        self.invalidated
            || self.kill.is_cancelled()
            || self.last_used.elapsed() >= self.idle_timeout
            || self.max_uses.is_some_and(|max| self.uses >= max)
    }

    fn notify_used(&mut self) {
        self.uses = self.uses.saturating_add(1);
        self.touch();
    }
}

impl std::fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("uses", &self.uses)
            .field("invalidated", &self.invalidated)
            .finish_non_exhaustive()
    }
}

/// Dials an endpoint and returns an unidentified protocol bound to the new
/// connection. `kill` aborts the dial and, later, any I/O on the connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn establish(
        &self,
        endpoint: &ServiceEndPoint,
        kill: CancellationToken,
    ) -> Result<MessageExchangeProtocol, MxError>;
}

/// TCP (optionally through an HTTP proxy) plus mutual TLS.
pub struct TcpConnectionFactory {
    identity: TlsIdentity,
    limits: Arc<MxLimits>,
    codec: Arc<dyn MessageCodec>,
}

impl TcpConnectionFactory {
    pub fn new(identity: TlsIdentity, limits: Arc<MxLimits>, codec: Arc<dyn MessageCodec>) -> Self {
        Self { identity, limits, codec }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn establish(
        &self,
        endpoint: &ServiceEndPoint,
        kill: CancellationToken,
    ) -> Result<MessageExchangeProtocol, MxError> {
        let limits = self.limits.for_endpoint(endpoint);
        let (host, port) = endpoint.host_and_port()?;
        let config = client_config(&self.identity, &endpoint.remote_thumbprint)?;
        let connector = TlsConnector::from(config);
        let name = server_name(&host)?;

        let dial = async {
            let tcp = match endpoint.proxy.as_deref() {
                Some(proxy) => connect_via_proxy(proxy, &host, port).await?,
                None => TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|err| MxError::from_io(err, ConnectionState::Connecting))?,
            };
            let _ = tcp.set_nodelay(true);
            let tls = connector
                .connect(name, tcp)
                .await
                .map_err(|err| MxError::from_io(err, ConnectionState::Connecting))?;
            Ok::<_, MxError>(tls)
        };

        let tls = tokio::select! {
            _ = kill.cancelled() => {
                return Err(MxError::transport(
                    "connection disposed while dialing",
                    ConnectionState::Connecting,
                ));
            }
            dialed = tokio::time::timeout(limits.connect_timeout, dial) => dialed.map_err(|_| {
                MxError::timeout(
                    format!(
                        "could not connect to {} within {:?}",
                        endpoint, limits.connect_timeout
                    ),
                    ConnectionState::Connecting,
                )
            })??,
        };
        log::debug!("mx_client: connected to {}", endpoint);

        let io: BoxedIo = Box::new(tls);
        let stream = MessageExchangeStream::new(
            io,
            self.codec.clone(),
            StreamTimeouts::from_limits(&limits),
            limits.max_message_size,
            kill,
        );
        Ok(MessageExchangeProtocol::new(stream, Arc::new(limits)))
    }
}

/// Pooled outbound connections plus kill switches for the ones checked out.
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    limits: Arc<MxLimits>,
    pool: ConnectionPool<ServiceEndPoint, SecureConnection>,
    active: Mutex<HashMap<ServiceEndPoint, HashMap<u64, CancellationToken>>>,
    next_id: AtomicU64,
    disposed: CancellationToken,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>, limits: Arc<MxLimits>) -> Self {
        let pool = ConnectionPool::new(limits.pool_max_idle_per_endpoint);
        Self {
            factory,
            limits,
            pool,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            disposed: CancellationToken::new(),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<ServiceEndPoint, HashMap<u64, CancellationToken>>> {
        self.active.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// A live pooled connection for `endpoint`, or a freshly dialed one.
    pub async fn acquire_connection(
        &self,
        endpoint: &ServiceEndPoint,
    ) -> Result<SecureConnection, MxError> {
        if self.disposed.is_cancelled() {
            return Err(MxError::Disposed);
        }
        let (pooled, expired) = self.pool.take(endpoint);
        for connection in expired {
            log::trace!(
                "mx_client: closing expired connection {} to {}",
                connection.id(),
                endpoint
            );
            connection.close().await;
        }

        let connection = match pooled {
            Some(connection) => connection,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let kill = self.disposed.child_token();
                let protocol = self.factory.establish(endpoint, kill.clone()).await?;
                let limits = self.limits.for_endpoint(endpoint);
                let mut connection =
                    SecureConnection::new(id, endpoint.clone(), protocol, &limits, kill);
                connection.notify_used();
                connection
            }
        };
        self.active()
            .entry(endpoint.clone())
            .or_default()
            .insert(connection.id(), connection.kill_switch());
        Ok(connection)
    }

    /// Returns a healthy connection to the pool.
    pub async fn release_connection(&self, mut connection: SecureConnection) {
        self.untrack(&connection);
        if self.disposed.is_cancelled() {
            connection.close().await;
            return;
        }
        connection.touch();
        let endpoint = connection.endpoint().clone();
        if let Some(rejected) = self.pool.return_connection(endpoint, connection) {
            rejected.close().await;
        }
    }

    /// Drops a connection that failed mid-use without talking to the peer.
    pub fn dispose_connection(&self, connection: SecureConnection) {
        self.untrack(&connection);
        connection.kill.cancel();
    }

    pub async fn clear_pooled_connections(&self, endpoint: &ServiceEndPoint) {
        for connection in self.pool.clear(endpoint) {
            connection.close().await;
        }
    }

    /// Closes pooled connections and kills the checked-out ones.
    pub async fn disconnect(&self, endpoint: &ServiceEndPoint) {
        self.clear_pooled_connections(endpoint).await;
        let active = self.active().remove(endpoint).unwrap_or_default();
        for kill in active.into_values() {
            kill.cancel();
        }
    }

    pub async fn dispose(&self) {
        for connection in self.pool.dispose() {
            connection.close().await;
        }
        self.disposed.cancel();
        self.active().clear();
    }

    pub fn active_count(&self, endpoint: &ServiceEndPoint) -> usize {
        self.active().get(endpoint).map_or(0, HashMap::len)
    }

    pub fn pooled_count(&self, endpoint: &ServiceEndPoint) -> usize {
        self.pool.count(endpoint)
    }

    fn untrack(&self, connection: &SecureConnection) {
        let mut active = self.active();
        if let Some(connections) = active.get_mut(connection.endpoint()) {
            connections.remove(&connection.id());
            if connections.is_empty() {
                active.remove(connection.endpoint());
            }
        }
    }
}
