//! The process-wide entry point: one identity, one trust store, any number
//! of listeners and polling subscriptions, and an outbound client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::client::SecureListeningClient;
use crate::codec::{DeflateMsgPackCodec, MessageCodec};
use crate::config::MxLimits;
use crate::connection::{ConnectionFactory, ConnectionManager, TcpConnectionFactory};
use crate::endpoint::{normalize_thumbprint, parse_uri, ServiceEndPoint, POLLING_SCHEME};
use crate::error::MxError;
use crate::exchange::SubscriptionQueues;
use crate::listener::{InboundConnections, ListenerHandle, SecureListener};
use crate::message::{RequestMessage, ResponseMessage};
use crate::polling::PollingClient;
use crate::queue::{PendingRequestQueueFactory, QueueRegistry};
use crate::service::{RequestProcessor, ServiceRegistry};
use crate::tls::{server_config, TlsIdentity};
use crate::trust::{BlockUnauthorized, ClientAuthorizer, TrustStore, UnauthorizedClientConnect};

pub struct MxRuntimeBuilder {
    identity: TlsIdentity,
    limits: MxLimits,
    processor: Option<Arc<dyn RequestProcessor>>,
    queue_factory: Option<Arc<dyn PendingRequestQueueFactory>>,
    unauthorized: Arc<dyn UnauthorizedClientConnect>,
    trusted: Vec<String>,
    codec: Option<Arc<dyn MessageCodec>>,
    connection_factory: Option<Arc<dyn ConnectionFactory>>,
}

impl MxRuntimeBuilder {
    pub fn limits(mut self, limits: MxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.processor = Some(Arc::new(services));
        self
    }

    pub fn processor(mut self, processor: Arc<dyn RequestProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn queue_factory(mut self, factory: Arc<dyn PendingRequestQueueFactory>) -> Self {
        self.queue_factory = Some(factory);
        self
    }

    pub fn on_unauthorized_client_connect(
        mut self,
        handler: impl UnauthorizedClientConnect + 'static,
    ) -> Self {
        self.unauthorized = Arc::new(handler);
        self
    }

    pub fn trust(mut self, thumbprint: &str) -> Self {
        self.trusted.push(thumbprint.to_string());
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Replaces TCP+TLS dialing, e.g. with an in-memory transport.
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<MxRuntime, MxError> {
        self.limits.validate()?;
        let limits = Arc::new(self.limits);
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(DeflateMsgPackCodec::new(limits.max_message_size)));
        let factory = self.connection_factory.unwrap_or_else(|| {
            Arc::new(TcpConnectionFactory::new(
                self.identity.clone(),
                limits.clone(),
                codec.clone(),
            ))
        });
        let queues = Arc::new(match self.queue_factory {
            Some(factory) => QueueRegistry::new(factory),
            None => QueueRegistry::in_memory(limits.clone()),
        });
        let trust = Arc::new(TrustStore::with_thumbprints(&self.trusted));
        let authorizer = Arc::new(ClientAuthorizer::new(trust.clone(), self.unauthorized));
        let connections = Arc::new(ConnectionManager::new(factory.clone(), limits.clone()));

        Ok(MxRuntime {
            client: SecureListeningClient::new(connections.clone(), limits.clone()),
            identity: self.identity,
            processor: self.processor.unwrap_or_else(|| Arc::new(ServiceRegistry::new())),
            inbound: InboundConnections::from_limits(&limits),
            limits,
            trust,
            authorizer,
            queues,
            codec,
            factory,
            connections,
            shutdown: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
            pollers: Mutex::new(Vec::new()),
        })
    }
}

/// Hosts services, calls remote ones, and polls listening servers.
pub struct MxRuntime {
    identity: TlsIdentity,
    limits: Arc<MxLimits>,
    trust: Arc<TrustStore>,
    authorizer: Arc<ClientAuthorizer>,
    processor: Arc<dyn RequestProcessor>,
    queues: Arc<QueueRegistry>,
    codec: Arc<dyn MessageCodec>,
    factory: Arc<dyn ConnectionFactory>,
    connections: Arc<ConnectionManager>,
    client: SecureListeningClient,
    inbound: Arc<InboundConnections>,
    shutdown: CancellationToken,
    listeners: Mutex<Vec<ListenerHandle>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl MxRuntime {
    pub fn builder(identity: TlsIdentity) -> MxRuntimeBuilder {
        MxRuntimeBuilder {
            identity,
            limits: MxLimits::default(),
            processor: None,
            queue_factory: None,
            unauthorized: Arc::new(BlockUnauthorized),
            trusted: Vec::new(),
            codec: None,
            connection_factory: None,
        }
    }

    pub fn thumbprint(&self) -> &str {
        self.identity.thumbprint()
    }

    pub fn limits(&self) -> &MxLimits {
        &self.limits
    }

    pub fn inbound_connections(&self) -> &InboundConnections {
        &self.inbound
    }

    /// Starts accepting connections on `addr` and returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, MxError> {
        self.ensure_running()?;
        let acceptor = TlsAcceptor::from(server_config(&self.identity, self.authorizer.clone())?);
        let queues: Arc<dyn SubscriptionQueues> = self.queues.clone();
        let listener = SecureListener::new(
            acceptor,
            self.processor.clone(),
            queues,
            self.codec.clone(),
            self.limits.clone(),
            self.inbound.clone(),
        );
        let handle = listener.bind(addr, self.shutdown.child_token()).await?;
        let local_addr = handle.local_addr();
        self.listeners.lock().unwrap_or_else(|err| err.into_inner()).push(handle);
        Ok(local_addr)
    }

    /// Connects out to `server` as subscriber `subscription` (a `poll://`
    /// address) and serves the requests queued for it there.
    pub fn poll(&self, subscription: &str, server: ServiceEndPoint) -> Result<(), MxError> {
        self.ensure_running()?;
        let subscription = parse_uri(subscription)?;
        if subscription.scheme() != POLLING_SCHEME {
            return Err(MxError::config(format!("{} is not a poll:// address", subscription)));
        }
        if server.is_polling() {
            return Err(MxError::config(format!("cannot poll {}: it is not listening", server)));
        }
        let poller = PollingClient::new(
            subscription,
            server,
            ConnectionManager::new(self.factory.clone(), self.limits.clone()),
            self.processor.clone(),
            self.limits.clone(),
        );
        let task = tokio::spawn(poller.run(self.shutdown.child_token()));
        self.pollers.lock().unwrap_or_else(|err| err.into_inner()).push(task);
        Ok(())
    }

    pub fn trust(&self, thumbprint: &str) -> bool {
        self.trust.add(thumbprint)
    }

    /// Stops trusting `thumbprint` and drops its live inbound connections.
    pub fn remove_trust(&self, thumbprint: &str) -> bool {
        let removed = self.trust.remove(thumbprint);
        self.revoke(&normalize_thumbprint(thumbprint));
        removed
    }

    /// Replaces the trusted set; clients that lost trust are disconnected.
    pub fn trust_only<I, S>(&self, thumbprints: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for revoked in self.trust.trust_only(thumbprints) {
            self.revoke(&revoked);
        }
    }

    pub fn is_trusted(&self, thumbprint: &str) -> bool {
        self.trust.is_trusted(thumbprint)
    }

    fn revoke(&self, thumbprint: &str) {
        let killed = self.inbound.revoke(thumbprint);
        if killed > 0 {
            log::info!("mx_runtime: dropped {} connection(s) from {}", killed, thumbprint);
        }
    }

    /// Delivers `request` to its destination: dialed directly for
    /// `https://`, queued for the subscriber for `poll://`.
    pub async fn send_request(
        &self,
        request: RequestMessage,
        cancel: CancellationToken,
    ) -> Result<ResponseMessage, MxError> {
        self.ensure_running()?;
        if request.destination.is_polling() {
            let queue = self.queues.queue_for(&request.destination.base_uri);
            queue.queue_and_wait(request, cancel).await
        } else {
            self.client.execute_transaction(&request, &cancel).await
        }
    }

    /// Calls `service.method` with `args` (a tuple is spread into the
    /// parameter list) and decodes the result.
    pub async fn invoke<A, R>(
        &self,
        endpoint: &ServiceEndPoint,
        service: &str,
        method: &str,
        args: A,
    ) -> Result<R, MxError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.invoke_with_cancel(endpoint, service, method, args, CancellationToken::new()).await
    }

    pub async fn invoke_with_cancel<A, R>(
        &self,
        endpoint: &ServiceEndPoint,
        service: &str,
        method: &str,
        args: A,
        cancel: CancellationToken,
    ) -> Result<R, MxError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = rmpv::ext::to_value(args).map_err(|err| MxError::codec(err.to_string()))?;
        let params = match args {
            Value::Nil => Vec::new(),
            Value::Array(params) => params,
            single => vec![single],
        };
        let request = RequestMessage::new(endpoint.clone(), service, method, params);
        let result = self.send_request(request, cancel).await?.into_result()?;
        rmpv::ext::from_value(result).map_err(|err| {
            MxError::codec(format!("cannot decode {}.{} result: {}", service, method, err))
        })
    }

    /// Closes pooled connections to `endpoint` and kills in-flight ones.
    pub async fn disconnect(&self, endpoint: &ServiceEndPoint) {
        self.connections.disconnect(endpoint).await;
    }

    /// Stops listeners and pollers, fails queued requests and closes every
    /// connection. Later calls return [`MxError::Disposed`].
    pub async fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        log::info!("mx_runtime: shutting down");
        self.shutdown.cancel();
        self.queues.dispose().await;
        self.connections.dispose().await;

        let listeners =
            std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|err| err.into_inner()));
        for listener in listeners {
            listener.shutdown().await;
        }
        let pollers =
            std::mem::take(&mut *self.pollers.lock().unwrap_or_else(|err| err.into_inner()));
        for poller in pollers {
            let _ = poller.await;
        }
    }

    fn ensure_running(&self) -> Result<(), MxError> {
        if self.shutdown.is_cancelled() {
            return Err(MxError::Disposed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxRuntime")
            .field("identity", &self.identity)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
