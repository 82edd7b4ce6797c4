use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::MxLimits;
use crate::connection::ConnectionManager;
use crate::endpoint::ServiceEndPoint;
use crate::error::MxError;
use crate::retry::PollingBackoff;
use crate::service::RequestProcessor;

/// Keeps a subscriber connection open to a listening server and answers
/// whatever requests it pushes down, reconnecting with backoff.
///
/// Owns its connection manager: a subscriber-identified connection must
/// never be handed to an ordinary client call.
pub struct PollingClient {
    subscription: Url,
    server: ServiceEndPoint,
    connections: ConnectionManager,
    processor: Arc<dyn RequestProcessor>,
    limits: Arc<MxLimits>,
}

impl PollingClient {
    pub fn new(
        subscription: Url,
        server: ServiceEndPoint,
        connections: ConnectionManager,
        processor: Arc<dyn RequestProcessor>,
        limits: Arc<MxLimits>,
    ) -> Self {
        Self { subscription, server, connections, processor, limits }
    }

    /// Polls until `stop` is cancelled.
    pub async fn run(self, stop: CancellationToken) {
        let mut backoff = PollingBackoff::from_limits(&self.limits);
        log::info!("mx_polling: polling {} as {}", self.server, self.subscription);
        while !stop.is_cancelled() {
            let err = match self.poll_once(&stop).await {
                Ok(()) => {
                    backoff.reset();
                    continue;
                }
                Err(err) => err,
            };
            if stop.is_cancelled() {
                break;
            }
            // A connection that got past identification was healthy.
            if !err.is_retryable() && !matches!(err, MxError::Untrusted { .. }) {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            log::warn!("mx_polling: {} failed: {}; reconnecting in {:?}", self.server, err, delay);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.connections.dispose().await;
        log::info!("mx_polling: stopped polling {}", self.server);
    }

    async fn poll_once(&self, stop: &CancellationToken) -> Result<(), MxError> {
        let mut connection = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            connection = self.connections.acquire_connection(&self.server) => connection?,
        };
        let rounds = self.limits.subscriber_rounds_per_connection;
        let outcome = connection
            .protocol()
            .exchange_as_subscriber(&self.subscription, self.processor.clone(), rounds, stop)
            .await;
        match outcome {
            Ok(()) => {
                self.connections.release_connection(connection).await;
                Ok(())
            }
            Err(err) => {
                self.connections.dispose_connection(connection);
                if matches!(err, MxError::ConnectionInitialization { .. }) {
                    self.connections.clear_pooled_connections(&self.server).await;
                }
                Err(err)
            }
        }
    }
}
