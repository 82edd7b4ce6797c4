use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::MxLimits;
use crate::connection::{ConnectionManager, SecureConnection};
use crate::error::{ConnectionState, MxError};
use crate::message::{RequestMessage, ResponseMessage};
use crate::retry::RetryPolicy;

/// Sends requests to directly dialable (`https://`) endpoints.
pub struct SecureListeningClient {
    connections: Arc<ConnectionManager>,
    limits: Arc<MxLimits>,
}

impl SecureListeningClient {
    pub fn new(connections: Arc<ConnectionManager>, limits: Arc<MxLimits>) -> Self {
        Self { connections, limits }
    }

    /// Runs one request/response exchange, retrying on a fresh connection
    /// while the request provably never reached the remote.
    pub async fn execute_transaction(
        &self,
        request: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, MxError> {
        let endpoint = &request.destination;
        let policy = RetryPolicy::from_limits(&self.limits.for_endpoint(endpoint));
        let started = Instant::now();
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let err = match self.attempt(request, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if cancel.is_cancelled() || !policy.should_retry(attempts, started, &err) {
                log::warn!(
                    "mx_client: {}.{} to {} failed after {} attempt(s): {}",
                    request.service_name,
                    request.method_name,
                    endpoint,
                    attempts,
                    err
                );
                return Err(err);
            }
            log::debug!(
                "mx_client: attempt {} to {} failed, retrying: {}",
                attempts,
                endpoint,
                err
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(MxError::Cancelled { state: ConnectionState::Connecting });
                }
                _ = tokio::time::sleep(policy.sleep_interval) => {}
            }
        }
    }

    async fn attempt(
        &self,
        request: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, MxError> {
        let endpoint = &request.destination;
        if cancel.is_cancelled() {
            return Err(MxError::Cancelled { state: ConnectionState::Connecting });
        }
        let mut connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(MxError::Cancelled { state: ConnectionState::Connecting });
            }
            connection = self.connections.acquire_connection(endpoint) => connection?,
        };

        let outcome = exchange(&mut connection, request, cancel).await;
        match outcome {
            Ok(response) => {
                self.connections.release_connection(connection).await;
                Ok(response)
            }
            Err(err) => {
                self.connections.dispose_connection(connection);
                if matches!(err, MxError::ConnectionInitialization { .. }) {
                    // One dead pooled connection usually means the rest are too.
                    self.connections.clear_pooled_connections(endpoint).await;
                }
                Err(err)
            }
        }
    }
}

/// Runs one exchange on `connection`. Cancellation is reported as
/// `Connecting` until the request body has started going out.
async fn exchange(
    connection: &mut SecureConnection,
    request: &RequestMessage,
    cancel: &CancellationToken,
) -> Result<ResponseMessage, MxError> {
    let protocol = connection.protocol();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(MxError::Cancelled { state: ConnectionState::Connecting });
        }
        begun = protocol.begin_client_exchange() => begun?,
    }

    let started = AtomicBool::new(false);
    let transfer = async {
        started.store(true, Ordering::SeqCst);
        protocol.transfer_as_client(request).await
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let state = if started.load(Ordering::SeqCst) {
                ConnectionState::Transferring
            } else {
                ConnectionState::Connecting
            };
            Err(MxError::Cancelled { state })
        }
        outcome = transfer => outcome,
    }
}
