//! Per-subscription mailboxes drained by polling peers.
//!
//! A caller queues a request and waits; the server side of a subscriber
//! connection dequeues it, pushes it down the wire and applies the response,
//! which resolves the caller. Waiting has two phases with separate timeouts:
//! queued (nobody collected the request yet) and in flight (collected, no
//! response yet). Only the first is safe to retry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::MxLimits;
use crate::error::{ConnectionState, MxError};
use crate::exchange::SubscriptionQueues;
use crate::message::{RequestMessage, ResponseMessage};

#[async_trait]
pub trait PendingRequestQueue: Send + Sync {
    /// Queues `request` and resolves with its response, a timeout or a
    /// cancellation. Cancelling after the request was collected only stops
    /// the local wait; the remote still runs it.
    async fn queue_and_wait(
        &self,
        request: RequestMessage,
        cancel: CancellationToken,
    ) -> Result<ResponseMessage, MxError>;

    /// Pops the oldest request, waiting a bounded time for one to arrive.
    /// `Ok(None)` means nothing arrived (or `cancel` fired) and a keepalive
    /// round should be sent instead.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<RequestMessage>, MxError>;

    /// Resolves the waiter for `response.id`; unknown ids are ignored.
    async fn apply_response(&self, response: ResponseMessage);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fails every outstanding waiter with [`MxError::Disposed`].
    async fn dispose(&self);
}

pub trait PendingRequestQueueFactory: Send + Sync {
    fn create(&self, subscription: &Url) -> Arc<dyn PendingRequestQueue>;
}

type Outcome = Result<ResponseMessage, MxError>;

struct Waiter {
    response: oneshot::Sender<Outcome>,
    dequeued: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<RequestMessage>,
    waiters: HashMap<String, Waiter>,
    disposed: bool,
}

/// Process-local FIFO queue.
pub struct InMemoryPendingRequestQueue {
    subscription: Url,
    limits: Arc<MxLimits>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryPendingRequestQueue {
    pub fn new(subscription: Url, limits: Arc<MxLimits>) -> Self {
        Self {
            subscription,
            limits,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Removes a request that has not been collected yet. Returns `false`
    /// when a poller already took it.
    fn withdraw(&self, id: &str) -> bool {
        let mut state = self.state();
        match state.pending.iter().position(|request| request.id == id) {
            Some(index) => {
                state.pending.remove(index);
                state.waiters.remove(id);
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: &str) {
        self.state().waiters.remove(id);
    }
}

/// Cleans up after a `queue_and_wait` future that is dropped before it
/// resolves: a queued request is withdrawn, a collected one forgotten.
struct AbandonGuard<'a> {
    queue: &'a InMemoryPendingRequestQueue,
    id: String,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.queue.withdraw(&self.id) {
            self.queue.forget(&self.id);
        }
    }
}

#[async_trait]
impl PendingRequestQueue for InMemoryPendingRequestQueue {
    async fn queue_and_wait(
        &self,
        request: RequestMessage,
        cancel: CancellationToken,
    ) -> Result<ResponseMessage, MxError> {
        let limits = self.limits.for_endpoint(&request.destination);
        let id = request.id.clone();
        let (response_tx, mut response_rx) = oneshot::channel();
        let (dequeued_tx, mut dequeued_rx) = oneshot::channel();
        {
            let mut state = self.state();
            if state.disposed {
                return Err(MxError::Disposed);
            }
            state.waiters.insert(
                id.clone(),
                Waiter { response: response_tx, dequeued: Some(dequeued_tx) },
            );
            state.pending.push_back(request);
        }
        self.available.notify_one();
        let _abandon = AbandonGuard { queue: self, id: id.clone() };

        let queued = tokio::time::sleep(limits.polling_request_queue_timeout);
        tokio::pin!(queued);
        loop {
            tokio::select! {
                biased;
                outcome = &mut response_rx => return outcome.unwrap_or(Err(MxError::Disposed)),
                _ = &mut dequeued_rx => break,
                _ = cancel.cancelled() => {
                    if self.withdraw(&id) {
                        return Err(MxError::Cancelled { state: ConnectionState::Connecting });
                    }
                    self.forget(&id);
                    return Err(MxError::Cancelled { state: ConnectionState::Transferring });
                }
                _ = &mut queued => {
                    if self.withdraw(&id) {
                        log::debug!(
                            "mx_queue: {} was not collected from {}",
                            id,
                            self.subscription
                        );
                        return Err(MxError::QueueTimeout {
                            message: format!(
                                "polling endpoint {} did not collect the request within {:?}",
                                self.subscription, limits.polling_request_queue_timeout
                            ),
                        });
                    }
                    // Collected just as the timer fired; wait for the in-flight phase.
                    break;
                }
            }
        }

        let processing = limits.polling_request_maximum_message_processing_timeout;
        tokio::select! {
            biased;
            outcome = &mut response_rx => outcome.unwrap_or(Err(MxError::Disposed)),
            _ = cancel.cancelled() => {
                self.forget(&id);
                Err(MxError::Cancelled { state: ConnectionState::Transferring })
            }
            _ = tokio::time::sleep(processing) => {
                self.forget(&id);
                Err(MxError::ProcessingTimeout {
                    message: format!(
                        "request was collected by {} but no response arrived within {:?}",
                        self.subscription, processing
                    ),
                })
            }
        }
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<RequestMessage>, MxError> {
        let wait = tokio::time::sleep(self.limits.polling_queue_wait_timeout);
        tokio::pin!(wait);
        loop {
            {
                let mut state = self.state();
                if state.disposed {
                    return Err(MxError::Disposed);
                }
                while let Some(request) = state.pending.pop_front() {
                    if let Some(waiter) = state.waiters.get_mut(&request.id) {
                        if let Some(dequeued) = waiter.dequeued.take() {
                            let _ = dequeued.send(());
                        }
                        return Ok(Some(request));
                    }
                }
            }
            tokio::select! {
                _ = self.available.notified() => continue,
                _ = &mut wait => return Ok(None),
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    async fn apply_response(&self, response: ResponseMessage) {
        let waiter = self.state().waiters.remove(&response.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.response.send(Ok(response));
            }
            None => log::debug!(
                "mx_queue: ignoring response for unknown request {} on {}",
                response.id,
                self.subscription
            ),
        }
    }

    async fn len(&self) -> usize {
        self.state().pending.len()
    }

    async fn dispose(&self) {
        let waiters = {
            let mut state = self.state();
            state.disposed = true;
            state.pending.clear();
            std::mem::take(&mut state.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.response.send(Err(MxError::Disposed));
        }
        self.available.notify_waiters();
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueFactory {
    limits: Arc<MxLimits>,
}

impl InMemoryQueueFactory {
    pub fn new(limits: Arc<MxLimits>) -> Self {
        Self { limits }
    }
}

impl PendingRequestQueueFactory for InMemoryQueueFactory {
    fn create(&self, subscription: &Url) -> Arc<dyn PendingRequestQueue> {
        Arc::new(InMemoryPendingRequestQueue::new(subscription.clone(), self.limits.clone()))
    }
}

/// Stands in for every subscription once the registry is disposed.
struct ClosedQueue;

#[async_trait]
impl PendingRequestQueue for ClosedQueue {
    async fn queue_and_wait(
        &self,
        _request: RequestMessage,
        _cancel: CancellationToken,
    ) -> Result<ResponseMessage, MxError> {
        Err(MxError::Disposed)
    }

    async fn dequeue(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Option<RequestMessage>, MxError> {
        Err(MxError::Disposed)
    }

    async fn apply_response(&self, _response: ResponseMessage) {}

    async fn len(&self) -> usize {
        0
    }

    async fn dispose(&self) {}
}

#[derive(Default)]
struct RegistryState {
    queues: HashMap<Url, Arc<dyn PendingRequestQueue>>,
    disposed: bool,
}

/// Lazily creates one queue per subscription address.
pub struct QueueRegistry {
    factory: Arc<dyn PendingRequestQueueFactory>,
    state: Mutex<RegistryState>,
}

impl QueueRegistry {
    pub fn new(factory: Arc<dyn PendingRequestQueueFactory>) -> Self {
        Self { factory, state: Mutex::new(RegistryState::default()) }
    }

    pub fn in_memory(limits: Arc<MxLimits>) -> Self {
        Self::new(Arc::new(InMemoryQueueFactory::new(limits)))
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn subscriptions(&self) -> Vec<Url> {
        self.state().queues.keys().cloned().collect()
    }

    /// Disposes every queue; later lookups get a queue that refuses all work.
    pub async fn dispose(&self) {
        let queues: Vec<_> = {
            let mut state = self.state();
            state.disposed = true;
            state.queues.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            queue.dispose().await;
        }
    }
}

impl SubscriptionQueues for QueueRegistry {
    fn queue_for(&self, subscription: &Url) -> Arc<dyn PendingRequestQueue> {
        let mut state = self.state();
        if state.disposed {
            return Arc::new(ClosedQueue);
        }
        state
            .queues
            .entry(subscription.clone())
            .or_insert_with(|| self.factory.create(subscription))
            .clone()
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry").field("subscriptions", &self.subscriptions()).finish()
    }
}
