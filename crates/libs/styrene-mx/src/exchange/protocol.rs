use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BoxedIo, ExchangeIo, MessageExchangeStream, RemoteIdentityType};
use crate::codec::WireMessage;
use crate::config::MxLimits;
use crate::error::{ConnectionState, ErrorKind, MxError};
use crate::message::{RequestMessage, ResponseMessage, ServerError};
use crate::queue::PendingRequestQueue;
use crate::service::RequestProcessor;

/// Resolves the pending request queue behind a subscription address.
pub trait SubscriptionQueues: Send + Sync {
    fn queue_for(&self, subscription: &Url) -> Arc<dyn PendingRequestQueue>;
}

/// Role state machine bound to one physical connection.
///
/// The dialing side identifies once; every later exchange on the same
/// connection starts with `NEXT`/`PROCEED`, which doubles as a liveness check
/// of a pooled connection.
pub struct MessageExchangeProtocol<S = BoxedIo> {
    stream: MessageExchangeStream<S>,
    limits: Arc<MxLimits>,
    identified: bool,
}

impl<S: ExchangeIo> MessageExchangeProtocol<S> {
    pub fn new(stream: MessageExchangeStream<S>, limits: Arc<MxLimits>) -> Self {
        Self { stream, limits, identified: false }
    }

    /// Sends one request and waits for its response.
    ///
    /// Failures before the request body is written are reported as
    /// [`MxError::ConnectionInitialization`] (or `Untrusted`); later failures
    /// are tagged [`ConnectionState::Transferring`].
    pub async fn exchange_as_client(
        &mut self,
        request: &RequestMessage,
    ) -> Result<ResponseMessage, MxError> {
        self.begin_client_exchange().await?;
        self.transfer_as_client(request).await
    }

    /// Identifies the connection, or resumes it with `NEXT`/`PROCEED` if it
    /// was identified by an earlier exchange. Nothing of a request is sent.
    pub async fn begin_client_exchange(&mut self) -> Result<(), MxError> {
        self.prepare_client_exchange().await.map_err(initialization_failure)
    }

    /// Writes the request body and reads its response. Only valid right
    /// after [`Self::begin_client_exchange`].
    pub async fn transfer_as_client(
        &mut self,
        request: &RequestMessage,
    ) -> Result<ResponseMessage, MxError> {
        let transferring = |err: MxError| err.in_state(ConnectionState::Transferring);
        self.stream.send(&WireMessage::Request(request.clone())).await.map_err(transferring)?;
        match self.stream.receive().await.map_err(transferring)? {
            WireMessage::Response(response) if response.id == request.id => Ok(response),
            WireMessage::Response(response) => Err(MxError::protocol(format!(
                "received response {} while waiting for {}",
                response.id, request.id
            ))),
            other => Err(MxError::protocol(format!(
                "expected a response but received a {} body",
                other.describe()
            ))),
        }
    }

    /// Serves whatever role the dialing peer announces until it sends `END`,
    /// goes quiet, or `stop` is cancelled.
    pub async fn exchange_as_server(
        &mut self,
        processor: Arc<dyn RequestProcessor>,
        queues: &dyn SubscriptionQueues,
        stop: &CancellationToken,
    ) -> Result<(), MxError> {
        let identity = self.stream.read_remote_identity().await?;
        self.stream.identify_as_server().await?;
        self.identified = true;

        match (identity.identity_type, identity.subscription_id) {
            (RemoteIdentityType::Client, _) => self.serve_client(processor, stop).await,
            (RemoteIdentityType::Subscriber, Some(subscription)) => {
                log::debug!("mx_exchange: serving subscriber {}", subscription);
                let queue = queues.queue_for(&subscription);
                self.serve_subscriber(queue.as_ref(), stop).await
            }
            (RemoteIdentityType::Subscriber, None) => {
                Err(MxError::protocol("subscriber identified without a subscription id"))
            }
            (RemoteIdentityType::Server, _) => {
                Err(MxError::protocol("dialing peer identified itself as a server"))
            }
        }
    }

    /// Runs subscriber rounds: take a request (or a keepalive) from the
    /// server, answer it, then ask to go again.
    ///
    /// Returns once `rounds` rounds have completed or `stop` is cancelled
    /// between rounds; the connection is then ready to be pooled and resumed
    /// with another call.
    pub async fn exchange_as_subscriber(
        &mut self,
        subscription: &Url,
        processor: Arc<dyn RequestProcessor>,
        rounds: Option<u32>,
        stop: &CancellationToken,
    ) -> Result<(), MxError> {
        if self.identified {
            self.resume().await.map_err(initialization_failure)?;
        } else {
            self.stream
                .identify_as_subscriber(subscription)
                .await
                .map_err(initialization_failure)?;
            self.identified = true;
        }

        let wait = self.limits.subscriber_request_receive_timeout();
        let mut completed = 0_u32;
        loop {
            let message = tokio::select! {
                _ = stop.cancelled() => {
                    return Err(MxError::Cancelled { state: ConnectionState::Unknown });
                }
                message = self.stream.receive_within(wait) => message?,
            };
            match message {
                WireMessage::Request(request) => {
                    log::trace!(
                        "mx_exchange: {} received {}.{}",
                        subscription,
                        request.service_name,
                        request.method_name
                    );
                    let response = process(processor.clone(), request).await;
                    self.send_response(response).await?;
                }
                WireMessage::Empty => {}
                WireMessage::Response(_) => {
                    return Err(MxError::protocol("server pushed a response to a subscriber"));
                }
            }

            completed = completed.saturating_add(1);
            if stop.is_cancelled() || rounds.is_some_and(|limit| completed >= limit) {
                return Ok(());
            }
            self.resume().await?;
        }
    }

    /// Sends `END` if the connection was identified, then closes it.
    pub async fn end(&mut self) {
        if self.identified {
            let _ = self.stream.send_end().await;
        }
        self.stream.close().await;
    }

    async fn prepare_client_exchange(&mut self) -> Result<(), MxError> {
        if self.identified {
            return self.resume().await;
        }
        self.stream.identify_as_client().await?;
        self.identified = true;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), MxError> {
        self.stream.send_next().await?;
        self.stream.expect_proceed().await
    }

    async fn serve_client(
        &mut self,
        processor: Arc<dyn RequestProcessor>,
        stop: &CancellationToken,
    ) -> Result<(), MxError> {
        let idle = self.limits.pooled_connection_idle_timeout;
        loop {
            let request = match self.stream.receive().await? {
                WireMessage::Request(request) => request,
                other => {
                    return Err(MxError::protocol(format!(
                        "expected a request but received a {} body",
                        other.describe()
                    )))
                }
            };
            let response = process(processor.clone(), request).await;
            self.send_response(response).await?;

            let next = tokio::select! {
                _ = stop.cancelled() => false,
                next = self.stream.expect_next_or_end(idle) => match next {
                    Ok(next) => next,
                    Err(MxError::Timeout { .. }) => {
                        log::debug!("mx_exchange: client idle for {:?}, closing", idle);
                        false
                    }
                    Err(err) => return Err(err),
                },
            };
            if !next || stop.is_cancelled() {
                return Ok(());
            }
            self.stream.send_proceed().await?;
        }
    }

    async fn serve_subscriber(
        &mut self,
        queue: &dyn PendingRequestQueue,
        stop: &CancellationToken,
    ) -> Result<(), MxError> {
        let heartbeat = self.stream.timeouts().heartbeat_receive;
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }
            match queue.dequeue(stop).await? {
                Some(request) => {
                    let id = request.id.clone();
                    match self.push_request(request).await {
                        Ok(response) => queue.apply_response(response).await,
                        Err(err) => {
                            let err = err.in_state(ConnectionState::Transferring);
                            queue
                                .apply_response(ResponseMessage::from_server_error(
                                    id,
                                    ServerError::from(&err),
                                ))
                                .await;
                            return Err(err);
                        }
                    }
                }
                None if stop.is_cancelled() => return Ok(()),
                None => self.stream.send(&WireMessage::Empty).await?,
            }

            if !self.stream.expect_next_or_end(heartbeat).await? {
                return Ok(());
            }
            self.stream.send_proceed().await?;
        }
    }

    /// Sends a processor's response; one that cannot be encoded is replaced
    /// by a service failure for the same request.
    async fn send_response(&mut self, response: ResponseMessage) -> Result<(), MxError> {
        let id = response.id.clone();
        match self.stream.send(&WireMessage::Response(response)).await {
            Err(MxError::Codec { message }) => {
                log::warn!("mx_exchange: response to {} could not be encoded: {}", id, message);
                let failure =
                    service_failure(id, format!("response could not be encoded: {}", message));
                self.stream.send(&WireMessage::Response(failure)).await
            }
            sent => sent,
        }
    }

    async fn push_request(&mut self, request: RequestMessage) -> Result<ResponseMessage, MxError> {
        let id = request.id.clone();
        self.stream.send(&WireMessage::Request(request)).await?;
        match self.stream.receive().await? {
            WireMessage::Response(response) if response.id == id => Ok(response),
            WireMessage::Response(response) => Err(MxError::protocol(format!(
                "subscriber answered {} while {} was in flight",
                response.id, id
            ))),
            other => Err(MxError::protocol(format!(
                "expected a response from the subscriber but received a {} body",
                other.describe()
            ))),
        }
    }
}

fn initialization_failure(err: MxError) -> MxError {
    match err {
        MxError::Untrusted { .. } | MxError::ConnectionInitialization { .. } => err,
        other => MxError::ConnectionInitialization { message: other.to_string() },
    }
}

/// Runs the processor on its own task so a panicking handler produces an
/// error response instead of tearing down the connection.
async fn process(processor: Arc<dyn RequestProcessor>, request: RequestMessage) -> ResponseMessage {
    let id = request.id.clone();
    match tokio::spawn(async move { processor.process(request).await }).await {
        Ok(response) => response,
        Err(err) => {
            log::warn!("mx_exchange: request processor failed for {}: {}", id, err);
            service_failure(id, format!("request processor failed: {}", err))
        }
    }
}

fn service_failure(id: String, message: String) -> ResponseMessage {
    ResponseMessage::from_server_error(
        id,
        ServerError {
            message,
            details: None,
            kind: Some(ErrorKind::ServiceFailure),
            connection_state: ConnectionState::Transferring,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rmpv::Value;
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::codec::{DeflateMsgPackCodec, MessageCodec};
    use crate::endpoint::{parse_uri, ServiceEndPoint};
    use crate::error::RemoteErrorKind;
    use crate::exchange::StreamTimeouts;
    use crate::queue::QueueRegistry;

    struct Adder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestProcessor for Adder {
        async fn process(&self, request: RequestMessage) -> ResponseMessage {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.method_name == "Panic" {
                panic!("handler blew up");
            }
            if request.method_name == "Huge" {
                return ResponseMessage::from_result(&request, Value::from("x".repeat(8192)));
            }
            let sum: i64 = request.params.iter().filter_map(Value::as_i64).sum();
            ResponseMessage::from_result(&request, Value::from(sum))
        }
    }

    fn limits() -> Arc<MxLimits> {
        Arc::new(MxLimits {
            heartbeat_receive_timeout: Duration::from_secs(2),
            polling_queue_wait_timeout: Duration::from_millis(50),
            pooled_connection_idle_timeout: Duration::from_secs(2),
            ..MxLimits::default()
        })
    }

    type Pair = (MessageExchangeProtocol<DuplexStream>, MessageExchangeProtocol<DuplexStream>);

    fn protocol_pair() -> Pair {
        protocol_pair_limited(1 << 20)
    }

    fn protocol_pair_limited(max_message_size: usize) -> Pair {
        let limits = limits();
        let (a, b) = duplex(64 * 1024);
        let codec: Arc<dyn MessageCodec> = Arc::new(DeflateMsgPackCodec::new(max_message_size));
        let timeouts = StreamTimeouts::from_limits(&limits);
        let stream = |io| {
            let max = max_message_size;
            MessageExchangeStream::new(io, codec.clone(), timeouts, max, CancellationToken::new())
        };
        (
            MessageExchangeProtocol::new(stream(a), limits.clone()),
            MessageExchangeProtocol::new(stream(b), limits),
        )
    }

    fn add(endpoint: &str, a: i64, b: i64) -> RequestMessage {
        let endpoint = ServiceEndPoint::new(endpoint, "AA").expect("endpoint");
        RequestMessage::new(endpoint, "Calculator", "Add", vec![Value::from(a), Value::from(b)])
    }

    #[tokio::test]
    async fn client_reuses_one_connection_for_several_requests() {
        let (mut client, mut server) = protocol_pair();
        let processor = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let queues = QueueRegistry::in_memory(limits());
        let stop = CancellationToken::new();

        let server_processor: Arc<dyn RequestProcessor> = processor.clone();
        let server_task = tokio::spawn(async move {
            server.exchange_as_server(server_processor, &queues, &stop).await
        });

        for (a, b) in [(12, 18), (1, 2), (40, 2)] {
            let request = add("https://localhost:1/", a, b);
            let response = client.exchange_as_client(&request).await.expect("exchange");
            assert_eq!(response.into_result(), Ok(Value::from(a + b)));
        }
        client.end().await;

        server_task.await.expect("server task").expect("server exchange");
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_processor_becomes_a_service_failure() {
        let (mut client, mut server) = protocol_pair();
        let queues = QueueRegistry::in_memory(limits());
        let stop = CancellationToken::new();
        let processor: Arc<dyn RequestProcessor> = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let server_task =
            tokio::spawn(async move { server.exchange_as_server(processor, &queues, &stop).await });

        let mut request = add("https://localhost:1/", 1, 1);
        request.method_name = "Panic".into();
        let err = client
            .exchange_as_client(&request)
            .await
            .expect("connection survives")
            .into_result()
            .expect_err("handler panicked");
        assert!(matches!(err, MxError::Remote { kind: RemoteErrorKind::ServiceFailure, .. }));

        let request = add("https://localhost:1/", 2, 3);
        let response = client.exchange_as_client(&request).await.expect("exchange");
        assert_eq!(response.into_result(), Ok(Value::from(5)));
        client.end().await;
        server_task.await.expect("server task").expect("server exchange");
    }

    #[tokio::test]
    async fn oversized_response_becomes_a_service_failure() {
        let (mut client, mut server) = protocol_pair_limited(1024);
        let queues = QueueRegistry::in_memory(limits());
        let stop = CancellationToken::new();
        let processor: Arc<dyn RequestProcessor> = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let server_task =
            tokio::spawn(async move { server.exchange_as_server(processor, &queues, &stop).await });

        let mut request = add("https://localhost:1/", 0, 0);
        request.method_name = "Huge".into();
        let err = client
            .exchange_as_client(&request)
            .await
            .expect("connection survives")
            .into_result()
            .expect_err("response too large");
        assert!(matches!(err, MxError::Remote { kind: RemoteErrorKind::ServiceFailure, .. }));

        let response = client.exchange_as_client(&add("https://localhost:1/", 4, 5)).await;
        assert_eq!(response.expect("exchange").into_result(), Ok(Value::from(9)));
        client.end().await;
        server_task.await.expect("server task").expect("server exchange");
    }

    #[tokio::test]
    async fn subscriber_reports_an_oversized_response_as_a_service_failure() {
        let (mut subscriber, mut server) = protocol_pair_limited(1024);
        let queues = Arc::new(QueueRegistry::in_memory(limits()));
        let subscription = parse_uri("poll://worker").expect("uri");
        let stop = CancellationToken::new();

        let server_queues = queues.clone();
        let server_stop = stop.clone();
        let noop: Arc<dyn RequestProcessor> = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let server_task = tokio::spawn(async move {
            server.exchange_as_server(noop, server_queues.as_ref(), &server_stop).await
        });

        let queue = queues.queue_for(&subscription);
        let mut request = add("poll://worker", 0, 0);
        request.method_name = "Huge".into();
        let caller = tokio::spawn(async move {
            queue.queue_and_wait(request, CancellationToken::new()).await
        });

        let processor: Arc<dyn RequestProcessor> = Arc::new(Adder { calls: AtomicUsize::new(0) });
        subscriber
            .exchange_as_subscriber(&subscription, processor, Some(6), &stop)
            .await
            .expect("subscriber keeps its connection");

        let err = caller
            .await
            .expect("caller task")
            .expect("response")
            .into_result()
            .expect_err("response too large");
        assert!(matches!(err, MxError::Remote { kind: RemoteErrorKind::ServiceFailure, .. }));

        subscriber.end().await;
        server_task.await.expect("server task").expect("server exchange");
    }

    #[tokio::test]
    async fn subscriber_drains_the_queue_through_the_server() {
        let (mut subscriber, mut server) = protocol_pair();
        let queues = Arc::new(QueueRegistry::in_memory(limits()));
        let subscription = parse_uri("poll://worker").expect("uri");
        let stop = CancellationToken::new();

        let server_queues = queues.clone();
        let server_stop = stop.clone();
        let noop: Arc<dyn RequestProcessor> = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let server_task = tokio::spawn(async move {
            server.exchange_as_server(noop, server_queues.as_ref(), &server_stop).await
        });

        let queue = queues.queue_for(&subscription);
        let caller = tokio::spawn(async move {
            queue
                .queue_and_wait(add("poll://worker", 20, 22), CancellationToken::new())
                .await
        });

        let worker = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let processor: Arc<dyn RequestProcessor> = worker.clone();
        // Enough rounds to see keepalives as well as the queued request.
        subscriber
            .exchange_as_subscriber(&subscription, processor, Some(6), &stop)
            .await
            .expect("subscriber rounds");

        let response = caller.await.expect("caller task").expect("response");
        assert_eq!(response.into_result(), Ok(Value::from(42)));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

        subscriber.end().await;
        server_task.await.expect("server task").expect("server exchange");
    }

    #[tokio::test]
    async fn lost_subscriber_fails_the_request_in_flight() {
        let (mut subscriber, mut server) = protocol_pair();
        let queues = Arc::new(QueueRegistry::in_memory(limits()));
        let subscription = parse_uri("poll://worker").expect("uri");
        let queue = queues.queue_for(&subscription);
        let caller = tokio::spawn(async move {
            queue
                .queue_and_wait(add("poll://worker", 1, 2), CancellationToken::new())
                .await
        });

        let stop = CancellationToken::new();
        let noop: Arc<dyn RequestProcessor> = Arc::new(Adder { calls: AtomicUsize::new(0) });
        let server_task = tokio::spawn(async move {
            server.exchange_as_server(noop, queues.as_ref(), &stop).await
        });

        subscriber.stream.identify_as_subscriber(&subscription).await.expect("identify");
        loop {
            match subscriber.stream.receive().await.expect("body") {
                WireMessage::Request(_) => break,
                WireMessage::Empty => {
                    subscriber.stream.send_next().await.expect("next");
                    subscriber.stream.expect_proceed().await.expect("proceed");
                }
                WireMessage::Response(_) => panic!("server pushed a response"),
            }
        }
        drop(subscriber);

        let err = server_task.await.expect("server task").expect_err("subscriber vanished");
        assert_eq!(err.connection_state(), ConnectionState::Transferring);

        let err = caller
            .await
            .expect("caller task")
            .expect("queue resolved the waiter")
            .into_result()
            .expect_err("request failed");
        assert_eq!(err.connection_state(), ConnectionState::Transferring);
    }
}
