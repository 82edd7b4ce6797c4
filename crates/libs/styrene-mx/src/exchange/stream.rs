use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ExchangeIo, RemoteIdentity, RemoteIdentityType, PROTOCOL_VERSION};
use crate::codec::{MessageCodec, WireMessage};
use crate::config::MxLimits;
use crate::endpoint::{parse_uri, POLLING_SCHEME};
use crate::error::{ConnectionState, MxError};

const MAX_CONTROL_LINE: usize = 4096;
// Deflate can grow incompressible bodies slightly.
const FRAME_OVERHEAD: usize = 1024;

const CLIENT: &str = "MX-CLIENT";
const SUBSCRIBER: &str = "MX-SUBSCRIBER";
const SERVER: &str = "MX-SERVER";
const NEXT: &str = "NEXT";
const PROCEED: &str = "PROCEED";
const END: &str = "END";

/// Short timeouts apply to control lines, long ones to bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimeouts {
    pub send: Duration,
    pub receive: Duration,
    pub heartbeat_send: Duration,
    pub heartbeat_receive: Duration,
}

impl StreamTimeouts {
    pub fn from_limits(limits: &MxLimits) -> Self {
        Self {
            send: limits.send_timeout,
            receive: limits.receive_timeout,
            heartbeat_send: limits.heartbeat_send_timeout,
            heartbeat_receive: limits.heartbeat_receive_timeout,
        }
    }
}

/// Reads and writes control lines and framed message bodies.
///
/// Errors come back tagged [`ConnectionState::Unknown`]; the protocol layer
/// knows which phase it is in and re-tags them.
pub struct MessageExchangeStream<S> {
    io: BufStream<S>,
    codec: Arc<dyn MessageCodec>,
    timeouts: StreamTimeouts,
    max_frame_size: usize,
    shutdown: CancellationToken,
}

impl<S: ExchangeIo> MessageExchangeStream<S> {
    pub fn new(
        io: S,
        codec: Arc<dyn MessageCodec>,
        timeouts: StreamTimeouts,
        max_message_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            io: BufStream::new(io),
            codec,
            timeouts,
            max_frame_size: max_message_size.saturating_add(FRAME_OVERHEAD),
            shutdown,
        }
    }

    pub fn timeouts(&self) -> StreamTimeouts {
        self.timeouts
    }

    /// Token that aborts any I/O pending on this stream when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn identify_as_client(&mut self) -> Result<(), MxError> {
        self.write_control(&format!("{} {}", CLIENT, PROTOCOL_VERSION)).await?;
        self.expect_server_identity().await
    }

    pub async fn identify_as_subscriber(&mut self, subscription_id: &Url) -> Result<(), MxError> {
        self.write_control(&format!("{} {} {}", SUBSCRIBER, PROTOCOL_VERSION, subscription_id))
            .await?;
        self.expect_server_identity().await
    }

    pub async fn identify_as_server(&mut self) -> Result<(), MxError> {
        self.write_control(&format!("{} {}", SERVER, PROTOCOL_VERSION)).await
    }

    pub async fn read_remote_identity(&mut self) -> Result<RemoteIdentity, MxError> {
        let line = self.read_control(self.timeouts.heartbeat_receive).await?;
        parse_identity(&line)
    }

    pub async fn send_next(&mut self) -> Result<(), MxError> {
        self.write_control(NEXT).await
    }

    pub async fn send_proceed(&mut self) -> Result<(), MxError> {
        self.write_control(PROCEED).await
    }

    pub async fn send_end(&mut self) -> Result<(), MxError> {
        self.write_control(END).await
    }

    pub async fn expect_proceed(&mut self) -> Result<(), MxError> {
        let line = self.read_control(self.timeouts.heartbeat_receive).await?;
        if line == PROCEED {
            Ok(())
        } else {
            Err(MxError::protocol(format!("expected {} but received {}", PROCEED, line)))
        }
    }

    /// Returns `true` for `NEXT` and `false` for `END`.
    pub async fn expect_next_or_end(&mut self, timeout: Duration) -> Result<bool, MxError> {
        let line = self.read_control(timeout).await?;
        match line.as_str() {
            NEXT => Ok(true),
            END => Ok(false),
            other => Err(MxError::protocol(format!(
                "expected {} or {} but received {}",
                NEXT, END, other
            ))),
        }
    }

    pub async fn send(&mut self, message: &WireMessage) -> Result<(), MxError> {
        let payload = self.codec.encode(message)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| MxError::codec(format!("{} byte frame is too large", payload.len())))?;
        let io = &mut self.io;
        guarded(&self.shutdown, "sending message", self.timeouts.send, async move {
            io.write_all(&len.to_be_bytes()).await?;
            io.write_all(&payload).await?;
            io.flush().await
        })
        .await
    }

    pub async fn receive(&mut self) -> Result<WireMessage, MxError> {
        self.receive_within(self.timeouts.receive).await
    }

    pub async fn receive_within(&mut self, timeout: Duration) -> Result<WireMessage, MxError> {
        let io = &mut self.io;
        let max = self.max_frame_size;
        let payload = guarded(&self.shutdown, "receiving message", timeout, async move {
            let len = io.read_u32().await? as usize;
            if len > max {
                return Ok(Err(len));
            }
            let mut payload = vec![0_u8; len];
            io.read_exact(&mut payload).await?;
            Ok(Ok(payload))
        })
        .await?
        .map_err(|len| {
            MxError::protocol(format!("{} byte frame exceeds the {} byte limit", len, max))
        })?;
        self.codec.decode(&payload)
    }

    /// Best-effort graceful close of the underlying stream.
    pub async fn close(&mut self) {
        let io = &mut self.io;
        let _ = guarded(&self.shutdown, "closing", self.timeouts.heartbeat_send, async move {
            io.flush().await?;
            io.shutdown().await
        })
        .await;
    }

    async fn expect_server_identity(&mut self) -> Result<(), MxError> {
        let identity = self.read_remote_identity().await?;
        match identity.identity_type {
            RemoteIdentityType::Server => Ok(()),
            other => Err(MxError::protocol(format!(
                "expected the remote to identify as a server, but it identified as {:?}",
                other
            ))),
        }
    }

    async fn write_control(&mut self, line: &str) -> Result<(), MxError> {
        let bytes = format!("{}\r\n", line).into_bytes();
        let io = &mut self.io;
        let timeout = self.timeouts.heartbeat_send;
        guarded(&self.shutdown, "writing control message", timeout, async move {
            io.write_all(&bytes).await?;
            io.flush().await
        })
        .await
    }

    async fn read_control(&mut self, timeout: Duration) -> Result<String, MxError> {
        let io = &mut self.io;
        let line = guarded(&self.shutdown, "reading control message", timeout, async move {
            loop {
                let mut line = String::new();
                let read = (&mut *io).take(MAX_CONTROL_LINE as u64).read_line(&mut line).await?;
                if read == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed while waiting for a control message",
                    ));
                }
                if line.trim().is_empty() && line.ends_with('\n') {
                    continue;
                }
                return Ok(line);
            }
        })
        .await?;
        if !line.ends_with('\n') {
            return Err(MxError::protocol("control message was truncated or too long"));
        }
        Ok(line.trim().to_string())
    }
}

async fn guarded<T, F>(
    shutdown: &CancellationToken,
    operation: &str,
    timeout: Duration,
    future: F,
) -> Result<T, MxError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(MxError::transport(
            format!("connection disposed while {}", operation),
            ConnectionState::Unknown,
        )),
        result = tokio::time::timeout(timeout, future) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(MxError::from_io(err, ConnectionState::Unknown)),
            Err(_) => Err(MxError::timeout(
                format!("{} did not complete within {:?}", operation, timeout),
                ConnectionState::Unknown,
            )),
        },
    }
}

fn parse_identity(line: &str) -> Result<RemoteIdentity, MxError> {
    let mut parts = line.split_whitespace();
    let (Some(keyword), Some(version)) = (parts.next(), parts.next()) else {
        return Err(MxError::protocol(format!("unrecognised identity line: {}", line)));
    };
    if version.split('.').next() != PROTOCOL_VERSION.split('.').next() {
        return Err(MxError::protocol(format!("unsupported protocol version {}", version)));
    }
    match keyword {
        CLIENT => Ok(RemoteIdentity::new(RemoteIdentityType::Client)),
        SERVER => Ok(RemoteIdentity::new(RemoteIdentityType::Server)),
        SUBSCRIBER => {
            let raw = parts.next().ok_or_else(|| {
                MxError::protocol("subscriber identified without a subscription id")
            })?;
            let subscription = parse_uri(raw).map_err(|err| MxError::protocol(err.to_string()))?;
            if subscription.scheme() != POLLING_SCHEME {
                return Err(MxError::protocol(format!(
                    "subscription id {} is not a polling address",
                    subscription
                )));
            }
            Ok(RemoteIdentity::subscriber(subscription))
        }
        _ => Err(MxError::protocol(format!("unrecognised identity line: {}", line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeflateMsgPackCodec;
    use crate::endpoint::ServiceEndPoint;
    use crate::error::ErrorKind;
    use crate::message::RequestMessage;
    use tokio::io::{duplex, DuplexStream};

    fn timeouts() -> StreamTimeouts {
        StreamTimeouts {
            send: Duration::from_secs(10),
            receive: Duration::from_secs(10),
            heartbeat_send: Duration::from_secs(1),
            heartbeat_receive: Duration::from_secs(1),
        }
    }

    fn pair() -> (MessageExchangeStream<DuplexStream>, MessageExchangeStream<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let codec: Arc<dyn MessageCodec> = Arc::new(DeflateMsgPackCodec::new(1024 * 1024));
        (
            MessageExchangeStream::new(
                a,
                codec.clone(),
                timeouts(),
                1024 * 1024,
                CancellationToken::new(),
            ),
            MessageExchangeStream::new(b, codec, timeouts(), 1024 * 1024, CancellationToken::new()),
        )
    }

    #[tokio::test]
    async fn client_and_server_identify_and_exchange_bodies() {
        let (mut client, mut server) = pair();

        let server_task = tokio::spawn(async move {
            let identity = server.read_remote_identity().await.expect("identity");
            assert_eq!(identity, RemoteIdentity::new(RemoteIdentityType::Client));
            server.identify_as_server().await.expect("identify");
            let message = server.receive().await.expect("receive");
            server.send(&message).await.expect("echo");
            assert!(server.expect_next_or_end(Duration::from_secs(1)).await.expect("next"));
            server.send_proceed().await.expect("proceed");
            assert!(!server.expect_next_or_end(Duration::from_secs(1)).await.expect("end"));
        });

        client.identify_as_client().await.expect("identify");
        let endpoint = ServiceEndPoint::new("https://localhost:1/", "AA").expect("endpoint");
        let request = WireMessage::Request(RequestMessage::new(endpoint, "Echo", "Ping", vec![]));
        client.send(&request).await.expect("send");
        assert_eq!(client.receive().await.expect("receive"), request);
        client.send_next().await.expect("next");
        client.expect_proceed().await.expect("proceed");
        client.send_end().await.expect("end");

        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn subscriber_identity_carries_the_subscription() {
        let (mut subscriber, mut server) = pair();
        let subscription = parse_uri("poll://worker-7").expect("uri");

        let server_task = tokio::spawn(async move {
            let identity = server.read_remote_identity().await.expect("identity");
            server.identify_as_server().await.expect("identify");
            identity
        });

        subscriber.identify_as_subscriber(&subscription).await.expect("identify");
        let identity = server_task.await.expect("server task");
        assert_eq!(identity.identity_type, RemoteIdentityType::Subscriber);
        assert_eq!(identity.subscription_id.as_ref().map(Url::as_str), Some("poll://worker-7/"));
    }

    #[tokio::test]
    async fn unexpected_control_token_is_a_protocol_error() {
        let (mut a, mut b) = pair();
        a.send_next().await.expect("next");
        let err = b.expect_proceed().await.expect_err("NEXT is not PROCEED");
        assert_eq!(err.kind(), ErrorKind::Protocol);

        a.send_end().await.expect("end");
        let err = b.receive().await.expect_err("END is not a body");
        assert_ne!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn rejects_foreign_identity_lines() {
        assert!(parse_identity("HTTP/1.1 200 OK").is_err());
        assert!(parse_identity("MX-CLIENT 3.0").is_err());
        assert!(parse_identity("MX-SUBSCRIBER 2.0").is_err());
        assert!(parse_identity("MX-SUBSCRIBER 2.0 https://host/").is_err());
        assert_eq!(
            parse_identity("MX-SERVER 2.0").expect("server"),
            RemoteIdentity::new(RemoteIdentityType::Server)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_on_control_messages() {
        let (mut a, _b) = pair();
        let err = a.expect_proceed().await.expect_err("nothing was sent");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn closed_peer_is_a_transport_error() {
        let (mut a, b) = pair();
        drop(b);
        let err = a.expect_next_or_end(Duration::from_secs(1)).await.expect_err("peer closed");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn shutdown_token_aborts_pending_reads() {
        let (mut a, _b) = pair();
        let shutdown = a.shutdown_token();
        let reader = tokio::spawn(async move { a.receive().await });
        shutdown.cancel();
        let err = reader.await.expect("reader task").expect_err("disposed");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_allocation() {
        let (raw, peer) = duplex(1024);
        let codec: Arc<dyn MessageCodec> = Arc::new(DeflateMsgPackCodec::new(16));
        let mut stream =
            MessageExchangeStream::new(peer, codec, timeouts(), 16, CancellationToken::new());
        let mut raw = raw;
        raw.write_all(&(10_000_u32).to_be_bytes()).await.expect("write");
        let err = stream.receive().await.expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
