//! Bidirectional RPC over mutually authenticated TLS.
//!
//! Either peer may open the TCP connection. A peer that can be reached is
//! *listening* and is called directly; a peer behind a firewall *polls* a
//! listening server, identifies as a subscriber and answers the requests
//! queued for its `poll://` address over its own outbound connection.
//!
//! - [`MxRuntime`]: listen, poll, call and manage trust
//! - [`exchange`]: the control-line protocol and its role state machine
//! - [`queue`]: per-subscription mailboxes drained by pollers
//! - [`connection`] / [`pool`]: outbound connection reuse and expiry
//! - [`tls`] / [`trust`]: thumbprint-based certificate verification

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod listener;
pub mod message;
pub mod polling;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod tls;
pub mod trust;

pub use codec::{DeflateMsgPackCodec, MessageCodec, WireMessage};
pub use config::MxLimits;
pub use endpoint::ServiceEndPoint;
pub use error::{ConnectionState, ErrorKind, MxError, RemoteErrorKind};
pub use message::{RequestMessage, ResponseMessage, ServerError};
pub use queue::{PendingRequestQueue, PendingRequestQueueFactory, QueueRegistry};
pub use runtime::{MxRuntime, MxRuntimeBuilder};
pub use service::{RequestProcessor, ServiceRegistry};
pub use tls::TlsIdentity;
pub use trust::{UnauthorizedClientConnect, UnauthorizedClientDecision};

pub use rmpv::Value;
pub use tokio_util::sync::CancellationToken;
