//! Control vocabulary and role state machine of the message exchange.
//!
//! A connection starts with one identity line from the dialing side
//! (`MX-CLIENT` or `MX-SUBSCRIBER`) answered by `MX-SERVER`. Bodies are then
//! exchanged, separated by `NEXT`/`PROCEED` when the connection is reused and
//! closed by `END`.

mod protocol;
mod stream;

use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

pub use protocol::{MessageExchangeProtocol, SubscriptionQueues};
pub use stream::{MessageExchangeStream, StreamTimeouts};

pub const PROTOCOL_VERSION: &str = "2.0";

/// Any duplex byte stream a message exchange can run over.
pub trait ExchangeIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ExchangeIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedIo = Box<dyn ExchangeIo>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteIdentityType {
    Client,
    Subscriber,
    Server,
}

/// Role announced by the peer on the first control line of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub identity_type: RemoteIdentityType,
    pub subscription_id: Option<Url>,
}

impl RemoteIdentity {
    pub fn new(identity_type: RemoteIdentityType) -> Self {
        Self { identity_type, subscription_id: None }
    }

    pub fn subscriber(subscription_id: Url) -> Self {
        Self {
            identity_type: RemoteIdentityType::Subscriber,
            subscription_id: Some(subscription_id),
        }
    }
}
