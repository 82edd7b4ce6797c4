use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// How far a request got before it failed.
///
/// Callers use this to decide whether a retry could duplicate a side effect:
/// a request that failed while `Connecting` was never handed to the remote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Transferring,
    #[default]
    Unknown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Transferring => f.write_str("transferring"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Application-level failure reported by the remote service dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    ServiceNotFound,
    MethodNotFound,
    InvalidArguments,
    ServiceFailure,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceNotFound => f.write_str("service not found"),
            Self::MethodNotFound => f.write_str("method not found"),
            Self::InvalidArguments => f.write_str("invalid arguments"),
            Self::ServiceFailure => f.write_str("service failure"),
        }
    }
}

/// Wire-visible classification of an error carried inside a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ServiceNotFound,
    MethodNotFound,
    InvalidArguments,
    ServiceFailure,
    Protocol,
    ConnectionInitialization,
    Untrusted,
    Rejected,
    Timeout,
    Transport,
    QueueTimeout,
    ProcessingTimeout,
    Cancelled,
    Codec,
    Config,
    Disposed,
}

/// Errors surfaced by every transport operation.
///
/// Payloads are plain strings so the error can be cloned, sent across tasks and
/// carried inside a [`ServerError`](crate::message::ServerError) without loss.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MxError {
    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("connection initialization failed: {message}")]
    ConnectionInitialization { message: String },

    #[error("untrusted certificate: {message}")]
    Untrusted { message: String },

    #[error("connection rejected: {message}")]
    Rejected { message: String },

    #[error("timeout while {state}: {message}")]
    Timeout { message: String, state: ConnectionState },

    #[error("transport error while {state}: {message}")]
    Transport { message: String, state: ConnectionState },

    #[error("queue timeout: {message}")]
    QueueTimeout { message: String },

    #[error("processing timeout: {message}")]
    ProcessingTimeout { message: String },

    #[error("request cancelled while {state}")]
    Cancelled { state: ConnectionState },

    #[error("{kind}: {message}")]
    Remote { kind: RemoteErrorKind, message: String, details: Option<String> },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("runtime disposed")]
    Disposed,
}

impl MxError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn transport(message: impl Into<String>, state: ConnectionState) -> Self {
        Self::Transport { message: message.into(), state }
    }

    pub fn timeout(message: impl Into<String>, state: ConnectionState) -> Self {
        Self::Timeout { message: message.into(), state }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Remote { kind, message: message.into(), details: None }
    }

    /// Classifies an I/O failure, recognising TLS alerts that mean the peer
    /// refused our certificate.
    pub fn from_io(err: io::Error, state: ConnectionState) -> Self {
        if let Some(tls) = err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
            if let Some(untrusted) = Self::from_tls(tls) {
                return untrusted;
            }
        }
        match err.kind() {
            io::ErrorKind::TimedOut => Self::timeout(err.to_string(), state),
            io::ErrorKind::UnexpectedEof => {
                Self::transport("connection closed by the remote peer", state)
            }
            _ => Self::transport(err.to_string(), state),
        }
    }

    fn from_tls(err: &rustls::Error) -> Option<Self> {
        use rustls::AlertDescription;
        match err {
            rustls::Error::InvalidCertificate(cause) => Some(Self::Untrusted {
                message: format!("remote certificate rejected: {:?}", cause),
            }),
            rustls::Error::AlertReceived(
                alert @ (AlertDescription::BadCertificate
                | AlertDescription::CertificateUnknown
                | AlertDescription::AccessDenied
                | AlertDescription::UnknownCA
                | AlertDescription::CertificateRequired),
            ) => Some(Self::Untrusted {
                message: format!("remote peer refused our certificate ({:?})", alert),
            }),
            _ => None,
        }
    }

    /// The message without the variant prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            Self::Protocol { message }
            | Self::ConnectionInitialization { message }
            | Self::Untrusted { message }
            | Self::Rejected { message }
            | Self::Timeout { message, .. }
            | Self::Transport { message, .. }
            | Self::QueueTimeout { message }
            | Self::ProcessingTimeout { message }
            | Self::Remote { message, .. }
            | Self::Codec { message }
            | Self::Config { message } => message.clone(),
            Self::Cancelled { .. } | Self::Disposed => self.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::ConnectionInitialization { .. } => ErrorKind::ConnectionInitialization,
            Self::Untrusted { .. } => ErrorKind::Untrusted,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::ProcessingTimeout { .. } => ErrorKind::ProcessingTimeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Remote { kind, .. } => match kind {
                RemoteErrorKind::ServiceNotFound => ErrorKind::ServiceNotFound,
                RemoteErrorKind::MethodNotFound => ErrorKind::MethodNotFound,
                RemoteErrorKind::InvalidArguments => ErrorKind::InvalidArguments,
                RemoteErrorKind::ServiceFailure => ErrorKind::ServiceFailure,
            },
            Self::Codec { .. } => ErrorKind::Codec,
            Self::Config { .. } => ErrorKind::Config,
            Self::Disposed => ErrorKind::Disposed,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Timeout { state, .. }
            | Self::Transport { state, .. }
            | Self::Cancelled { state } => *state,
            Self::ConnectionInitialization { .. }
            | Self::Untrusted { .. }
            | Self::Rejected { .. }
            | Self::QueueTimeout { .. } => ConnectionState::Connecting,
            Self::ProcessingTimeout { .. } | Self::Remote { .. } => ConnectionState::Transferring,
            Self::Protocol { .. } | Self::Codec { .. } | Self::Config { .. } | Self::Disposed => {
                ConnectionState::Unknown
            }
        }
    }

    /// Re-tags a connection-level error with the phase the caller knows it
    /// happened in. Other variants are returned unchanged.
    pub fn in_state(self, state: ConnectionState) -> Self {
        match self {
            Self::Timeout { message, .. } => Self::Timeout { message, state },
            Self::Transport { message, .. } => Self::Transport { message, state },
            Self::Cancelled { .. } => Self::Cancelled { state },
            other => other,
        }
    }

    /// Returns `true` when the request never reached the remote, so trying
    /// again on a fresh connection cannot duplicate a side effect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionInitialization { .. } => true,
            Self::Transport { state, .. } | Self::Timeout { state, .. } => {
                *state == ConnectionState::Connecting
            }
            _ => false,
        }
    }
}
