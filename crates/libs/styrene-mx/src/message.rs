use rmpv::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::ServiceEndPoint;
use crate::error::{ConnectionState, ErrorKind, MxError, RemoteErrorKind};

/// A single remote method invocation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequestMessage {
    /// Correlation id; the response carries the same value.
    pub id: String,
    pub activity_id: Uuid,
    pub destination: ServiceEndPoint,
    pub service_name: String,
    pub method_name: String,
    pub params: Vec<Value>,
}

impl RequestMessage {
    pub fn new(
        destination: ServiceEndPoint,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        let activity_id = Uuid::new_v4();
        Self {
            id: format!("{}::{}", destination.base_uri, Uuid::new_v4()),
            activity_id,
            destination,
            service_name: service_name.into(),
            method_name: method_name.into(),
            params,
        }
    }
}

/// Error carried inside a response, either raised by the remote dispatcher or
/// synthesised locally when the transport failed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServerError {
    pub message: String,
    pub details: Option<String>,
    pub kind: Option<ErrorKind>,
    pub connection_state: ConnectionState,
}

impl From<&MxError> for ServerError {
    fn from(err: &MxError) -> Self {
        let details = match err {
            MxError::Remote { details, .. } => details.clone(),
            _ => None,
        };
        Self {
            message: err.message(),
            details,
            kind: Some(err.kind()),
            connection_state: err.connection_state(),
        }
    }
}

impl From<ServerError> for MxError {
    fn from(err: ServerError) -> Self {
        let ServerError { message, details, kind, connection_state: state } = err;
        match kind {
            None | Some(ErrorKind::ServiceFailure) => {
                MxError::Remote { kind: RemoteErrorKind::ServiceFailure, message, details }
            }
            Some(ErrorKind::ServiceNotFound) => {
                MxError::Remote { kind: RemoteErrorKind::ServiceNotFound, message, details }
            }
            Some(ErrorKind::MethodNotFound) => {
                MxError::Remote { kind: RemoteErrorKind::MethodNotFound, message, details }
            }
            Some(ErrorKind::InvalidArguments) => {
                MxError::Remote { kind: RemoteErrorKind::InvalidArguments, message, details }
            }
            Some(ErrorKind::Protocol) => MxError::Protocol { message },
            Some(ErrorKind::ConnectionInitialization) => {
                MxError::ConnectionInitialization { message }
            }
            Some(ErrorKind::Untrusted) => MxError::Untrusted { message },
            Some(ErrorKind::Rejected) => MxError::Rejected { message },
            Some(ErrorKind::Timeout) => MxError::Timeout { message, state },
            Some(ErrorKind::Transport) => MxError::Transport { message, state },
            Some(ErrorKind::QueueTimeout) => MxError::QueueTimeout { message },
            Some(ErrorKind::ProcessingTimeout) => MxError::ProcessingTimeout { message },
            Some(ErrorKind::Cancelled) => MxError::Cancelled { state },
            Some(ErrorKind::Codec) => MxError::Codec { message },
            Some(ErrorKind::Config) => MxError::Config { message },
            Some(ErrorKind::Disposed) => MxError::Disposed,
        }
    }
}

/// Outcome of a request: exactly one of `result` or `error` is meaningful.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    pub id: String,
    pub result: Option<Value>,
    pub error: Option<ServerError>,
}

impl ResponseMessage {
    pub fn from_result(request: &RequestMessage, result: Value) -> Self {
        Self { id: request.id.clone(), result: Some(result), error: None }
    }

    pub fn from_error(request: &RequestMessage, err: &MxError) -> Self {
        Self::from_server_error(request.id.clone(), ServerError::from(err))
    }

    pub fn from_server_error(id: String, error: ServerError) -> Self {
        Self { id, result: None, error: Some(error) }
    }

    pub fn into_result(self) -> Result<Value, MxError> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or(Value::Nil)),
        }
    }
}
