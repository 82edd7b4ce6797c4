use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MxError, RemoteErrorKind};
use crate::message::{RequestMessage, ResponseMessage, ServerError};

/// Executes inbound requests. Failures are reported inside the response.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, request: RequestMessage) -> ResponseMessage;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, MxError>> + Send>>;
type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// `(service, method) -> handler` table.
///
/// Handlers take their arguments as one deserializable value, usually a
/// tuple: `params` `[12, 18]` decode into `(i64, i64)` and an empty
/// parameter list decodes into `()`.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    handlers: HashMap<String, HashMap<String, Handler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A, R, F, Fut>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |params: Vec<Value>| -> HandlerFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let args = decode_args::<A>(params)?;
                let result = handler(args).await?;
                rmpv::ext::to_value(result).map_err(|err| {
                    MxError::remote(
                        RemoteErrorKind::ServiceFailure,
                        format!("failed to encode result: {}", err),
                    )
                })
            })
        });
        self.handlers.entry(service.to_string()).or_default().insert(method.to_string(), erased);
        self
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }

    pub fn methods(&self, service: &str) -> Vec<String> {
        let mut methods: Vec<_> = self
            .handlers
            .get(service)
            .map(|methods| methods.keys().cloned().collect())
            .unwrap_or_default();
        methods.sort();
        methods
    }

    fn resolve(&self, service: &str, method: &str) -> Result<Handler, MxError> {
        let methods = self.handlers.get(service).ok_or_else(|| {
            MxError::remote(
                RemoteErrorKind::ServiceNotFound,
                format!("service {} is not registered", service),
            )
        })?;
        methods.get(method).cloned().ok_or_else(|| {
            MxError::remote(
                RemoteErrorKind::MethodNotFound,
                format!("service {} has no method {}", service, method),
            )
        })
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.handlers.keys().collect();
        services.sort();
        f.debug_struct("ServiceRegistry").field("services", &services).finish()
    }
}

#[async_trait]
impl RequestProcessor for ServiceRegistry {
    async fn process(&self, request: RequestMessage) -> ResponseMessage {
        let RequestMessage { id, service_name, method_name, params, .. } = request;
        let outcome = match self.resolve(&service_name, &method_name) {
            Ok(handler) => handler(params).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => ResponseMessage { id, result: Some(value), error: None },
            Err(err) => {
                log::debug!("mx_service: {}.{} failed: {}", service_name, method_name, err);
                ResponseMessage::from_server_error(id, ServerError::from(&err))
            }
        }
    }
}

fn decode_args<A: DeserializeOwned>(params: Vec<Value>) -> Result<A, MxError> {
    let value = if params.is_empty() { Value::Nil } else { Value::Array(params) };
    rmpv::ext::from_value(value).map_err(|err| {
        MxError::remote(RemoteErrorKind::InvalidArguments, format!("invalid arguments: {}", err))
    })
}
