use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::MxError;

pub const LISTENING_SCHEME: &str = "https";
pub const POLLING_SCHEME: &str = "poll";

/// Destination of a request: where to send it and whom to expect there.
///
/// Equality and hashing only consider the URI, the expected thumbprint and
/// the proxy, so an endpoint can key the connection pool and queue registry
/// regardless of its timeout overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceEndPoint {
    pub base_uri: Url,
    pub remote_thumbprint: String,
    pub proxy: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub retry_count_limit: Option<u32>,
    pub retry_listening_sleep_interval: Option<Duration>,
    pub polling_request_queue_timeout: Option<Duration>,
    pub polling_request_maximum_message_processing_timeout: Option<Duration>,
}

impl ServiceEndPoint {
    pub fn new(uri: &str, remote_thumbprint: &str) -> Result<Self, MxError> {
        Ok(Self {
            base_uri: parse_uri(uri)?,
            remote_thumbprint: normalize_thumbprint(remote_thumbprint),
            proxy: None,
            connect_timeout: None,
            retry_count_limit: None,
            retry_listening_sleep_interval: None,
            polling_request_queue_timeout: None,
            polling_request_maximum_message_processing_timeout: None,
        })
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_retry_count_limit(mut self, limit: u32) -> Self {
        self.retry_count_limit = Some(limit);
        self
    }

    pub fn with_retry_listening_sleep_interval(mut self, interval: Duration) -> Self {
        self.retry_listening_sleep_interval = Some(interval);
        self
    }

    pub fn with_polling_request_queue_timeout(mut self, timeout: Duration) -> Self {
        self.polling_request_queue_timeout = Some(timeout);
        self
    }

    pub fn with_polling_request_maximum_message_processing_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.polling_request_maximum_message_processing_timeout = Some(timeout);
        self
    }

    pub fn is_polling(&self) -> bool {
        self.base_uri.scheme() == POLLING_SCHEME
    }

    /// Host and port to dial. Fails for polling endpoints, which have no
    /// network meaning.
    pub fn host_and_port(&self) -> Result<(String, u16), MxError> {
        if self.is_polling() {
            return Err(MxError::config(format!(
                "{} is a polling address and cannot be dialed",
                self.base_uri
            )));
        }
        let host = self
            .base_uri
            .host_str()
            .ok_or_else(|| MxError::config(format!("{} has no host", self.base_uri)))?;
        let port = self
            .base_uri
            .port_or_known_default()
            .ok_or_else(|| MxError::config(format!("{} has no port", self.base_uri)))?;
        Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
    }
}

impl PartialEq for ServiceEndPoint {
    fn eq(&self, other: &Self) -> bool {
        self.base_uri == other.base_uri
            && self.remote_thumbprint == other.remote_thumbprint
            && self.proxy == other.proxy
    }
}

impl Eq for ServiceEndPoint {}

impl Hash for ServiceEndPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_uri.hash(state);
        self.remote_thumbprint.hash(state);
        self.proxy.hash(state);
    }
}

impl fmt::Display for ServiceEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_uri)
    }
}

/// Parses a listening or polling address and normalises an empty path to `/`.
pub fn parse_uri(uri: &str) -> Result<Url, MxError> {
    let mut url = Url::parse(uri.trim())
        .map_err(|err| MxError::config(format!("invalid endpoint uri {}: {}", uri, err)))?;
    match url.scheme() {
        LISTENING_SCHEME => {}
        POLLING_SCHEME => {
            if url.host_str().map_or(true, str::is_empty) {
                return Err(MxError::config(format!("{} has no subscription id", uri)));
            }
        }
        other => {
            return Err(MxError::config(format!(
                "unsupported endpoint scheme {} in {}",
                other, uri
            )))
        }
    }
    if url.path().is_empty() {
        url.set_path("/");
    }
    Ok(url)
}

pub fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint.trim().replace(':', "").to_ascii_uppercase()
}
