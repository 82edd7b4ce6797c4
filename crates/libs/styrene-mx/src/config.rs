use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::endpoint::ServiceEndPoint;
use crate::error::MxError;

/// Timeouts and limits shared by every component of a runtime.
///
/// Built once and handed out as `Arc<MxLimits>`; per-endpoint overrides are
/// applied with [`MxLimits::for_endpoint`]. Durations in TOML are seconds and
/// may be fractional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MxLimits {
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub send_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub receive_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub heartbeat_send_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub heartbeat_receive_timeout: Duration,
    /// How long a pooled connection may sit idle before it is considered dead.
    #[serde(deserialize_with = "seconds")]
    pub pooled_connection_idle_timeout: Duration,
    pub pooled_connection_max_uses: Option<u32>,
    pub pool_max_idle_per_endpoint: usize,
    /// How long a queued request waits for a poller to collect it.
    #[serde(deserialize_with = "seconds")]
    pub polling_request_queue_timeout: Duration,
    /// How long a collected request waits for its response.
    #[serde(deserialize_with = "seconds")]
    pub polling_request_maximum_message_processing_timeout: Duration,
    /// How long a dequeue waits before a keepalive round is sent instead.
    #[serde(deserialize_with = "seconds")]
    pub polling_queue_wait_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub polling_reconnect_initial_backoff: Duration,
    #[serde(deserialize_with = "seconds")]
    pub polling_reconnect_max_backoff: Duration,
    pub subscriber_rounds_per_connection: Option<u32>,
    pub retry_count_limit: u32,
    #[serde(deserialize_with = "seconds")]
    pub retry_listening_sleep_interval: Duration,
    #[serde(deserialize_with = "seconds")]
    pub connection_error_retry_timeout: Duration,
    pub max_inbound_connections: Option<usize>,
    pub max_inbound_connections_per_thumbprint: Option<usize>,
    pub max_message_size: usize,
}

impl Default for MxLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(600),
            receive_timeout: Duration::from_secs(600),
            heartbeat_send_timeout: Duration::from_secs(60),
            heartbeat_receive_timeout: Duration::from_secs(60),
            pooled_connection_idle_timeout: Duration::from_secs(540),
            pooled_connection_max_uses: None,
            pool_max_idle_per_endpoint: 5,
            polling_request_queue_timeout: Duration::from_secs(120),
            polling_request_maximum_message_processing_timeout: Duration::from_secs(600),
            polling_queue_wait_timeout: Duration::from_secs(30),
            polling_reconnect_initial_backoff: Duration::from_secs(1),
            polling_reconnect_max_backoff: Duration::from_secs(30),
            subscriber_rounds_per_connection: None,
            retry_count_limit: 5,
            retry_listening_sleep_interval: Duration::from_secs(1),
            connection_error_retry_timeout: Duration::from_secs(300),
            max_inbound_connections: None,
            max_inbound_connections_per_thumbprint: None,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

impl MxLimits {
    pub fn from_toml(input: &str) -> Result<Self, MxError> {
        let limits: Self = toml::from_str(input).map_err(|err| MxError::config(err.to_string()))?;
        limits.validate()?;
        Ok(limits)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, MxError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            MxError::config(format!("failed to read {}: {}", path.display(), err))
        })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), MxError> {
        if self.retry_count_limit == 0 {
            return Err(MxError::config("retry_count_limit must be at least 1"));
        }
        if self.max_message_size == 0 {
            return Err(MxError::config("max_message_size must be greater than zero"));
        }
        if self.polling_reconnect_initial_backoff > self.polling_reconnect_max_backoff {
            return Err(MxError::config(
                "polling_reconnect_initial_backoff exceeds polling_reconnect_max_backoff",
            ));
        }
        Ok(())
    }

    /// Limits with the endpoint's overrides applied.
    pub fn for_endpoint(&self, endpoint: &ServiceEndPoint) -> Self {
        let mut limits = self.clone();
        if let Some(value) = endpoint.connect_timeout {
            limits.connect_timeout = value;
        }
        if let Some(value) = endpoint.retry_count_limit {
            limits.retry_count_limit = value.max(1);
        }
        if let Some(value) = endpoint.retry_listening_sleep_interval {
            limits.retry_listening_sleep_interval = value;
        }
        if let Some(value) = endpoint.polling_request_queue_timeout {
            limits.polling_request_queue_timeout = value;
        }
        if let Some(value) = endpoint.polling_request_maximum_message_processing_timeout {
            limits.polling_request_maximum_message_processing_timeout = value;
        }
        limits
    }

    /// Receive timeout a subscriber uses while the server may be holding the
    /// connection open waiting for work.
    pub fn subscriber_request_receive_timeout(&self) -> Duration {
        self.polling_queue_wait_timeout + self.heartbeat_receive_timeout
    }
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
}
