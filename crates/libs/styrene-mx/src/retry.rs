use std::time::{Duration, Instant};

use crate::config::MxLimits;
use crate::error::MxError;

/// When a failed outbound attempt is tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_limit: u32,
    pub elapsed_limit: Duration,
    pub sleep_interval: Duration,
}

impl RetryPolicy {
    pub fn from_limits(limits: &MxLimits) -> Self {
        Self {
            attempt_limit: limits.retry_count_limit.max(1),
            elapsed_limit: limits.connection_error_retry_timeout,
            sleep_interval: limits.retry_listening_sleep_interval,
        }
    }

    /// `attempts` is the number of attempts already made.
    pub fn should_retry(&self, attempts: u32, started: Instant, err: &MxError) -> bool {
        err.is_retryable()
            && attempts < self.attempt_limit
            && started.elapsed() + self.sleep_interval < self.elapsed_limit
    }
}

/// Doubling reconnect delay for polling loops.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl PollingBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), current: initial }
    }

    pub fn from_limits(limits: &MxLimits) -> Self {
        Self::new(limits.polling_reconnect_initial_backoff, limits.polling_reconnect_max_backoff)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
