use crate::error::{MatrixError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for a matrix session
///
/// All durations are stored in milliseconds so the config round-trips through
/// JSON or YAML without a custom duration format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Bound on opening the transport
    pub connect_timeout_ms: u64,

    /// How long a command waits for the device acknowledgement
    pub command_timeout_ms: u64,

    /// Interval between keep-alive probes
    pub keepalive_interval_ms: u64,

    /// Consecutive failed probes before the link is declared failed
    pub keepalive_failure_threshold: u32,

    /// First reconnect delay, doubled after every failed attempt
    pub reconnect_initial_backoff_ms: u64,

    /// Upper bound on the reconnect delay
    pub reconnect_max_backoff_ms: u64,

    /// Commands that may wait behind the in-flight one for the same output
    pub zone_queue_depth: usize,

    /// Change events buffered per observer before the oldest are dropped
    pub notification_capacity: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            command_timeout_ms: 3_000,
            keepalive_interval_ms: 10_000,
            keepalive_failure_threshold: 3,
            reconnect_initial_backoff_ms: 1_000,
            reconnect_max_backoff_ms: 30_000,
            zone_queue_depth: 8,
            notification_capacity: 64,
        }
    }
}

impl MatrixConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, failure_threshold: u32) -> Self {
        self.keepalive_interval_ms = interval.as_millis() as u64;
        self.keepalive_failure_threshold = failure_threshold;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_backoff_ms = initial.as_millis() as u64;
        self.reconnect_max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_zone_queue_depth(mut self, depth: usize) -> Self {
        self.zone_queue_depth = depth;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.keepalive_failure_threshold == 0 {
            return Err(MatrixError::InvalidArgument(
                "keepalive_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(MatrixError::InvalidArgument(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.zone_queue_depth == 0 {
            return Err(MatrixError::InvalidArgument(
                "zone_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(MatrixError::InvalidArgument(
                "notification_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect_max_backoff_ms < self.reconnect_initial_backoff_ms {
            return Err(MatrixError::InvalidArgument(format!(
                "reconnect_max_backoff_ms ({}) is below reconnect_initial_backoff_ms ({})",
                self.reconnect_max_backoff_ms, self.reconnect_initial_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Exponential reconnect delay: initial, 2x, 4x ... capped at max
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => (current * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}
