//! Queue and countdown configuration types

use crate::error::{BookingError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of requests allowed in flight at once
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default number of automatic retries for high-priority requests
pub const DEFAULT_HIGH_PRIORITY_RETRIES: u32 = 2;

/// Upper bound on the countdown tick interval
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Request queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of operations in flight
    pub max_concurrent: usize,
    /// Retry policy applied to failed high-priority requests
    #[serde(default = "default_high_priority_retry")]
    pub high_priority_retry: RetryPolicy,
    /// Optional per-attempt timeout; `None` lets an operation run forever
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_serde"
    )]
    pub operation_timeout: Option<Duration>,
}

fn default_high_priority_retry() -> RetryPolicy {
    RetryPolicy::immediate(DEFAULT_HIGH_PRIORITY_RETRIES)
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

impl QueueConfig {
    /// Create a queue configuration with the given concurrency bound
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            high_priority_retry: default_high_priority_retry(),
            operation_timeout: None,
        }
    }

    /// Set the high-priority retry policy (builder pattern)
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.high_priority_retry = retry_policy;
        self
    }

    /// Set a per-attempt timeout (builder pattern)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Reject configurations the queue cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(BookingError::ConfigError(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if matches!(self.operation_timeout, Some(t) if t.is_zero()) {
            return Err(BookingError::ConfigError(
                "operation_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Countdown configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountdownConfig {
    /// Time between ticks, serialized in milliseconds
    #[serde(with = "millis_serde")]
    pub tick_interval: Duration,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl CountdownConfig {
    /// Set the tick interval (builder pattern)
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Reject configurations the countdown manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(BookingError::ConfigError(
                "tick_interval must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval > MAX_TICK_INTERVAL {
            return Err(BookingError::ConfigError(format!(
                "tick_interval must not exceed {}s, got {}ms",
                MAX_TICK_INTERVAL.as_secs(),
                self.tick_interval.as_millis()
            )));
        }
        Ok(())
    }
}
