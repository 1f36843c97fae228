//! Configuration for the sync engine.

use opsync_codec::COMPRESSION_THRESHOLD;
use std::time::Duration;

/// Default name of the remote table holding conflict records.
pub const DEFAULT_CONFLICT_TABLE: &str = "sync_conflicts";

/// Configuration for a [`crate::SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Serialized payload size at which entries are stored compressed.
    pub compression_threshold: usize,
    /// Remote table conflict records are written to.
    pub conflict_table: String,
    /// Automatically retry 401/403 failures like transient ones.
    pub retry_authorization_failures: bool,
    /// How long the driver waits before re-sending a trigger that found
    /// a pass already running.
    pub busy_retry_delay: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the compression threshold in bytes.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Sets the remote conflict table.
    pub fn with_conflict_table(mut self, table: impl Into<String>) -> Self {
        self.conflict_table = table.into();
        self
    }

    /// Sets whether authorization failures are retried automatically.
    pub fn with_retry_authorization_failures(mut self, retry: bool) -> Self {
        self.retry_authorization_failures = retry;
        self
    }

    /// Sets the driver's busy re-send delay.
    pub fn with_busy_retry_delay(mut self, delay: Duration) -> Self {
        self.busy_retry_delay = delay;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            compression_threshold: COMPRESSION_THRESHOLD,
            conflict_table: DEFAULT_CONFLICT_TABLE.to_string(),
            retry_authorization_failures: false,
            busy_retry_delay: Duration::from_millis(250),
        }
    }
}

/// Configuration for retry behavior.
///
/// Delays are deterministic so tests can drive them exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after which automatic retries stop.
    pub max_attempts: u32,
    /// Base delay.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a configuration with `max_attempts` and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Creates a configuration with no automatic retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the retry that follows `attempt` failed attempts:
    /// `min(initial * multiplier^attempt, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_schedule() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(4000));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(8000));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(16_000));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(30_000));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_millis(30_000));
        assert_eq!(retry.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn no_retry_config() {
        let retry = RetryConfig::no_retry();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.compression_threshold, 1024);
        assert_eq!(config.conflict_table, "sync_conflicts");
        assert!(!config.retry_authorization_failures);
    }

    #[test]
    fn builder() {
        let config = SyncConfig::new()
            .with_retry(RetryConfig::new(5).with_initial_delay(Duration::from_millis(10)))
            .with_conflict_table("conflicts")
            .with_retry_authorization_failures(true);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay_for_attempt(1).as_millis(), 20);
        assert_eq!(config.conflict_table, "conflicts");
        assert!(config.retry_authorization_failures);
    }
}
