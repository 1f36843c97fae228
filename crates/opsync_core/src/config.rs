//! Durable queue configuration.

/// Options for opening a [`crate::DurableQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Create the queue directory if it does not exist.
    pub create_if_missing: bool,

    /// Sync the log to disk after every write. Turning this off trades
    /// durability of the last few writes for throughput.
    pub sync_on_write: bool,

    /// Compact automatically once superseded records make up this share
    /// of the log. `0.0` disables automatic compaction.
    pub compact_threshold_ratio: f64,

    /// Minimum number of log records before automatic compaction runs.
    pub compact_min_records: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            compact_threshold_ratio: 0.75,
            compact_min_records: 256,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create a missing directory.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the automatic compaction ratio.
    #[must_use]
    pub fn compact_threshold_ratio(mut self, ratio: f64) -> Self {
        self.compact_threshold_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Sets the minimum log size for automatic compaction.
    #[must_use]
    pub const fn compact_min_records(mut self, records: usize) -> Self {
        self.compact_min_records = records;
        self
    }

    /// Returns true if a log with `records` records, of which `live` are
    /// current, should be compacted.
    pub fn should_compact(&self, records: usize, live: usize) -> bool {
        if self.compact_threshold_ratio <= 0.0 || records < self.compact_min_records {
            return false;
        }
        let dead = records.saturating_sub(live);
        dead as f64 >= records as f64 * self.compact_threshold_ratio
    }
}
