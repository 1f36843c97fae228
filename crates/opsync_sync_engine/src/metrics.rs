//! Metrics reporting.
//!
//! The engine reports what happened to each entry through a
//! [`MetricsRecorder`]. The default recorder turns events into `tracing`
//! events under the `opsync::metrics` target so any subscriber can pick
//! them up.

use opsync_protocol::{ClientId, ErrorKind, OperationType};
use parking_lot::Mutex;
use std::time::Duration;

/// Something the engine did that is worth counting.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// An entry was persisted by `queue_operation`.
    OperationQueued {
        /// The new entry.
        client_id: ClientId,
        /// Kind of write.
        operation: OperationType,
        /// Target table.
        table: String,
        /// Whether the payload was stored compressed.
        compressed: bool,
    },
    /// An entry failed validation at enqueue time.
    ValidationRejected {
        /// The rejected entry.
        client_id: ClientId,
        /// Target table.
        table: String,
        /// Number of field errors.
        errors: usize,
    },
    /// An entry was applied.
    SyncSucceeded {
        /// The applied entry.
        client_id: ClientId,
        /// Kind of write.
        operation: OperationType,
        /// Target table.
        table: String,
        /// Time spent in the backend call.
        latency: Duration,
    },
    /// An apply attempt failed.
    SyncFailed {
        /// The failed entry.
        client_id: ClientId,
        /// Target table.
        table: String,
        /// Failure classification.
        kind: ErrorKind,
        /// Attempts made so far, including this one.
        attempt: u32,
        /// Whether a backoff retry was scheduled.
        will_retry: bool,
    },
    /// A version conflict was filed.
    ConflictDetected {
        /// The blocked entry.
        client_id: ClientId,
        /// The filed conflict record.
        conflict_id: String,
        /// Target table.
        table: String,
    },
    /// A conflict record was resolved.
    ConflictResolved {
        /// The resolved record.
        conflict_id: String,
        /// True if the client snapshot was kept.
        used_client: bool,
    },
    /// A drain pass finished.
    DrainCompleted {
        /// Entries selected at the start of the pass.
        selected: usize,
        /// Entries applied.
        completed: usize,
        /// Entries that failed.
        failed: usize,
        /// Entries blocked by a conflict.
        conflicted: usize,
        /// Wall time of the pass.
        duration: Duration,
    },
}

impl MetricEvent {
    /// Short event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OperationQueued { .. } => "operation_queued",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::SyncSucceeded { .. } => "sync_succeeded",
            Self::SyncFailed { .. } => "sync_failed",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::ConflictResolved { .. } => "conflict_resolved",
            Self::DrainCompleted { .. } => "drain_completed",
        }
    }
}

/// Receives engine metric events.
///
/// Called synchronously from the drain pass; implementations should not
/// block.
pub trait MetricsRecorder: Send + Sync {
    /// Records one event.
    fn record(&self, event: &MetricEvent);
}

impl<T: MetricsRecorder + ?Sized> MetricsRecorder for std::sync::Arc<T> {
    fn record(&self, event: &MetricEvent) {
        (**self).record(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record(&self, _event: &MetricEvent) {}
}

/// Emits every event as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn record(&self, event: &MetricEvent) {
        match event {
            MetricEvent::OperationQueued {
                client_id,
                operation,
                table,
                compressed,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                %client_id,
                %operation,
                table = table.as_str(),
                compressed,
            ),
            MetricEvent::ValidationRejected {
                client_id,
                table,
                errors,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                %client_id,
                table = table.as_str(),
                errors,
            ),
            MetricEvent::SyncSucceeded {
                client_id,
                operation,
                table,
                latency,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                %client_id,
                %operation,
                table = table.as_str(),
                latency_ms = latency.as_millis() as u64,
            ),
            MetricEvent::SyncFailed {
                client_id,
                table,
                kind,
                attempt,
                will_retry,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                %client_id,
                table = table.as_str(),
                error_kind = %kind,
                attempt,
                will_retry,
            ),
            MetricEvent::ConflictDetected {
                client_id,
                conflict_id,
                table,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                %client_id,
                conflict_id = conflict_id.as_str(),
                table = table.as_str(),
            ),
            MetricEvent::ConflictResolved {
                conflict_id,
                used_client,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                conflict_id = conflict_id.as_str(),
                used_client,
            ),
            MetricEvent::DrainCompleted {
                selected,
                completed,
                failed,
                conflicted,
                duration,
            } => tracing::info!(
                target: "opsync::metrics",
                event = event.name(),
                selected,
                completed,
                failed,
                conflicted,
                duration_ms = duration.as_millis() as u64,
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemoryMetrics {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given [`MetricEvent::name`].
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl MetricsRecorder for MemoryMetrics {
    fn record(&self, event: &MetricEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_metrics_counts_by_name() {
        let metrics = MemoryMetrics::new();
        let resolved = MetricEvent::ConflictResolved {
            conflict_id: "c1".into(),
            used_client: true,
        };
        metrics.record(&resolved);
        metrics.record(&resolved);
        metrics.record(&MetricEvent::SyncFailed {
            client_id: ClientId::new(),
            table: "staff".into(),
            kind: ErrorKind::Network,
            attempt: 1,
            will_retry: true,
        });

        assert_eq!(metrics.count("conflict_resolved"), 2);
        assert_eq!(metrics.count("sync_failed"), 1);
        assert_eq!(metrics.count("sync_succeeded"), 0);

        metrics.clear();
        assert!(metrics.events().is_empty());
    }

    #[test]
    fn tracing_metrics_without_subscriber() {
        TracingMetrics.record(&MetricEvent::DrainCompleted {
            selected: 1,
            completed: 1,
            failed: 0,
            conflicted: 0,
            duration: Duration::from_millis(5),
        });
    }
}
