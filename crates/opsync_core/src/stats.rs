//! Queue statistics.

use opsync_protocol::{QueueEntry, QueueStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Counts of entries by status and failure kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// All entries.
    pub total: usize,
    /// Entries waiting for a pass.
    pub pending: usize,
    /// Entries claimed by a pass.
    pub processing: usize,
    /// Entries applied successfully.
    pub completed: usize,
    /// Entries whose last attempt failed.
    pub failed: usize,
    /// Failed entries that used all their attempts.
    pub exhausted: usize,
    /// Failed entries with a conflict record.
    pub conflicted: usize,
    /// Entries stored compressed.
    pub compressed: usize,
    /// Failed entries keyed by error kind.
    pub failures_by_kind: BTreeMap<String, usize>,
}

impl QueueStats {
    /// Computes statistics over `entries`.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a QueueEntry>,
        max_attempts: u32,
    ) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            if entry.is_compressed() {
                stats.compressed += 1;
            }
            match entry.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => {
                    stats.failed += 1;
                    if entry.is_exhausted(max_attempts) {
                        stats.exhausted += 1;
                    }
                    if entry.conflict_id.is_some() {
                        stats.conflicted += 1;
                    }
                    let kind = entry
                        .error_type
                        .map_or("unclassified", |kind| kind.as_str());
                    *stats.failures_by_kind.entry(kind.to_string()).or_default() += 1;
                }
            }
        }
        stats
    }

    /// Entries still owed an apply (pending or processing).
    pub fn outstanding(&self) -> usize {
        self.pending + self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_protocol::{ErrorKind, OperationType, Payload};

    fn entry() -> QueueEntry {
        QueueEntry::new(
            OperationType::Update,
            "products",
            Some("p1".into()),
            Payload::new(),
            1024,
        )
        .unwrap()
    }

    #[test]
    fn counts_by_status_and_kind() {
        let pending = entry();

        let mut done = entry();
        done.mark_processing().unwrap();
        done.mark_completed(None).unwrap();

        let mut exhausted = entry();
        for _ in 0..3 {
            exhausted.mark_processing().unwrap();
            exhausted
                .record_failure(ErrorKind::Unknown, "500", None)
                .unwrap();
        }

        let mut conflicted = entry();
        conflicted.mark_processing().unwrap();
        conflicted.mark_conflicted("c1", "stale", None).unwrap();

        let stats = QueueStats::from_entries(&[pending, done, exhausted, conflicted], 3);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.conflicted, 1);
        assert_eq!(stats.failures_by_kind["unknown"], 1);
        assert_eq!(stats.failures_by_kind["conflict"], 1);
        assert_eq!(stats.outstanding(), 1);
    }
}
