//! The queue store contract and its in-memory implementation.

use crate::error::{CoreError, CoreResult};
use crate::stats::QueueStats;
use opsync_protocol::{ClientId, QueueEntry, QueueStatus};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keyed storage for queue entries.
///
/// Every method is durable before it returns `Ok` for implementations
/// that persist. `get_all` returns entries in no particular order.
///
/// Implementations enforce entry invariants at this boundary:
/// - `add` rejects a client id already present
/// - updates reject a changed client id, a lower attempt count, a
///   status move the state machine forbids, and any change to a
///   completed entry
/// - [`UpdateGuard::Expect`] updates also reject an entry whose stored
///   status is no longer the one the caller read
///
/// The check and the write happen under one lock, so a writer holding a
/// stale snapshot cannot overwrite a newer state.
pub trait QueueStore: Send + Sync {
    /// Inserts a new entry.
    fn add(&self, entry: QueueEntry) -> CoreResult<()>;

    /// Fetches an entry by id.
    fn get(&self, client_id: &ClientId) -> CoreResult<Option<QueueEntry>>;

    /// Replaces an existing entry after checking it against `guard`.
    fn update_guarded(
        &self,
        client_id: &ClientId,
        entry: QueueEntry,
        guard: UpdateGuard,
    ) -> CoreResult<()>;

    /// Replaces an existing entry.
    fn update(&self, client_id: &ClientId, entry: QueueEntry) -> CoreResult<()> {
        self.update_guarded(client_id, entry, UpdateGuard::Transition)
    }

    /// Replaces an existing entry only if its stored status is still
    /// `expected`.
    ///
    /// # Errors
    ///
    /// [`CoreError::StatusChanged`] if another writer moved the entry.
    fn update_if(
        &self,
        client_id: &ClientId,
        expected: QueueStatus,
        entry: QueueEntry,
    ) -> CoreResult<()> {
        self.update_guarded(client_id, entry, UpdateGuard::Expect(expected))
    }

    /// Returns every entry.
    fn get_all(&self) -> CoreResult<Vec<QueueEntry>>;

    /// Summarizes the queue.
    fn stats(&self, max_attempts: u32) -> CoreResult<QueueStats> {
        Ok(QueueStats::from_entries(&self.get_all()?, max_attempts))
    }
}

/// How an update is checked against the stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateGuard {
    /// Any status move the state machine allows.
    Transition,
    /// As `Transition`, and the stored status must still be this one.
    Expect(QueueStatus),
    /// Returns an entry left `processing` by an interrupted pass to
    /// `pending`. Nothing else is accepted.
    Recover,
}

/// Checks that replacing `current` with `next` keeps entry invariants.
pub fn check_update(
    current: &QueueEntry,
    next: &QueueEntry,
    guard: UpdateGuard,
) -> CoreResult<()> {
    let id = current.client_id;
    if let UpdateGuard::Expect(expected) = guard {
        if current.status != expected {
            return Err(CoreError::StatusChanged {
                client_id: id,
                expected,
                actual: current.status,
            });
        }
    }
    if next.client_id != id {
        return Err(CoreError::invalid_update(
            id,
            format!("client id cannot change to {}", next.client_id),
        ));
    }
    if current.status == QueueStatus::Completed {
        if next == current {
            return Ok(());
        }
        return Err(CoreError::invalid_update(id, "completed entries are immutable"));
    }
    if next.attempt_count < current.attempt_count {
        return Err(CoreError::invalid_update(
            id,
            format!(
                "attempt count cannot decrease from {} to {}",
                current.attempt_count, next.attempt_count
            ),
        ));
    }
    if guard == UpdateGuard::Recover {
        if current.status != QueueStatus::Processing || next.status != QueueStatus::Pending {
            return Err(CoreError::invalid_update(
                id,
                format!(
                    "recovery moves processing to pending, not {} to {}",
                    current.status, next.status
                ),
            ));
        }
        return Ok(());
    }
    if !current.status.can_transition_to(next.status) {
        return Err(CoreError::invalid_update(
            id,
            format!("status cannot move from {} to {}", current.status, next.status),
        ));
    }
    Ok(())
}

/// A queue held in memory. Lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: RwLock<HashMap<ClientId, QueueEntry>>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl QueueStore for MemoryQueue {
    fn add(&self, entry: QueueEntry) -> CoreResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.client_id) {
            return Err(CoreError::DuplicateEntry {
                client_id: entry.client_id,
            });
        }
        entries.insert(entry.client_id, entry);
        Ok(())
    }

    fn get(&self, client_id: &ClientId) -> CoreResult<Option<QueueEntry>> {
        Ok(self.entries.read().get(client_id).cloned())
    }

    fn update_guarded(
        &self,
        client_id: &ClientId,
        entry: QueueEntry,
        guard: UpdateGuard,
    ) -> CoreResult<()> {
        let mut entries = self.entries.write();
        let current = entries.get(client_id).ok_or(CoreError::NotFound {
            client_id: *client_id,
        })?;
        check_update(current, &entry, guard)?;
        entries.insert(*client_id, entry);
        Ok(())
    }

    fn get_all(&self) -> CoreResult<Vec<QueueEntry>> {
        Ok(self.entries.read().values().cloned().collect())
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
            Payload::new().with("price", 3),
            1024,
        )
        .unwrap()
    }

    #[test]
    fn add_get_update() {
        let queue = MemoryQueue::new();
        let mut e = entry();
        queue.add(e.clone()).unwrap();
        assert_eq!(queue.get(&e.client_id).unwrap(), Some(e.clone()));

        e.mark_processing().unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        assert_eq!(
            queue.get(&e.client_id).unwrap().unwrap().status,
            QueueStatus::Processing
        );
        assert_eq!(queue.get_all().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_add_rejected() {
        let queue = MemoryQueue::new();
        let e = entry();
        queue.add(e.clone()).unwrap();
        assert!(matches!(
            queue.add(e).unwrap_err(),
            CoreError::DuplicateEntry { .. }
        ));
    }

    #[test]
    fn update_of_missing_entry() {
        let queue = MemoryQueue::new();
        let e = entry();
        assert!(matches!(
            queue.update(&e.client_id, e.clone()).unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[test]
    fn completed_entries_are_frozen() {
        let queue = MemoryQueue::new();
        let mut e = entry();
        queue.add(e.clone()).unwrap();
        e.mark_processing().unwrap();
        e.mark_completed(None).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();

        // Rewriting the identical snapshot is harmless.
        queue.update(&e.client_id, e.clone()).unwrap();

        let mut changed = e.clone();
        changed.table_name = "other".into();
        let err = queue.update(&e.client_id, changed).unwrap_err();
        assert!(matches!(err, CoreError::InvalidUpdate { .. }));
    }

    #[test]
    fn attempt_count_never_decreases() {
        let queue = MemoryQueue::new();
        let mut e = entry();
        queue.add(e.clone()).unwrap();
        e.mark_processing().unwrap();
        e.record_failure(ErrorKind::Network, "offline", None).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();

        let mut reset = e.clone();
        reset.attempt_count = 0;
        assert!(queue.update(&e.client_id, reset).is_err());
    }

    #[test]
    fn conditional_update_rejects_stale_snapshot() {
        let queue = MemoryQueue::new();
        let mut e = entry();
        queue.add(e.clone()).unwrap();
        e.mark_processing().unwrap();
        e.record_failure(ErrorKind::Unknown, "500", None).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();

        // A user reads the failed entry while a drain pass claims it.
        let mut stale = queue.get(&e.client_id).unwrap().unwrap();
        let mut claimed = stale.clone();
        claimed.mark_processing().unwrap();
        queue
            .update_if(&e.client_id, QueueStatus::Failed, claimed)
            .unwrap();

        stale.requeue().unwrap();
        let err = queue
            .update_if(&e.client_id, QueueStatus::Failed, stale.clone())
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::StatusChanged {
                expected: QueueStatus::Failed,
                actual: QueueStatus::Processing,
                ..
            }
        ));
        // An unconditional write of the same snapshot is refused too.
        assert!(queue.update(&e.client_id, stale).is_err());
        assert_eq!(
            queue.get(&e.client_id).unwrap().unwrap().status,
            QueueStatus::Processing
        );
    }

    #[test]
    fn recovery_has_its_own_path() {
        let queue = MemoryQueue::new();
        let mut e = entry();
        queue.add(e.clone()).unwrap();
        e.mark_processing().unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();

        let mut recovered = e.clone();
        recovered.recover_interrupted().unwrap();
        assert!(queue.update(&e.client_id, recovered.clone()).is_err());
        queue
            .update_guarded(&e.client_id, recovered, UpdateGuard::Recover)
            .unwrap();
        assert_eq!(
            queue.get(&e.client_id).unwrap().unwrap().status,
            QueueStatus::Pending
        );

        // Recovery only applies to processing entries.
        let pending = queue.get(&e.client_id).unwrap().unwrap();
        assert!(queue
            .update_guarded(&e.client_id, pending, UpdateGuard::Recover)
            .is_err());
    }

    #[test]
    fn client_id_is_immutable() {
        let queue = MemoryQueue::new();
        let e = entry();
        queue.add(e.clone()).unwrap();

        let mut other = e.clone();
        other.client_id = ClientId::new();
        assert!(queue.update(&e.client_id, other).is_err());
    }
}
