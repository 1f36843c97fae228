//! Requeue command implementation.

use super::open_existing;
use opsync_core::{DurableQueue, QueueStore};
use opsync_protocol::{ClientId, ErrorKind, QueueEntry, QueueStatus};
use std::path::Path;

/// Runs the requeue command.
pub fn run(path: &Path, client_id: ClientId) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_existing(path)?;
    let entry = requeue(&queue, client_id)?;
    println!(
        "✓ {} is pending again ({} attempts so far)",
        entry.client_id, entry.attempt_count
    );
    Ok(())
}

/// Moves a failed entry back to pending, keeping its attempt count.
///
/// Validation failures are refused: the payload has to be checked by the
/// application's validator first.
pub fn requeue(
    queue: &DurableQueue,
    client_id: ClientId,
) -> Result<QueueEntry, Box<dyn std::error::Error>> {
    let mut entry = queue
        .get(&client_id)?
        .ok_or_else(|| format!("No entry {client_id}"))?;
    if entry.error_type == Some(ErrorKind::Validation) {
        return Err(format!(
            "{client_id} failed validation; retry it from the application so it is validated again"
        )
        .into());
    }
    entry.requeue()?;
    queue.update_if(&client_id, QueueStatus::Failed, entry.clone())?;
    tracing::info!(%client_id, "entry requeued");
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::QueueConfig;
    use opsync_protocol::{OperationType, Payload, QueueStatus};

    fn failed_entry(queue: &DurableQueue, kind: ErrorKind) -> ClientId {
        let mut entry = QueueEntry::new(
            OperationType::Update,
            "products",
            Some("p1".into()),
            Payload::new().with("price", 5),
            1024,
        )
        .unwrap();
        let id = entry.client_id;
        queue.add(entry.clone()).unwrap();
        entry.mark_processing().unwrap();
        entry.record_failure(kind, "boom", None).unwrap();
        queue.update(&id, entry).unwrap();
        id
    }

    #[test]
    fn requeues_failed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        let id = failed_entry(&queue, ErrorKind::Network);

        let entry = requeue(&queue, id).unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(queue.get(&id).unwrap().unwrap(), entry);
    }

    #[test]
    fn refuses_validation_failures_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        let id = failed_entry(&queue, ErrorKind::Validation);

        assert!(requeue(&queue, id).is_err());
        assert!(requeue(&queue, ClientId::new()).is_err());
        assert_eq!(queue.get(&id).unwrap().unwrap().status, QueueStatus::Failed);
    }
}
