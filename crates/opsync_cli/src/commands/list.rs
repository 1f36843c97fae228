//! List command implementation.

use super::open_existing;
use opsync_core::{DurableQueue, QueueStore};
use opsync_protocol::{QueueEntry, QueueStatus};
use serde::Serialize;
use std::path::Path;

/// One listed entry.
#[derive(Debug, Serialize)]
pub struct EntryRow {
    /// Entry id.
    pub client_id: String,
    /// Kind of write.
    pub operation: String,
    /// Target table.
    pub table: String,
    /// Target record.
    pub record_id: Option<String>,
    /// Lifecycle status.
    pub status: String,
    /// Apply attempts made.
    pub attempts: u32,
    /// Last failure kind.
    pub error_type: Option<String>,
    /// Last failure message.
    pub error_message: Option<String>,
    /// Filed conflict record.
    pub conflict_id: Option<String>,
    /// Payload stored compressed.
    pub compressed: bool,
    /// Enqueue time (RFC 3339).
    pub created_at: String,
}

impl From<&QueueEntry> for EntryRow {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            client_id: entry.client_id.to_string(),
            operation: entry.operation_type.to_string(),
            table: entry.table_name.clone(),
            record_id: entry.record_id.clone(),
            status: entry.status.to_string(),
            attempts: entry.attempt_count,
            error_type: entry.error_type.map(|k| k.to_string()),
            error_message: entry.error_message.clone(),
            conflict_id: entry.conflict_id.clone(),
            compressed: entry.is_compressed(),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// Runs the list command.
pub fn run(
    path: &Path,
    status: Option<QueueStatus>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_existing(path)?;
    let rows = collect(&queue, status, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("No entries");
            }
            for row in &rows {
                println!(
                    "{}  {:<10} {:<6} {:<20} {:<12} attempts={}",
                    row.client_id,
                    row.status,
                    row.operation,
                    row.table,
                    row.record_id.as_deref().unwrap_or("-"),
                    row.attempts,
                );
                if let Some(message) = &row.error_message {
                    let kind = row.error_type.as_deref().unwrap_or("unknown");
                    println!("    {kind}: {message}");
                }
            }
        }
    }
    Ok(())
}

/// Entries matching `status`, oldest first, at most `limit`.
pub fn collect(
    queue: &DurableQueue,
    status: Option<QueueStatus>,
    limit: Option<usize>,
) -> Result<Vec<EntryRow>, Box<dyn std::error::Error>> {
    let mut entries = queue.get_all()?;
    entries.retain(|e| status.map_or(true, |s| e.status == s));
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.client_id.cmp(&b.client_id)));
    Ok(entries
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(EntryRow::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::QueueConfig;
    use opsync_protocol::{OperationType, Payload};

    #[test]
    fn filters_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        for name in ["a", "b", "c"] {
            let entry = QueueEntry::new(
                OperationType::Create,
                "stores",
                None,
                Payload::new().with("name", name),
                1024,
            )
            .unwrap();
            queue.add(entry).unwrap();
        }
        let mut first = queue.get_all().unwrap().remove(0);
        first.mark_processing().unwrap();
        let id = first.client_id;
        queue.update(&id, first).unwrap();

        assert_eq!(collect(&queue, None, None).unwrap().len(), 3);
        assert_eq!(collect(&queue, None, Some(2)).unwrap().len(), 2);

        let pending = collect(&queue, Some(QueueStatus::Pending), None).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|row| row.status == "pending"));
    }
}
