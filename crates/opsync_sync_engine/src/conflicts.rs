//! Conflict detection and the remote conflict table.

use crate::backend::{BackendError, Record, RemoteBackend};
use crate::error::{SyncError, SyncResult};
use opsync_protocol::{
    detect_version_conflict, ConflictRecord, Payload, ResolutionStatus, VersionMismatch,
};
use serde_json::{json, Value};

/// A version mismatch found before applying an update.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    /// The server record as fetched.
    pub server_record: Record,
    /// The versions that disagreed.
    pub mismatch: VersionMismatch,
}

/// Reads the current server record and compares versions.
///
/// A missing server record is not a conflict; the update itself will
/// report it.
pub async fn detect_conflict<B>(
    backend: &B,
    table: &str,
    record_id: &str,
    payload: &Payload,
) -> Result<Option<DetectedConflict>, BackendError>
where
    B: RemoteBackend + ?Sized,
{
    let Some(server_record) = backend.select_one(table, record_id).await? else {
        return Ok(None);
    };
    Ok(
        detect_version_conflict(payload, &server_record).map(|mismatch| DetectedConflict {
            server_record,
            mismatch,
        }),
    )
}

/// Conflict records stored in a remote table.
pub struct ConflictStore<'a, B: ?Sized> {
    backend: &'a B,
    table: &'a str,
}

impl<'a, B: RemoteBackend + ?Sized> ConflictStore<'a, B> {
    /// Uses `table` on `backend`.
    pub fn new(backend: &'a B, table: &'a str) -> Self {
        Self { backend, table }
    }

    /// Writes a new conflict record.
    pub async fn file(&self, record: &ConflictRecord) -> SyncResult<()> {
        let row = serde_json::to_value(record)
            .map_err(|e| SyncError::MalformedConflict(e.to_string()))?;
        self.backend.insert(self.table, row).await?;
        Ok(())
    }

    /// Records awaiting resolution, oldest first.
    pub async fn list_pending(&self) -> SyncResult<Vec<ConflictRecord>> {
        let rows = self
            .backend
            .select_eq(self.table, "resolution_status", "pending")
            .await?;
        let mut records = rows
            .into_iter()
            .map(parse_record)
            .collect::<SyncResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Fetches one record.
    pub async fn get(&self, id: &str) -> SyncResult<Option<ConflictRecord>> {
        self.backend
            .select_one(self.table, id)
            .await?
            .map(parse_record)
            .transpose()
    }

    /// Persists the resolution fields of `record`.
    pub async fn mark_resolved(&self, record: &ConflictRecord) -> SyncResult<()> {
        debug_assert_eq!(record.resolution_status, ResolutionStatus::Resolved);
        let changes = json!({
            "resolution_status": record.resolution_status,
            "resolution": record.resolution,
            "resolved_at": record.resolved_at,
            "resolution_notes": record.resolution_notes,
        });
        self.backend.update(self.table, &record.id, changes).await?;
        Ok(())
    }
}

fn parse_record(row: Value) -> SyncResult<ConflictRecord> {
    serde_json::from_value(row).map_err(|e| SyncError::MalformedConflict(e.to_string()))
}

/// Removes server-owned fields from a snapshot before writing it back.
pub(crate) fn writable_snapshot(snapshot: &Value) -> Value {
    match snapshot {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "version")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
