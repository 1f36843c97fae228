//! Version conflicts between a queued update and the server record.

use crate::entry::ClientId;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Version assumed when a record or payload carries none.
pub const DEFAULT_VERSION: i64 = 1;

/// Reads a `version` field value, falling back to [`DEFAULT_VERSION`].
///
/// Integers, integral floats and numeric strings are accepted; anything
/// else counts as absent.
pub fn record_version(version: Option<&Value>) -> i64 {
    match version {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .unwrap_or(DEFAULT_VERSION),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_VERSION),
        _ => DEFAULT_VERSION,
    }
}

/// The two versions that disagreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMismatch {
    /// Version the queued payload was based on.
    pub client_version: i64,
    /// Version currently stored on the server.
    pub server_version: i64,
}

/// Compares a queued payload against the current server record.
///
/// Returns a mismatch only when the server has moved past the version the
/// client last read. Equal versions, or a client ahead of the server, are
/// not conflicts.
pub fn detect_version_conflict(
    client_payload: &crate::Payload,
    server_record: &Value,
) -> Option<VersionMismatch> {
    let client_version = client_payload.version();
    let server_version = record_version(server_record.get("version"));
    (server_version > client_version).then_some(VersionMismatch {
        client_version,
        server_version,
    })
}

/// Resolution state of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    /// Awaiting a human decision.
    Pending,
    /// A snapshot was chosen and written back.
    Resolved,
}

/// Which snapshot won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// The queued client data overwrote the server record.
    UseClient,
    /// The server record was kept.
    UseServer,
}

/// A durable record of a detected version mismatch.
///
/// Stored in the remote conflicts table. Never deleted automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict identifier.
    pub id: String,
    /// Table of the conflicting record.
    pub table_name: String,
    /// Id of the conflicting record.
    pub record_id: String,
    /// Queue entry whose apply was blocked.
    pub queue_entry_client_id: ClientId,
    /// Queued payload at detection time.
    pub client_data: Value,
    /// Server record at detection time.
    pub server_data: Value,
    /// Resolution state.
    pub resolution_status: ResolutionStatus,
    /// Snapshot chosen on resolution.
    #[serde(default)]
    pub resolution: Option<ConflictResolution>,
    /// Detection time.
    pub created_at: Timestamp,
    /// Resolution time.
    #[serde(default)]
    pub resolved_at: Option<Timestamp>,
    /// Free-form notes recorded on resolution.
    #[serde(default)]
    pub resolution_notes: Option<String>,
}

impl ConflictRecord {
    /// Files a new pending conflict.
    pub fn new(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        queue_entry_client_id: ClientId,
        client_data: Value,
        server_data: Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table_name: table_name.into(),
            record_id: record_id.into(),
            queue_entry_client_id,
            client_data,
            server_data,
            resolution_status: ResolutionStatus::Pending,
            resolution: None,
            created_at: now,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    /// Returns true while awaiting resolution.
    pub fn is_pending(&self) -> bool {
        self.resolution_status == ResolutionStatus::Pending
    }

    /// The snapshot that `resolution` selects.
    pub fn snapshot_for(&self, resolution: ConflictResolution) -> &Value {
        match resolution {
            ConflictResolution::UseClient => &self.client_data,
            ConflictResolution::UseServer => &self.server_data,
        }
    }

    /// Marks the conflict resolved.
    pub fn resolve(&mut self, resolution: ConflictResolution, notes: Option<String>, now: Timestamp) {
        self.resolution_status = ResolutionStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_at = Some(now);
        self.resolution_notes = notes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn stale_client_version_conflicts() {
        let client = Payload::new().with("version", 1).with("price", 5);
        let server = json!({"id": "p1", "version": 2, "price": 4});

        let mismatch = detect_version_conflict(&client, &server).unwrap();
        assert_eq!(mismatch.client_version, 1);
        assert_eq!(mismatch.server_version, 2);
    }

    #[test]
    fn equal_or_newer_client_version_passes() {
        let server = json!({"version": 3});
        assert!(detect_version_conflict(&Payload::new().with("version", 3), &server).is_none());
        assert!(detect_version_conflict(&Payload::new().with("version", 4), &server).is_none());
    }

    #[test]
    fn missing_versions_default_to_one() {
        assert!(detect_version_conflict(&Payload::new(), &json!({"id": "x"})).is_none());
        let mismatch = detect_version_conflict(&Payload::new(), &json!({"version": 2})).unwrap();
        assert_eq!(mismatch.client_version, DEFAULT_VERSION);
    }

    #[test]
    fn record_version_parsing() {
        assert_eq!(record_version(Some(&json!(5.0))), 5);
        assert_eq!(record_version(Some(&json!(5.5))), DEFAULT_VERSION);
        assert_eq!(record_version(Some(&json!(" 9 "))), 9);
        assert_eq!(record_version(Some(&json!(true))), DEFAULT_VERSION);
        assert_eq!(record_version(None), DEFAULT_VERSION);
    }

    #[test]
    fn resolving_records_choice() {
        let mut record = ConflictRecord::new(
            "products",
            "p1",
            ClientId::new(),
            json!({"version": 1, "price": 5}),
            json!({"version": 2, "price": 4}),
            Utc::now(),
        );
        assert!(record.is_pending());

        record.resolve(ConflictResolution::UseServer, Some("kept HQ price".into()), Utc::now());
        assert!(!record.is_pending());
        assert_eq!(record.resolution, Some(ConflictResolution::UseServer));
        assert_eq!(record.snapshot_for(ConflictResolution::UseServer)["price"], 4);
    }

    #[test]
    fn row_shape_is_snake_case() {
        let record = ConflictRecord::new("staff", "s1", ClientId::new(), json!({}), json!({}), Utc::now());
        let row = serde_json::to_value(&record).unwrap();
        assert_eq!(row["resolution_status"], "pending");
        assert!(row.get("queue_entry_client_id").is_some());

        let back: ConflictRecord = serde_json::from_value(row).unwrap();
        assert_eq!(back, record);
    }
}
