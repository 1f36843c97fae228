//! Queue entries and their state machine.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{ErrorKind, OperationType};
use crate::payload::Payload;
use crate::validation::ValidationErrors;
use crate::Timestamp;
use chrono::Utc;
use opsync_codec::{compress_with_threshold, decompress, CodecError, CompressionAlgorithm};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Client-generated identifier of a queue entry. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a queue entry.
///
/// ```text
/// pending ──────► processing ──────► completed
///  ▲   │            ▲    │
///  │   │            │    ▼
///  │   └─────────► failed
///  └──────────────────┘
/// ```
///
/// `completed` is terminal. A manual retry moves `failed` back to
/// `pending`. An automatic retry skips `pending` and claims a failed
/// entry straight into `processing`; the entry stays untouched in the
/// store until the drain pass that picked it up claims it.
///
/// `processing` never moves back to `pending` through this table. Only
/// [`QueueEntry::recover_interrupted`] does that, for entries a crashed
/// pass left behind, and stores accept it through a dedicated path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for a drain pass.
    Pending,
    /// Being applied by the current drain pass.
    Processing,
    /// Applied successfully.
    Completed,
    /// Last attempt failed; see the entry's error fields.
    Failed,
}

impl QueueStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [QueueStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns true if the state machine allows moving to `next`.
    pub const fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Failed)
                | (Failed, Pending)
                | (Failed, Processing)
        )
    }

    /// Lowercase name as persisted.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

/// A single locally recorded mutation.
///
/// Exactly one of `payload` and `compressed_payload` is authoritative: when
/// `compression_algorithm` is not `none` the plain payload is absent and is
/// rebuilt on demand by [`QueueEntry::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Primary key.
    pub client_id: ClientId,
    /// Kind of write.
    pub operation_type: OperationType,
    /// Target table, opaque to the engine.
    pub table_name: String,
    /// Target record; set for update/delete, and for creates once applied.
    pub record_id: Option<String>,
    /// Uncompressed field data.
    pub payload: Option<Payload>,
    /// Compressed field data.
    #[serde(default, with = "opt_bytes")]
    pub compressed_payload: Option<Vec<u8>>,
    /// How `compressed_payload` was produced.
    #[serde(default)]
    pub compression_algorithm: CompressionAlgorithm,
    /// Lifecycle status.
    pub status: QueueStatus,
    /// Apply attempts made so far. Never decreases.
    pub attempt_count: u32,
    /// Classification of the last failure.
    pub error_type: Option<ErrorKind>,
    /// Human-readable last failure.
    pub error_message: Option<String>,
    /// Structured diagnostics for the last failure.
    pub error_details: Option<Value>,
    /// Conflict record filed against this entry, if any.
    #[serde(default)]
    pub conflict_id: Option<String>,
    /// When the entry was queued.
    pub created_at: Timestamp,
    /// Last state change.
    pub updated_at: Timestamp,
    /// Time of the last failed attempt.
    pub last_retry_at: Option<Timestamp>,
}

impl QueueEntry {
    /// Builds a pending entry, compressing the payload when its JSON form
    /// reaches `compression_threshold` bytes.
    pub fn new(
        operation_type: OperationType,
        table_name: impl Into<String>,
        record_id: Option<String>,
        payload: Payload,
        compression_threshold: usize,
    ) -> ProtocolResult<Self> {
        if operation_type.requires_record_id() && record_id.is_none() {
            return Err(ProtocolError::MissingRecordId {
                operation: operation_type,
            });
        }
        Self::build(operation_type, table_name.into(), record_id, payload, compression_threshold)
    }

    /// Builds an entry that failed validation before it was queued.
    ///
    /// The entry starts `failed` with [`ErrorKind::Validation`] and no
    /// attempts. A missing record id is accepted here and is expected to
    /// be one of `errors`.
    pub fn rejected(
        operation_type: OperationType,
        table_name: impl Into<String>,
        record_id: Option<String>,
        payload: Payload,
        compression_threshold: usize,
        errors: &ValidationErrors,
    ) -> ProtocolResult<Self> {
        let mut entry = Self::build(
            operation_type,
            table_name.into(),
            record_id,
            payload,
            compression_threshold,
        )?;
        entry.reject(ErrorKind::Validation, errors.to_string(), Some(errors.to_details()))?;
        Ok(entry)
    }

    fn build(
        operation_type: OperationType,
        table_name: String,
        record_id: Option<String>,
        payload: Payload,
        compression_threshold: usize,
    ) -> ProtocolResult<Self> {
        let compressed = compress_with_threshold(&payload.to_value(), compression_threshold)?;
        let (payload, compressed_payload) = if compressed.is_compressed() {
            (None, Some(compressed.bytes))
        } else {
            (Some(payload), None)
        };

        let now = Utc::now();
        Ok(Self {
            client_id: ClientId::new(),
            operation_type,
            table_name,
            record_id,
            payload,
            compressed_payload,
            compression_algorithm: compressed.algorithm,
            status: QueueStatus::Pending,
            attempt_count: 0,
            error_type: None,
            error_message: None,
            error_details: None,
            conflict_id: None,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
        })
    }

    /// Returns the field data, decompressing if needed.
    ///
    /// Fails with a decode error if the stored bytes are corrupt.
    pub fn payload(&self) -> ProtocolResult<Payload> {
        match self.compression_algorithm {
            CompressionAlgorithm::None => Ok(self.payload.clone().unwrap_or_default()),
            algorithm => {
                let bytes = self.compressed_payload.as_deref().ok_or_else(|| {
                    CodecError::decode(format!("{algorithm} payload has no stored bytes"))
                })?;
                match decompress(bytes, algorithm)? {
                    Some(value) => Payload::from_value(value).map_err(|e| {
                        ProtocolError::Codec(CodecError::decode(e.to_string()))
                    }),
                    None => Ok(Payload::new()),
                }
            }
        }
    }

    /// Returns true if the stored payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.compression_algorithm != CompressionAlgorithm::None
    }

    fn transition(&mut self, next: QueueStatus) -> ProtocolResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Claims the entry for the running drain pass.
    pub fn mark_processing(&mut self) -> ProtocolResult<()> {
        self.transition(QueueStatus::Processing)
    }

    /// Records a successful apply. `server_id` is the id assigned to a create.
    pub fn mark_completed(&mut self, server_id: Option<String>) -> ProtocolResult<()> {
        self.transition(QueueStatus::Completed)?;
        if self.record_id.is_none() {
            self.record_id = server_id;
        }
        self.error_type = None;
        self.error_message = None;
        self.error_details = None;
        Ok(())
    }

    /// Records a failed apply attempt and bumps the attempt counter.
    pub fn record_failure(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ProtocolResult<()> {
        self.transition(QueueStatus::Failed)?;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_retry_at = Some(self.updated_at);
        self.set_error(kind, message.into(), details);
        Ok(())
    }

    /// Fails the entry without counting an apply attempt.
    ///
    /// Used for enqueue-time validation failures, where nothing reached
    /// the backend.
    pub fn reject(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ProtocolResult<()> {
        self.transition(QueueStatus::Failed)?;
        self.set_error(kind, message.into(), details);
        Ok(())
    }

    /// Fails the entry because a conflict record was filed against it.
    ///
    /// Does not count an attempt. The entry stays out of automatic
    /// processing until the conflict is resolved by hand.
    pub fn mark_conflicted(
        &mut self,
        conflict_id: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ProtocolResult<()> {
        self.transition(QueueStatus::Failed)?;
        self.conflict_id = Some(conflict_id.into());
        self.set_error(ErrorKind::Conflict, message.into(), details);
        Ok(())
    }

    fn set_error(&mut self, kind: ErrorKind, message: String, details: Option<Value>) {
        self.error_type = Some(kind);
        self.error_message = Some(message);
        self.error_details = details;
    }

    /// Returns an entry interrupted mid-apply to `pending`.
    ///
    /// This is the only way out of `processing` other than finishing the
    /// apply, so it is not part of [`QueueStatus::can_transition_to`].
    pub fn recover_interrupted(&mut self) -> ProtocolResult<()> {
        if self.status != QueueStatus::Processing {
            return Err(ProtocolError::InvalidTransition {
                from: self.status,
                to: QueueStatus::Pending,
            });
        }
        self.status = QueueStatus::Pending;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Checks whether a user may manually retry this entry.
    ///
    /// Completed entries and entries with a filed conflict record are
    /// refused. Validation failures must be re-validated by the caller.
    pub fn check_manual_retry(&self) -> ProtocolResult<()> {
        let refuse = |reason| {
            Err(ProtocolError::RetryRefused {
                client_id: self.client_id,
                reason,
            })
        };
        match self.status {
            QueueStatus::Completed => refuse("entry already completed"),
            QueueStatus::Processing => refuse("entry is being applied"),
            QueueStatus::Pending => refuse("entry is already pending"),
            QueueStatus::Failed if self.conflict_id.is_some() => {
                refuse("entry has a conflict record; resolve the conflict instead")
            }
            QueueStatus::Failed => Ok(()),
        }
    }

    /// Moves a failed entry back to `pending` for one more apply.
    ///
    /// The attempt counter is preserved.
    pub fn requeue(&mut self) -> ProtocolResult<()> {
        self.check_manual_retry()?;
        self.transition(QueueStatus::Pending)?;
        self.error_type = None;
        self.error_message = None;
        self.error_details = None;
        Ok(())
    }

    /// Returns true if a drain pass should pick this entry up on its own.
    pub fn is_auto_eligible(&self, max_attempts: u32, retry_authorization: bool) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Failed => {
                self.conflict_id.is_none()
                    && self.attempt_count < max_attempts
                    && match self.error_type {
                        Some(ErrorKind::Authorization) => retry_authorization,
                        Some(kind) => kind.is_transient(),
                        None => false,
                    }
            }
            QueueStatus::Processing | QueueStatus::Completed => false,
        }
    }

    /// Returns true if the entry failed and has used up its attempts.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == QueueStatus::Failed && self.attempt_count >= max_attempts
    }

    /// Returns true if the entry is a candidate for the next backoff retry.
    pub fn wants_retry(&self, max_attempts: u32, retry_authorization: bool) -> bool {
        self.status == QueueStatus::Failed && self.is_auto_eligible(max_attempts, retry_authorization)
    }
}

mod opt_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&Bytes(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        d.deserialize_option(OptVisitor)
    }

    struct Bytes<'a>(&'a [u8]);

    impl serde::Serialize for Bytes<'_> {
        fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_bytes(self.0)
        }
    }

    struct OptVisitor;

    impl<'de> Visitor<'de> for OptVisitor {
        type Value = Option<Vec<u8>>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("optional byte string")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_byte_buf(BytesVisitor).map(Some)
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_codec::{from_cbor, to_cbor, COMPRESSION_THRESHOLD};

    fn small_update() -> QueueEntry {
        QueueEntry::new(
            OperationType::Update,
            "products",
            Some("p1".into()),
            Payload::new().with("price", 10).with("version", 1),
            COMPRESSION_THRESHOLD,
        )
        .unwrap()
    }

    fn large_payload() -> Payload {
        Payload::new()
            .with("name", "Bulk import")
            .with("notes", "x".repeat(4096))
    }

    #[test]
    fn new_entry_is_pending() {
        let entry = small_update();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert!(!entry.is_compressed());
        assert!(entry.payload.is_some());
        assert!(entry.compressed_payload.is_none());
    }

    #[test]
    fn update_and_delete_need_record_id() {
        let err = QueueEntry::new(OperationType::Delete, "staff", None, Payload::new(), 1024)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingRecordId {
                operation: OperationType::Delete
            }
        ));
        assert!(QueueEntry::new(OperationType::Create, "staff", None, Payload::new(), 1024).is_ok());
    }

    #[test]
    fn rejected_entry_keeps_missing_target() {
        let errors = ValidationErrors::from(
            crate::validation::check_target(OperationType::Update, None).unwrap_err(),
        );
        let entry = QueueEntry::rejected(
            OperationType::Update,
            "staff",
            None,
            Payload::new().with("role", "lead"),
            1024,
            &errors,
        )
        .unwrap();

        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.error_type, Some(ErrorKind::Validation));
        assert_eq!(entry.attempt_count, 0);
        assert!(entry.record_id.is_none());
        assert!(!entry.is_auto_eligible(3, true));
        assert_eq!(
            entry.error_details.unwrap()["validation_errors"][0]["field"],
            "record_id"
        );
    }

    #[test]
    fn large_payload_stored_compressed_only() {
        let payload = large_payload();
        let entry =
            QueueEntry::new(OperationType::Create, "products", None, payload.clone(), 1024).unwrap();

        assert!(entry.is_compressed());
        assert!(entry.payload.is_none());
        assert!(entry.compressed_payload.is_some());
        assert_eq!(entry.payload().unwrap(), payload);
    }

    #[test]
    fn corrupt_compressed_payload_is_decode_error() {
        let mut entry =
            QueueEntry::new(OperationType::Create, "products", None, large_payload(), 1024).unwrap();
        entry.compressed_payload = Some(vec![0xde, 0xad, 0xbe, 0xef]);

        let err = entry.payload().unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn failure_counts_attempt() {
        let mut entry = small_update();
        entry.mark_processing().unwrap();
        entry
            .record_failure(ErrorKind::Network, "offline", None)
            .unwrap();

        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_retry_at.is_some());
        assert!(entry.is_auto_eligible(3, false));
    }

    #[test]
    fn completed_is_terminal() {
        let mut entry = small_update();
        entry.mark_processing().unwrap();
        entry.mark_completed(None).unwrap();

        assert!(entry.mark_processing().is_err());
        assert!(entry.requeue().is_err());
        assert!(!entry.is_auto_eligible(3, true));
    }

    #[test]
    fn create_takes_server_id() {
        let mut entry =
            QueueEntry::new(OperationType::Create, "stores", None, Payload::new(), 1024).unwrap();
        entry.mark_processing().unwrap();
        entry.mark_completed(Some("srv-9".into())).unwrap();
        assert_eq!(entry.record_id.as_deref(), Some("srv-9"));
    }

    #[test]
    fn exhausted_entry_not_auto_eligible_but_requeueable() {
        let mut entry = small_update();
        for _ in 0..3 {
            entry.mark_processing().unwrap();
            entry
                .record_failure(ErrorKind::Unknown, "server error", None)
                .unwrap();
        }
        assert!(entry.is_exhausted(3));
        assert!(!entry.is_auto_eligible(3, false));

        entry.requeue().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempt_count, 3);
        assert!(entry.is_auto_eligible(3, false));
    }

    #[test]
    fn authorization_failures_escalate_unless_configured() {
        let mut entry = small_update();
        entry.mark_processing().unwrap();
        entry
            .record_failure(ErrorKind::Authorization, "401", None)
            .unwrap();

        assert!(!entry.is_auto_eligible(3, false));
        assert!(entry.is_auto_eligible(3, true));
        assert!(entry.check_manual_retry().is_ok());
    }

    #[test]
    fn conflicted_entry_is_stuck() {
        let mut entry = small_update();
        entry.mark_processing().unwrap();
        entry
            .mark_conflicted("c-1", "server version 2 is newer than 1", None)
            .unwrap();

        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.error_type, Some(ErrorKind::Conflict));
        assert!(!entry.is_auto_eligible(3, true));
        assert!(matches!(
            entry.requeue().unwrap_err(),
            ProtocolError::RetryRefused { .. }
        ));
    }

    #[test]
    fn interrupted_entry_recovers_to_pending() {
        let mut entry = small_update();
        assert!(entry.recover_interrupted().is_err());
        entry.mark_processing().unwrap();
        entry.recover_interrupted().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
    }

    #[test]
    fn processing_only_leaves_through_apply_outcome() {
        use QueueStatus::*;
        assert!(!Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn cbor_roundtrip_keeps_compressed_bytes() {
        let entry =
            QueueEntry::new(OperationType::Create, "products", None, large_payload(), 1024).unwrap();
        let bytes = to_cbor(&entry).unwrap();
        let decoded: QueueEntry = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn status_parse() {
        assert_eq!("failed".parse::<QueueStatus>().unwrap(), QueueStatus::Failed);
        assert!("done".parse::<QueueStatus>().is_err());
    }
}
