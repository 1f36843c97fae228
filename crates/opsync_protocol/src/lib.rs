//! # opsync Protocol
//!
//! Data model shared by the durable queue and the sync engine:
//!
//! - [`QueueEntry`] and its state machine ([`QueueStatus`])
//! - [`OperationType`], [`ErrorKind`] and the [`Payload`] field map
//! - [`ConflictRecord`] and optimistic version comparison
//! - the [`Validator`] capability and a table-keyed [`SchemaValidator`]
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entry;
mod error;
mod operation;
mod payload;
mod validation;

pub use conflict::{
    detect_version_conflict, record_version, ConflictRecord, ConflictResolution,
    ResolutionStatus, VersionMismatch, DEFAULT_VERSION,
};
pub use entry::{ClientId, QueueEntry, QueueStatus};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{ErrorKind, OperationType};
pub use payload::Payload;
pub use validation::{
    check_target, AcceptAll, FieldKind, SchemaValidator, TableSchema, ValidationCode, ValidationError,
    ValidationErrors, Validator,
};

/// Wall-clock timestamp used on entries and conflict records.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
