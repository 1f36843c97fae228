//! Error types for the protocol crate.

use crate::entry::QueueStatus;
use opsync_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by entry transitions and payload handling.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The entry state machine forbids this transition.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: QueueStatus,
        /// Requested status.
        to: QueueStatus,
    },

    /// A payload was not a JSON object.
    #[error("payload must be a JSON object, got {found}")]
    PayloadNotObject {
        /// JSON type that was found instead.
        found: &'static str,
    },

    /// Update and delete operations need a target record.
    #[error("{operation} operations require a record id")]
    MissingRecordId {
        /// The operation missing its target.
        operation: crate::OperationType,
    },

    /// A manual retry was requested for an entry that may not be retried.
    #[error("entry {client_id} cannot be retried: {reason}")]
    RetryRefused {
        /// The entry.
        client_id: crate::ClientId,
        /// Why it was refused.
        reason: &'static str,
    },

    /// Compression or decompression failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ProtocolError {
    /// Returns true if stored payload bytes could not be decoded.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Codec(e) if e.is_decode())
    }
}
