//! Error types for the sync engine.

use crate::backend::BackendError;
use opsync_codec::CodecError;
use opsync_core::CoreError;
use opsync_protocol::{ClientId, ProtocolError, ValidationErrors};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by [`crate::SyncEngine`] operations.
///
/// Failures while applying an entry are not returned here; they are
/// recorded on the entry itself.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] CoreError),

    /// An entry could not be built or moved.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The remote backend failed outside of an entry apply.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A manually retried entry still fails validation.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// No entry with this id.
    #[error("queue entry {client_id} not found")]
    EntryNotFound {
        /// Requested id.
        client_id: ClientId,
    },

    /// No conflict record with this id.
    #[error("conflict {id} not found")]
    ConflictNotFound {
        /// Requested id.
        id: String,
    },

    /// The conflict record was already resolved.
    #[error("conflict {id} already resolved")]
    ConflictAlreadyResolved {
        /// Requested id.
        id: String,
    },

    /// A stored conflict record could not be read.
    #[error("malformed conflict record: {0}")]
    MalformedConflict(String),

    /// `spawn` was called while a driver is already running.
    #[error("sync driver already running")]
    DriverRunning,
}

impl SyncError {
    /// Returns true if the error came from the remote backend being
    /// unreachable.
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::Backend(e) if e.offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::ConflictNotFound { id: "c9".into() };
        assert_eq!(err.to_string(), "conflict c9 not found");

        let err = SyncError::from(BackendError::offline("no route"));
        assert!(err.is_offline());
        assert_eq!(err.to_string(), "backend error: no route");

        assert!(!SyncError::DriverRunning.is_offline());
    }
}
