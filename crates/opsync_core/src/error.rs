//! Error types for the durable queue.

use opsync_protocol::{ClientId, ProtocolError, QueueStatus};
use std::io;
use thiserror::Error;

/// Result type for queue operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by a [`crate::QueueStore`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] opsync_storage::StorageError),

    /// Entry encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] opsync_codec::CodecError),

    /// Entry state machine error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The queue log is malformed.
    #[error("queue log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Offset of the bad record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A complete record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the bad record.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// Another process holds the queue directory.
    #[error("queue locked: another process has exclusive access")]
    QueueLocked,

    /// The queue directory is missing or not a directory.
    #[error("invalid queue directory: {message}")]
    InvalidDirectory {
        /// What is wrong with it.
        message: String,
    },

    /// `add` was called with a client id already in the queue.
    #[error("entry {client_id} already exists")]
    DuplicateEntry {
        /// The existing id.
        client_id: ClientId,
    },

    /// No entry has this client id.
    #[error("entry {client_id} not found")]
    NotFound {
        /// The missing id.
        client_id: ClientId,
    },

    /// A conditional update found the entry in a different status than
    /// the caller read.
    #[error("entry {client_id} is {actual}, expected {expected}")]
    StatusChanged {
        /// The entry being updated.
        client_id: ClientId,
        /// Status the caller read.
        expected: QueueStatus,
        /// Status currently stored.
        actual: QueueStatus,
    },

    /// An update would break an entry invariant.
    #[error("invalid update of entry {client_id}: {message}")]
    InvalidUpdate {
        /// The entry being updated.
        client_id: ClientId,
        /// The invariant that would break.
        message: String,
    },
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid update error.
    pub fn invalid_update(client_id: ClientId, message: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            client_id,
            message: message.into(),
        }
    }

    /// Returns true if the on-disk log is damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::LogCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
