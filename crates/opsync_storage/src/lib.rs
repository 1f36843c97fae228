//! # opsync Storage
//!
//! Append-only byte stores that back the opsync mutation queue log.
//!
//! Backends never interpret what they hold. The queue log framing,
//! checksums and entry encoding all live in `opsync_core`; a backend only
//! has to read, append, flush and truncate bytes.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral queues and tests
//! - [`FileBackend`] - the on-disk queue log
//!
//! ```rust
//! use opsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"queued").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"queued");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
