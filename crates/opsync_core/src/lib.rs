//! # opsync Core
//!
//! The crash-durable local queue that holds mutations until they are
//! applied to the remote backend.
//!
//! - [`QueueStore`] is the contract the sync engine writes through
//! - [`DurableQueue`] persists entries in a checksummed append-only log
//!   inside a locked directory
//! - [`MemoryQueue`] keeps entries in memory for tests and ephemeral use
//!
//! Entry invariants (immutable client id, non-decreasing attempt count,
//! frozen completed entries) are enforced at the store boundary.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
mod durable;
mod error;
pub mod log;
mod stats;
mod store;

pub use config::QueueConfig;
pub use dir::QueueDir;
pub use durable::{CompactionStats, DurableQueue, RecoveryInfo, UndecodableEntry, VerifyReport};
pub use error::{CoreError, CoreResult};
pub use stats::QueueStats;
pub use store::{check_update, MemoryQueue, QueueStore, UpdateGuard};
