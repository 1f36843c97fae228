//! # opsync Sync Engine
//!
//! Applies locally queued mutations to a remote relational backend.
//!
//! This crate provides:
//! - [`SyncEngine`]: enqueue, drain passes, manual retry and conflict resolution
//! - the [`RemoteBackend`] boundary, with [`MemoryBackend`] and a
//!   PostgREST-style [`RestBackend`]
//! - [`NetworkMonitor`] with transition subscriptions
//! - retry scheduling with exponential backoff ([`RetryScheduler`])
//! - metrics reporting ([`MetricsRecorder`])
//!
//! ## Drain passes
//!
//! A pass loads the queue, selects every `pending` entry and every
//! `failed` entry that may still be retried, and applies them one at a
//! time in enqueue order:
//!
//! 1. the entry is marked `processing` and persisted
//! 2. updates are checked against the server record's `version`; a stale
//!    update files a [`ConflictRecord`] and is never applied
//! 3. the operation is sent to the backend
//! 4. the entry ends `completed`, or `failed` with a classified error and,
//!    while attempts remain, a backoff retry is scheduled
//!
//! ## Key Invariants
//!
//! - At most one drain pass runs at a time
//! - `attempt_count` never decreases
//! - Completed entries are never touched again
//! - Entry writes outside a pass are conditional on the status read, so
//!   a stale snapshot never overwrites an entry a pass has claimed
//! - Version conflicts are never retried automatically
//!
//! [`ConflictRecord`]: opsync_protocol::ConflictRecord

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
mod config;
mod conflicts;
mod engine;
mod error;
mod metrics;
mod network;
mod scheduler;

pub use backend::{
    BackendCall, BackendError, HttpClient, HttpRequest, HttpResponse, MemoryBackend, Method,
    Record, RemoteBackend, RestBackend,
};
pub use config::{RetryConfig, SyncConfig, DEFAULT_CONFLICT_TABLE};
pub use conflicts::{detect_conflict, ConflictStore, DetectedConflict};
pub use engine::{
    DrainOutcome, DrainReport, DriverHandle, EngineStatus, SkipReason, SyncEngine,
    SyncEngineBuilder,
};
pub use error::{SyncError, SyncResult};
pub use metrics::{MemoryMetrics, MetricEvent, MetricsRecorder, NoopMetrics, TracingMetrics};
pub use network::{NetworkEvent, NetworkMonitor, NetworkQuality, NetworkState, Subscription};
pub use scheduler::{ManualScheduler, RetryScheduler, ScheduledRetry, SyncTrigger, TokioScheduler};
