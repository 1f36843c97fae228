//! Retry scheduling.
//!
//! A failed entry that may be retried gets a [`ScheduledRetry`]. When the
//! retry fires it sends a [`SyncTrigger::RetryTimer`] to the engine, and
//! the next drain pass picks the entry up. Timers are not persisted: after
//! a restart, eligible entries wait for the next trigger.

use opsync_protocol::ClientId;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a drain pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// A new entry was queued.
    Enqueued,
    /// The network came back.
    NetworkOnline,
    /// The user asked for a sync.
    Manual,
    /// A backoff delay elapsed.
    RetryTimer {
        /// Entry the retry was scheduled for.
        client_id: ClientId,
        /// Attempts made when it was scheduled.
        attempt: u32,
    },
}

/// A pending backoff retry.
#[derive(Debug)]
pub struct ScheduledRetry {
    /// Entry to retry.
    pub client_id: ClientId,
    /// Failed attempts so far.
    pub attempt: u32,
    /// How long to wait before firing.
    pub delay: Duration,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
}

impl ScheduledRetry {
    pub(crate) fn new(
        client_id: ClientId,
        attempt: u32,
        delay: Duration,
        triggers: mpsc::UnboundedSender<SyncTrigger>,
    ) -> Self {
        Self {
            client_id,
            attempt,
            delay,
            triggers,
        }
    }

    /// The trigger this retry sends.
    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger::RetryTimer {
            client_id: self.client_id,
            attempt: self.attempt,
        }
    }

    /// Requests a drain pass. Returns false if the engine is gone.
    pub fn fire(self) -> bool {
        self.triggers.send(self.trigger()).is_ok()
    }
}

/// Runs [`ScheduledRetry`]s after their delay.
pub trait RetryScheduler: Send + Sync {
    /// Arranges for `retry.fire()` to be called after `retry.delay`.
    fn schedule(&self, retry: ScheduledRetry);
}

/// Fires retries from tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl RetryScheduler for TokioScheduler {
    fn schedule(&self, retry: ScheduledRetry) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                client_id = %retry.client_id,
                "no tokio runtime; retry not scheduled"
            );
            return;
        };
        handle.spawn(async move {
            tokio::time::sleep(retry.delay).await;
            let client_id = retry.client_id;
            if !retry.fire() {
                tracing::debug!(%client_id, "engine dropped before retry fired");
            }
        });
    }
}

/// Holds retries until the test fires them.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<ScheduledRetry>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(client_id, attempt, delay)` of every retry not yet fired.
    pub fn pending(&self) -> Vec<(ClientId, u32, Duration)> {
        self.pending
            .lock()
            .iter()
            .map(|r| (r.client_id, r.attempt, r.delay))
            .collect()
    }

    /// Number of retries not yet fired.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if no retries are waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Fires every waiting retry. Returns how many were delivered.
    pub fn fire_all(&self) -> usize {
        let retries: Vec<_> = self.pending.lock().drain(..).collect();
        retries
            .into_iter()
            .map(ScheduledRetry::fire)
            .filter(|delivered| *delivered)
            .count()
    }

    /// Drops every waiting retry without firing.
    pub fn cancel_all(&self) -> usize {
        self.pending.lock().drain(..).count()
    }
}

impl RetryScheduler for ManualScheduler {
    fn schedule(&self, retry: ScheduledRetry) {
        self.pending.lock().push(retry);
    }
}

impl<T: RetryScheduler + ?Sized> RetryScheduler for std::sync::Arc<T> {
    fn schedule(&self, retry: ScheduledRetry) {
        (**self).schedule(retry)
    }
}
