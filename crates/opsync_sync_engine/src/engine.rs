//! The sync engine: enqueue, drain passes, retries and conflict resolution.

use crate::backend::{record_id, BackendError, RemoteBackend};
use crate::config::SyncConfig;
use crate::conflicts::{detect_conflict, writable_snapshot, ConflictStore, DetectedConflict};
use crate::error::{SyncError, SyncResult};
use crate::metrics::{MetricEvent, MetricsRecorder, TracingMetrics};
use crate::network::{NetworkEvent, NetworkMonitor, Subscription};
use crate::scheduler::{RetryScheduler, ScheduledRetry, SyncTrigger, TokioScheduler};
use chrono::Utc;
use opsync_core::{CoreError, QueueStats, QueueStore, UpdateGuard};
use opsync_protocol::{
    check_target, AcceptAll, ClientId, ConflictRecord, ConflictResolution, ErrorKind,
    OperationType, Payload, QueueEntry, QueueStatus, ValidationErrors, Validator,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Entries eligible when the pass started.
    pub selected: usize,
    /// Entries applied.
    pub completed: usize,
    /// Entries whose apply failed.
    pub failed: usize,
    /// Entries blocked by a version conflict.
    pub conflicted: usize,
    /// Backoff retries scheduled.
    pub retries_scheduled: usize,
    /// Entries returned to pending after an interrupted pass.
    pub recovered: usize,
    /// Entries skipped because their queue record could not be written.
    pub errors: usize,
    /// True if the pass stopped early because the network went away.
    pub stopped_offline: bool,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl DrainReport {
    /// Entries the pass actually touched.
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.conflicted
    }
}

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass holds the drain guard.
    AlreadyRunning,
    /// The network monitor reports offline.
    Offline,
}

/// Result of asking for a drain pass.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// A pass ran to the end.
    Completed(DrainReport),
    /// No pass ran.
    Skipped(SkipReason),
}

impl DrainOutcome {
    /// The report, if a pass ran.
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }

    /// Returns true if no pass ran.
    pub fn is_skipped(&self) -> bool {
        matches!(self, DrainOutcome::Skipped(_))
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    /// A drain pass is running.
    pub draining: bool,
    /// The network monitor reports online.
    pub online: bool,
    /// The most recent finished pass.
    pub last_drain: Option<DrainReport>,
}

enum EntryOutcome {
    Applied,
    Failed { retry_scheduled: bool },
    Conflicted,
    /// Another writer changed the entry before it could be claimed.
    Skipped,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner<B> {
    store: Arc<dyn QueueStore>,
    backend: B,
    config: SyncConfig,
    validator: Arc<dyn Validator>,
    network: NetworkMonitor,
    scheduler: Arc<dyn RetryScheduler>,
    metrics: Arc<dyn MetricsRecorder>,
    draining: AtomicBool,
    last_drain: Mutex<Option<DrainReport>>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
    _network_subscription: Subscription,
}

/// Drives queued mutations to the remote backend.
///
/// At most one drain pass runs at a time; a request made while a pass is
/// running returns [`DrainOutcome::Skipped`]. Entries are applied one at
/// a time in enqueue order. Clones share state.
pub struct SyncEngine<B: RemoteBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: RemoteBackend> Clone for SyncEngine<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder<B: RemoteBackend> {
    store: Arc<dyn QueueStore>,
    backend: B,
    config: SyncConfig,
    validator: Arc<dyn Validator>,
    network: NetworkMonitor,
    scheduler: Arc<dyn RetryScheduler>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<B: RemoteBackend> SyncEngineBuilder<B> {
    /// Sets the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the validator run on every enqueue. Defaults to [`AcceptAll`].
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the network monitor. Defaults to an always-online monitor.
    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = network;
        self
    }

    /// Sets the retry scheduler. Defaults to [`TokioScheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the metrics recorder. Defaults to [`TracingMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds the engine and subscribes it to network transitions.
    pub fn build(self) -> SyncEngine<B> {
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let online_tx = triggers.clone();
        let subscription = self.network.on_transition(move |event| {
            if event == NetworkEvent::Online {
                let _ = online_tx.send(SyncTrigger::NetworkOnline);
            }
        });

        SyncEngine {
            inner: Arc::new(Inner {
                store: self.store,
                backend: self.backend,
                config: self.config,
                validator: self.validator,
                network: self.network,
                scheduler: self.scheduler,
                metrics: self.metrics,
                draining: AtomicBool::new(false),
                last_drain: Mutex::new(None),
                triggers,
                trigger_rx: Mutex::new(Some(trigger_rx)),
                _network_subscription: subscription,
            }),
        }
    }
}

impl<B: RemoteBackend> SyncEngine<B> {
    /// Starts building an engine over `store` and `backend`.
    pub fn builder(store: Arc<dyn QueueStore>, backend: B) -> SyncEngineBuilder<B> {
        SyncEngineBuilder {
            store,
            backend,
            config: SyncConfig::default(),
            validator: Arc::new(AcceptAll),
            network: NetworkMonitor::default(),
            scheduler: Arc::new(TokioScheduler),
            metrics: Arc::new(TracingMetrics),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The network monitor.
    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// The remote backend.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// The queue store.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.inner.store
    }

    /// Records a mutation and, when online, drains the queue.
    ///
    /// A mutation that fails validation is still persisted, directly in
    /// `failed` with [`ErrorKind::Validation`], and its id is returned.
    /// An update or delete without a `record_id` is one such failure.
    pub async fn queue_operation(
        &self,
        operation: OperationType,
        table: impl Into<String>,
        record_id: Option<String>,
        payload: Payload,
    ) -> SyncResult<ClientId> {
        let table = table.into();
        let threshold = self.inner.config.compression_threshold;

        match self.validate(&table, operation, record_id.as_deref(), &payload) {
            Ok(()) => {
                let entry = QueueEntry::new(operation, table, record_id, payload, threshold)?;
                let client_id = entry.client_id;
                let compressed = entry.is_compressed();
                let table = entry.table_name.clone();
                self.inner.store.add(entry)?;
                tracing::debug!(%client_id, %operation, table = table.as_str(), compressed, "operation queued");
                self.inner.metrics.record(&MetricEvent::OperationQueued {
                    client_id,
                    operation,
                    table,
                    compressed,
                });
                if self.inner.network.is_online() {
                    self.drain_or_defer(SyncTrigger::Enqueued).await?;
                }
                Ok(client_id)
            }
            Err(errors) => {
                let entry =
                    QueueEntry::rejected(operation, table, record_id, payload, threshold, &errors)?;
                let client_id = entry.client_id;
                let table = entry.table_name.clone();
                self.inner.store.add(entry)?;
                tracing::warn!(%client_id, table = table.as_str(), %errors, "operation failed validation");
                self.inner.metrics.record(&MetricEvent::ValidationRejected {
                    client_id,
                    table,
                    errors: errors.len(),
                });
                Ok(client_id)
            }
        }
    }

    /// Runs a drain pass now.
    pub async fn force_sync_now(&self) -> SyncResult<DrainOutcome> {
        tracing::debug!("manual sync requested");
        self.drain().await
    }

    /// Returns a failed entry to `pending` and runs a drain pass if online.
    ///
    /// The attempt counter is kept. Entries that failed validation are
    /// validated again and stay failed if they still do not pass.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StatusChanged`] if a drain pass claimed the
    /// entry between the read and the write; the pass's outcome stands.
    pub async fn retry_operation(&self, client_id: ClientId) -> SyncResult<()> {
        let mut entry = self
            .inner
            .store
            .get(&client_id)?
            .ok_or(SyncError::EntryNotFound { client_id })?;
        entry.check_manual_retry()?;

        if entry.error_type == Some(ErrorKind::Validation) {
            let payload = entry.payload()?;
            self.validate(
                &entry.table_name,
                entry.operation_type,
                entry.record_id.as_deref(),
                &payload,
            )
            .map_err(SyncError::Validation)?;
        }

        entry.requeue()?;
        self.inner
            .store
            .update_if(&client_id, QueueStatus::Failed, entry)?;
        tracing::info!(%client_id, "entry requeued by user");

        if self.inner.network.is_online() {
            self.drain_or_defer(SyncTrigger::Manual).await?;
        }
        Ok(())
    }

    /// Conflict records awaiting resolution, oldest first.
    pub async fn list_pending_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.conflicts().list_pending().await
    }

    /// Writes the chosen snapshot back and marks the conflict resolved.
    ///
    /// `id` and `version` are left out of the written snapshot; the server
    /// owns them. The blocked queue entry stays failed and is not retried.
    pub async fn resolve_conflict(&self, id: &str, use_client_data: bool) -> SyncResult<ConflictRecord> {
        let conflicts = self.conflicts();
        let mut record = conflicts
            .get(id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound { id: id.to_string() })?;
        if !record.is_pending() {
            return Err(SyncError::ConflictAlreadyResolved { id: id.to_string() });
        }

        let resolution = if use_client_data {
            ConflictResolution::UseClient
        } else {
            ConflictResolution::UseServer
        };
        let snapshot = writable_snapshot(record.snapshot_for(resolution));
        self.inner
            .backend
            .update(&record.table_name, &record.record_id, snapshot)
            .await?;

        let notes = match resolution {
            ConflictResolution::UseClient => "client data written over server record",
            ConflictResolution::UseServer => "server record kept",
        };
        record.resolve(resolution, Some(notes.to_string()), Utc::now());
        conflicts.mark_resolved(&record).await?;

        if let Some(mut entry) = self.inner.store.get(&record.queue_entry_client_id)? {
            if entry.status == QueueStatus::Failed && entry.conflict_id.as_deref() == Some(id) {
                entry.error_details = Some(json!({
                    "conflict_id": record.id,
                    "resolution": resolution,
                    "resolved_at": record.resolved_at,
                }));
                entry.updated_at = Utc::now();
                let client_id = entry.client_id;
                self.inner
                    .store
                    .update_if(&client_id, QueueStatus::Failed, entry)?;
            }
        }

        tracing::info!(conflict_id = id, ?resolution, "conflict resolved");
        self.inner.metrics.record(&MetricEvent::ConflictResolved {
            conflict_id: record.id.clone(),
            used_client: use_client_data,
        });
        Ok(record)
    }

    /// Current engine state.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            draining: self.inner.draining.load(Ordering::Acquire),
            online: self.inner.network.is_online(),
            last_drain: self.inner.last_drain.lock().clone(),
        }
    }

    /// Counts of queue entries by status and failure kind.
    pub fn queue_stats(&self) -> SyncResult<QueueStats> {
        Ok(self.inner.store.stats(self.inner.config.retry.max_attempts)?)
    }

    /// Fetches one entry.
    pub fn entry(&self, client_id: &ClientId) -> SyncResult<Option<QueueEntry>> {
        Ok(self.inner.store.get(client_id)?)
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> SyncResult<Vec<QueueEntry>> {
        let mut entries = self.inner.store.get_all()?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.client_id.cmp(&b.client_id)));
        Ok(entries)
    }

    /// Runs one drain pass over every eligible entry.
    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
            tracing::debug!("drain pass already running");
            return Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning));
        };
        if !self.inner.network.is_online() {
            tracing::debug!("offline; drain pass skipped");
            return Ok(DrainOutcome::Skipped(SkipReason::Offline));
        }

        let started = Instant::now();
        let max_attempts = self.inner.config.retry.max_attempts;
        let retry_auth = self.inner.config.retry_authorization_failures;
        let mut report = DrainReport::default();

        let mut entries = self.inner.store.get_all()?;
        for entry in entries
            .iter_mut()
            .filter(|e| e.status == QueueStatus::Processing)
        {
            entry.recover_interrupted()?;
            self.inner
                .store
                .update_guarded(&entry.client_id, entry.clone(), UpdateGuard::Recover)?;
            tracing::warn!(client_id = %entry.client_id, "recovered entry left processing by an interrupted pass");
            report.recovered += 1;
        }

        let mut selected: Vec<&QueueEntry> = entries
            .iter()
            .filter(|e| e.is_auto_eligible(max_attempts, retry_auth))
            .collect();
        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.client_id.cmp(&b.client_id)));
        let selected: Vec<ClientId> = selected.into_iter().map(|e| e.client_id).collect();
        report.selected = selected.len();

        for client_id in selected {
            if !self.inner.network.is_online() {
                tracing::info!("network lost; stopping drain pass");
                report.stopped_offline = true;
                break;
            }
            // Another caller may have changed the entry since selection.
            let Some(entry) = self.inner.store.get(&client_id)? else {
                continue;
            };
            if !entry.is_auto_eligible(max_attempts, retry_auth) {
                continue;
            }
            match self.process_entry(entry).await {
                Ok(EntryOutcome::Applied) => report.completed += 1,
                Ok(EntryOutcome::Conflicted) => report.conflicted += 1,
                Ok(EntryOutcome::Failed { retry_scheduled }) => {
                    report.failed += 1;
                    if retry_scheduled {
                        report.retries_scheduled += 1;
                    }
                }
                Ok(EntryOutcome::Skipped) => {}
                Err(err) => {
                    tracing::error!(%client_id, error = %err, "could not record entry outcome; continuing pass");
                    report.errors += 1;
                }
            }
        }

        report.duration = started.elapsed();
        tracing::info!(
            selected = report.selected,
            completed = report.completed,
            failed = report.failed,
            conflicted = report.conflicted,
            retries = report.retries_scheduled,
            errors = report.errors,
            "drain pass finished"
        );
        self.inner.metrics.record(&MetricEvent::DrainCompleted {
            selected: report.selected,
            completed: report.completed,
            failed: report.failed,
            conflicted: report.conflicted,
            duration: report.duration,
        });
        *self.inner.last_drain.lock() = Some(report.clone());
        Ok(DrainOutcome::Completed(report))
    }

    /// Handles triggers queued while no driver is running.
    ///
    /// Runs one drain pass if any trigger arrived. Returns `None` when
    /// there was nothing to do or a driver owns the trigger channel.
    pub async fn poll_triggers(&self) -> SyncResult<Option<DrainOutcome>> {
        let mut received = 0usize;
        {
            let mut rx = self.inner.trigger_rx.lock();
            let Some(rx) = rx.as_mut() else {
                return Ok(None);
            };
            while let Ok(trigger) = rx.try_recv() {
                tracing::trace!(?trigger, "trigger received");
                received += 1;
            }
        }
        if received == 0 {
            return Ok(None);
        }
        self.drain().await.map(Some)
    }

    /// Starts a background task that runs a drain pass for every trigger.
    ///
    /// Triggers are network-online transitions, retry timers, and
    /// enqueue or manual requests that found a pass already running.
    pub fn spawn(&self) -> SyncResult<DriverHandle<B>>
    where
        B: 'static,
    {
        let rx = self
            .inner
            .trigger_rx
            .lock()
            .take()
            .ok_or(SyncError::DriverRunning)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().run_driver(rx, shutdown_rx));
        tracing::debug!("sync driver started");
        Ok(DriverHandle {
            engine: self.clone(),
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run_driver(
        self,
        mut triggers: mpsc::UnboundedReceiver<SyncTrigger>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> mpsc::UnboundedReceiver<SyncTrigger> {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                trigger = triggers.recv() => {
                    let Some(trigger) = trigger else { break };
                    self.handle_trigger(trigger).await;
                }
            }
        }
        tracing::debug!("sync driver stopped");
        triggers
    }

    async fn handle_trigger(&self, trigger: SyncTrigger) {
        tracing::debug!(?trigger, "drain triggered");
        match self.drain().await {
            Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning)) => {
                let delay = self.inner.config.busy_retry_delay;
                let triggers = self.inner.triggers.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = triggers.send(trigger);
                });
            }
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, ?trigger, "drain pass failed"),
        }
    }

    async fn drain_or_defer(&self, trigger: SyncTrigger) -> SyncResult<()> {
        if let DrainOutcome::Skipped(SkipReason::AlreadyRunning) = self.drain().await? {
            let _ = self.inner.triggers.send(trigger);
        }
        Ok(())
    }

    /// Runs the validator and checks that updates and deletes name a record.
    fn validate(
        &self,
        table: &str,
        operation: OperationType,
        record_id: Option<&str>,
        payload: &Payload,
    ) -> Result<(), ValidationErrors> {
        let mut errors = match self.inner.validator.validate(table, operation, payload) {
            Ok(()) => ValidationErrors::new(),
            Err(errors) => errors,
        };
        if let Err(error) = check_target(operation, record_id) {
            errors.push(error);
        }
        errors.into_result()
    }

    fn conflicts(&self) -> ConflictStore<'_, B> {
        ConflictStore::new(&self.inner.backend, &self.inner.config.conflict_table)
    }

    /// Writes `entry` if the stored copy is still in status `read`.
    fn persist(&self, entry: &QueueEntry, read: QueueStatus) -> SyncResult<()> {
        self.inner
            .store
            .update_if(&entry.client_id, read, entry.clone())?;
        Ok(())
    }

    async fn process_entry(&self, mut entry: QueueEntry) -> SyncResult<EntryOutcome> {
        let client_id = entry.client_id;
        let read = entry.status;
        entry.mark_processing()?;
        match self.persist(&entry, read) {
            Ok(()) => {}
            Err(SyncError::Queue(CoreError::StatusChanged { actual, .. })) => {
                tracing::debug!(%client_id, status = %actual, "entry changed before it was claimed; skipped");
                return Ok(EntryOutcome::Skipped);
            }
            Err(err) => return Err(err),
        }
        tracing::debug!(
            %client_id,
            operation = %entry.operation_type,
            table = entry.table_name.as_str(),
            attempt = entry.attempt_count + 1,
            "applying entry"
        );

        let payload = match entry.payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%client_id, error = %err, "queued payload could not be decoded");
                let details = json!({"codec": true, "message": err.to_string()});
                return self.fail(entry, ErrorKind::Unknown, err.to_string(), Some(details));
            }
        };

        let target = entry.record_id.clone();
        if entry.operation_type.requires_record_id() && target.is_none() {
            let message = format!("{} entry has no record id", entry.operation_type);
            return self.fail(entry, ErrorKind::Validation, message, None);
        }

        if let (OperationType::Update, Some(id)) = (entry.operation_type, target.as_deref()) {
            match detect_conflict(&self.inner.backend, &entry.table_name, id, &payload).await {
                Ok(Some(conflict)) => return self.file_conflict(entry, id, payload, conflict).await,
                Ok(None) => {}
                Err(err) => return self.fail_backend(entry, err),
            }
        }

        let started = Instant::now();
        let table = entry.table_name.clone();
        let applied = match (entry.operation_type, target.as_deref()) {
            (OperationType::Create, _) => self
                .inner
                .backend
                .insert(&table, payload.into_value())
                .await
                .map(|row| record_id(&row)),
            (OperationType::Update, Some(id)) => self
                .inner
                .backend
                .update(&table, id, payload.into_value())
                .await
                .map(|_| None),
            (OperationType::Delete, Some(id)) => {
                self.inner.backend.delete(&table, id).await.map(|_| None)
            }
            (_, None) => Ok(None),
        };

        match applied {
            Ok(server_id) => {
                entry.mark_completed(server_id)?;
                self.persist(&entry, QueueStatus::Processing)?;
                tracing::debug!(%client_id, record_id = ?entry.record_id, "entry applied");
                self.inner.metrics.record(&MetricEvent::SyncSucceeded {
                    client_id,
                    operation: entry.operation_type,
                    table,
                    latency: started.elapsed(),
                });
                Ok(EntryOutcome::Applied)
            }
            Err(err) => self.fail_backend(entry, err),
        }
    }

    async fn file_conflict(
        &self,
        mut entry: QueueEntry,
        record_id: &str,
        payload: Payload,
        conflict: DetectedConflict,
    ) -> SyncResult<EntryOutcome> {
        let client_id = entry.client_id;
        let record = ConflictRecord::new(
            entry.table_name.clone(),
            record_id,
            client_id,
            payload.into_value(),
            conflict.server_record,
            Utc::now(),
        );
        if let Err(err) = self.conflicts().file(&record).await {
            return match err {
                SyncError::Backend(err) => self.fail_backend(entry, err),
                other => Err(other),
            };
        }

        let mismatch = conflict.mismatch;
        let message = format!(
            "server version {} is newer than queued version {}",
            mismatch.server_version, mismatch.client_version
        );
        let details = json!({
            "conflict_id": record.id,
            "client_version": mismatch.client_version,
            "server_version": mismatch.server_version,
        });
        entry.mark_conflicted(record.id.clone(), message, Some(details))?;
        self.persist(&entry, QueueStatus::Processing)?;

        tracing::warn!(
            %client_id,
            conflict_id = record.id.as_str(),
            table = entry.table_name.as_str(),
            record_id,
            client_version = mismatch.client_version,
            server_version = mismatch.server_version,
            "version conflict; apply skipped"
        );
        self.inner.metrics.record(&MetricEvent::ConflictDetected {
            client_id,
            conflict_id: record.id,
            table: entry.table_name,
        });
        Ok(EntryOutcome::Conflicted)
    }

    fn fail_backend(&self, entry: QueueEntry, err: BackendError) -> SyncResult<EntryOutcome> {
        let kind = err.classify(self.inner.network.is_online());
        let details = err.to_details();
        self.fail(entry, kind, err.message, Some(details))
    }

    fn fail(
        &self,
        mut entry: QueueEntry,
        kind: ErrorKind,
        message: String,
        details: Option<serde_json::Value>,
    ) -> SyncResult<EntryOutcome> {
        let client_id = entry.client_id;
        let max_attempts = self.inner.config.retry.max_attempts;
        entry.record_failure(kind, message, details)?;
        let retry_scheduled =
            entry.wants_retry(max_attempts, self.inner.config.retry_authorization_failures);
        self.persist(&entry, QueueStatus::Processing)?;

        let attempt = entry.attempt_count;
        if retry_scheduled {
            let delay = self.inner.config.retry.delay_for_attempt(attempt);
            self.inner.scheduler.schedule(ScheduledRetry::new(
                client_id,
                attempt,
                delay,
                self.inner.triggers.clone(),
            ));
            tracing::warn!(
                %client_id,
                error_kind = %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = entry.error_message.as_deref().unwrap_or_default(),
                "apply failed; retry scheduled"
            );
        } else {
            tracing::warn!(
                %client_id,
                error_kind = %kind,
                attempt,
                error = entry.error_message.as_deref().unwrap_or_default(),
                "apply failed; no automatic retry"
            );
        }

        self.inner.metrics.record(&MetricEvent::SyncFailed {
            client_id,
            table: entry.table_name,
            kind,
            attempt,
            will_retry: retry_scheduled,
        });
        Ok(EntryOutcome::Failed { retry_scheduled })
    }
}

/// Handle to the background driver started by [`SyncEngine::spawn`].
///
/// Dropping the handle stops the driver after its current pass.
pub struct DriverHandle<B: RemoteBackend> {
    engine: SyncEngine<B>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<mpsc::UnboundedReceiver<SyncTrigger>>,
}

impl<B: RemoteBackend> DriverHandle<B> {
    /// Stops the driver and waits for its current pass to finish.
    ///
    /// Triggers received afterwards can be handled with
    /// [`SyncEngine::poll_triggers`] or a new driver.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(rx) => *self.engine.inner.trigger_rx.lock() = Some(rx),
            Err(err) => tracing::error!(error = %err, "sync driver task failed"),
        }
    }

    /// Returns true if the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
