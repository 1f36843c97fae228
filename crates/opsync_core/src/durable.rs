//! The on-disk queue.

use crate::config::QueueConfig;
use crate::dir::QueueDir;
use crate::error::{CoreError, CoreResult};
use crate::log::{LogReader, QueueLog};
use crate::store::{check_update, QueueStore, UpdateGuard};
use opsync_protocol::{ClientId, QueueEntry};
use opsync_storage::FileBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// What happened while opening the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Complete records replayed from the log.
    pub records_replayed: usize,
    /// Distinct entries recovered.
    pub entries: usize,
    /// Bytes of torn tail record dropped.
    pub truncated_bytes: u64,
    /// Whether a leftover compaction temp file was removed.
    pub removed_stale_compaction: bool,
}

/// Outcome of [`DurableQueue::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Records before compaction.
    pub records_before: usize,
    /// Records after compaction (one per entry).
    pub records_after: usize,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
}

impl CompactionStats {
    /// Superseded records dropped.
    pub fn records_removed(&self) -> usize {
        self.records_before - self.records_after
    }
}

/// An entry whose stored payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableEntry {
    /// The entry.
    pub client_id: ClientId,
    /// Decoder message.
    pub message: String,
}

/// Outcome of [`DurableQueue::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Records whose framing and checksum verified.
    pub records: usize,
    /// Entries checked.
    pub entries: usize,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Entries with undecodable payloads.
    pub undecodable: Vec<UndecodableEntry>,
}

impl VerifyReport {
    /// Returns true if nothing was wrong.
    pub fn is_ok(&self) -> bool {
        self.undecodable.is_empty()
    }
}

struct QueueState {
    log: QueueLog,
    index: HashMap<ClientId, QueueEntry>,
}

/// Crash-durable queue stored in a directory.
///
/// Writes are appended to a checksummed log and synced before the call
/// returns (unless `sync_on_write` is off). The whole queue is indexed in
/// memory. One `DurableQueue` may hold a directory at a time.
///
/// ```rust,no_run
/// use opsync_core::{DurableQueue, QueueConfig, QueueStore};
/// use opsync_protocol::{OperationType, Payload, QueueEntry};
///
/// let queue = DurableQueue::open("queue-data", QueueConfig::default())?;
/// let entry = QueueEntry::new(
///     OperationType::Create,
///     "stores",
///     None,
///     Payload::new().with("name", "Harbour Rd"),
///     1024,
/// )?;
/// queue.add(entry)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct DurableQueue {
    dir: QueueDir,
    config: QueueConfig,
    state: Mutex<QueueState>,
    recovery: RecoveryInfo,
}

impl DurableQueue {
    /// Opens the queue in `path`, replaying its log.
    ///
    /// # Errors
    ///
    /// - [`CoreError::QueueLocked`] if another process has the directory
    /// - [`CoreError::ChecksumMismatch`] or [`CoreError::LogCorruption`]
    ///   if a complete record in the log is damaged
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> CoreResult<Self> {
        let dir = QueueDir::open(path.as_ref(), config.create_if_missing)?;
        let removed_stale_compaction = dir.remove_stale_temp()?;

        let backend = FileBackend::open(&dir.log_path())?;
        let mut log = QueueLog::new(Box::new(backend), config.sync_on_write);
        let replay = log.replay()?;

        let recovery = RecoveryInfo {
            records_replayed: replay.records,
            entries: replay.entries.len(),
            truncated_bytes: replay.truncated_bytes,
            removed_stale_compaction,
        };
        tracing::info!(
            path = %dir.path().display(),
            records = recovery.records_replayed,
            entries = recovery.entries,
            truncated_bytes = recovery.truncated_bytes,
            "opened queue"
        );

        Ok(Self {
            dir,
            config,
            state: Mutex::new(QueueState {
                log,
                index: replay.entries,
            }),
            recovery,
        })
    }

    /// Directory holding the queue.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// What was recovered when the queue was opened.
    pub fn recovery(&self) -> &RecoveryInfo {
        &self.recovery
    }

    /// Configuration in use.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Returns true if the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }

    /// Records in the log, including superseded snapshots.
    pub fn log_records(&self) -> usize {
        self.state.lock().log.records()
    }

    /// Log size in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.state.lock().log.size()
    }

    /// Forces the log to disk.
    pub fn sync(&self) -> CoreResult<()> {
        self.state.lock().log.sync()
    }

    /// Rewrites the log with one record per entry.
    ///
    /// The new log is written to a temp file, synced, then renamed over
    /// the live log.
    pub fn compact(&self) -> CoreResult<CompactionStats> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)
    }

    /// What [`DurableQueue::compact`] would do, without writing.
    pub fn compaction_preview(&self) -> CoreResult<CompactionStats> {
        let state = self.state.lock();
        let mut bytes_after = 0u64;
        for entry in state.index.values() {
            bytes_after += crate::log::LogRecord::Put(entry.clone()).encode()?.len() as u64;
        }
        Ok(CompactionStats {
            records_before: state.log.records(),
            records_after: state.index.len(),
            bytes_before: state.log.size()?,
            bytes_after,
        })
    }

    fn compact_locked(&self, state: &mut QueueState) -> CoreResult<CompactionStats> {
        let records_before = state.log.records();
        let bytes_before = state.log.size()?;

        let temp_path = self.dir.compact_temp_path();
        let mut compacted = match self.write_compacted(&temp_path, &state.index) {
            Ok(log) => log,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        // Past the rename the compacted file is the live log, so the
        // handle already open on it must replace the old one right away.
        if let Err(e) = fs::rename(&temp_path, self.dir.log_path()) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        compacted.set_sync_on_write(self.config.sync_on_write);
        state.log = compacted;
        if let Err(e) = self.dir.sync_directory() {
            tracing::warn!(error = %e, "could not sync queue directory after compaction");
        }

        let stats = CompactionStats {
            records_before,
            records_after: state.log.records(),
            bytes_before,
            bytes_after: state.log.size()?,
        };
        tracing::info!(
            removed = stats.records_removed(),
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "compacted queue log"
        );
        Ok(stats)
    }

    /// Writes one record per entry to `path`, syncs it and reads it back.
    fn write_compacted(
        &self,
        path: &Path,
        index: &HashMap<ClientId, QueueEntry>,
    ) -> CoreResult<QueueLog> {
        let temp = FileBackend::create_truncated(path)?;
        let mut compacted = QueueLog::new(Box::new(temp), false);
        let mut entries: Vec<&QueueEntry> = index.values().collect();
        entries.sort_by_key(|e| e.created_at);
        for entry in entries {
            compacted.append(entry)?;
        }
        compacted.sync()?;

        let replay = compacted.replay()?;
        if replay.entries.len() != index.len() {
            return Err(CoreError::log_corruption(
                0,
                format!(
                    "compacted log holds {} entries, expected {}",
                    replay.entries.len(),
                    index.len()
                ),
            ));
        }
        Ok(compacted)
    }

    fn maybe_compact(&self, state: &mut QueueState) {
        if !self
            .config
            .should_compact(state.log.records(), state.index.len())
        {
            return;
        }
        if let Err(e) = self.compact_locked(state) {
            tracing::warn!(error = %e, "automatic compaction failed");
        }
    }

    /// Re-reads the log from disk, checking every record, then decodes the
    /// payload of every entry.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        let state = self.state.lock();
        let data = state.log.read_all()?;

        let mut records = 0;
        for item in LogReader::new(&data) {
            item?;
            records += 1;
        }

        let mut undecodable = Vec::new();
        for entry in state.index.values() {
            if let Err(e) = entry.payload() {
                tracing::error!(client_id = %entry.client_id, error = %e, "undecodable payload");
                undecodable.push(UndecodableEntry {
                    client_id: entry.client_id,
                    message: e.to_string(),
                });
            }
        }
        undecodable.sort_by_key(|u| u.client_id);

        Ok(VerifyReport {
            records,
            entries: state.index.len(),
            log_bytes: data.len() as u64,
            undecodable,
        })
    }
}

impl QueueStore for DurableQueue {
    fn add(&self, entry: QueueEntry) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.index.contains_key(&entry.client_id) {
            return Err(CoreError::DuplicateEntry {
                client_id: entry.client_id,
            });
        }
        state.log.append(&entry)?;
        tracing::debug!(client_id = %entry.client_id, table = %entry.table_name, "queued entry persisted");
        state.index.insert(entry.client_id, entry);
        Ok(())
    }

    fn get(&self, client_id: &ClientId) -> CoreResult<Option<QueueEntry>> {
        Ok(self.state.lock().index.get(client_id).cloned())
    }

    fn update_guarded(
        &self,
        client_id: &ClientId,
        entry: QueueEntry,
        guard: UpdateGuard,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        let current = state.index.get(client_id).ok_or(CoreError::NotFound {
            client_id: *client_id,
        })?;
        check_update(current, &entry, guard)?;
        if current == &entry {
            return Ok(());
        }

        state.log.append(&entry)?;
        state.index.insert(*client_id, entry);
        self.maybe_compact(&mut state);
        Ok(())
    }

    fn get_all(&self) -> CoreResult<Vec<QueueEntry>> {
        Ok(self.state.lock().index.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_protocol::{ErrorKind, OperationType, Payload, QueueStatus};
    use tempfile::tempdir;

    fn entry(table: &str) -> QueueEntry {
        QueueEntry::new(
            OperationType::Create,
            table,
            None,
            Payload::new().with("name", table),
            1024,
        )
        .unwrap()
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let e = entry("stores");
        {
            let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
            queue.add(e.clone()).unwrap();
        }

        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        assert_eq!(queue.get(&e.client_id).unwrap(), Some(e));
        assert_eq!(queue.recovery().records_replayed, 1);
    }

    #[test]
    fn updates_survive_reopen() {
        let dir = tempdir().unwrap();
        let mut e = entry("stores");
        {
            let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
            queue.add(e.clone()).unwrap();
            e.mark_processing().unwrap();
            queue.update(&e.client_id, e.clone()).unwrap();
            e.record_failure(ErrorKind::Network, "offline", None).unwrap();
            queue.update(&e.client_id, e.clone()).unwrap();
        }

        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        let stored = queue.get(&e.client_id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(queue.log_records(), 3);
    }

    #[test]
    fn identical_update_appends_nothing() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        let e = entry("stores");
        queue.add(e.clone()).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        assert_eq!(queue.log_records(), 1);
    }

    #[test]
    fn compaction_keeps_latest() {
        let dir = tempdir().unwrap();
        let config = QueueConfig::default().compact_threshold_ratio(0.0);
        let queue = DurableQueue::open(dir.path(), config.clone()).unwrap();

        let mut e = entry("products");
        let other = entry("staff");
        queue.add(e.clone()).unwrap();
        queue.add(other.clone()).unwrap();
        e.mark_processing().unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        e.mark_completed(Some("srv-1".into())).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();

        let preview = queue.compaction_preview().unwrap();
        assert_eq!(preview.records_before, 4);
        assert_eq!(preview.records_after, 2);

        let stats = queue.compact().unwrap();
        assert_eq!(stats.records_removed(), 2);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(stats.bytes_after, preview.bytes_after);
        drop(queue);

        let queue = DurableQueue::open(dir.path(), config).unwrap();
        assert_eq!(queue.log_records(), 2);
        assert_eq!(queue.get(&e.client_id).unwrap(), Some(e));
        assert_eq!(queue.get(&other.client_id).unwrap(), Some(other));
    }

    #[test]
    fn writes_after_compaction_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = QueueConfig::default().compact_threshold_ratio(0.0);
        let mut e = entry("products");
        let late = entry("staff");
        {
            let queue = DurableQueue::open(dir.path(), config.clone()).unwrap();
            queue.add(e.clone()).unwrap();
            e.mark_processing().unwrap();
            queue.update(&e.client_id, e.clone()).unwrap();
            queue.compact().unwrap();
            assert!(!queue.dir.compact_temp_path().exists());

            // These land in the compacted file, not the replaced one.
            e.record_failure(ErrorKind::Network, "offline", None).unwrap();
            queue.update(&e.client_id, e.clone()).unwrap();
            queue.add(late.clone()).unwrap();
            assert_eq!(queue.log_records(), 3);
        }

        let queue = DurableQueue::open(dir.path(), config).unwrap();
        assert_eq!(queue.recovery().records_replayed, 3);
        assert_eq!(queue.get(&e.client_id).unwrap(), Some(e));
        assert_eq!(queue.get(&late.client_id).unwrap(), Some(late));
    }

    #[test]
    fn automatic_compaction() {
        let dir = tempdir().unwrap();
        let config = QueueConfig::default()
            .compact_threshold_ratio(0.5)
            .compact_min_records(4);
        let queue = DurableQueue::open(dir.path(), config).unwrap();

        let mut e = entry("products");
        queue.add(e.clone()).unwrap();
        e.mark_processing().unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        e.record_failure(ErrorKind::Unknown, "500", None).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        e.mark_processing().unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();

        // Four records, one live: compacted down to one.
        assert_eq!(queue.log_records(), 1);
        assert_eq!(queue.get(&e.client_id).unwrap(), Some(e));
    }

    #[test]
    fn verify_reports_clean_log() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        queue.add(entry("a")).unwrap();
        queue.add(entry("b")).unwrap();

        let report = queue.verify().unwrap();
        assert!(report.is_ok());
        assert_eq!(report.records, 2);
        assert_eq!(report.entries, 2);
    }

    #[test]
    fn verify_flags_undecodable_payload() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        let mut bad = QueueEntry::new(
            OperationType::Create,
            "products",
            None,
            Payload::new().with("notes", "n".repeat(2048)),
            1024,
        )
        .unwrap();
        bad.compressed_payload = Some(vec![1, 2, 3]);
        queue.add(bad.clone()).unwrap();

        let report = queue.verify().unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.undecodable[0].client_id, bad.client_id);
    }

    #[test]
    fn second_open_locked() {
        let dir = tempdir().unwrap();
        let _queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        assert!(matches!(
            DurableQueue::open(dir.path(), QueueConfig::default()),
            Err(CoreError::QueueLocked)
        ));
    }
}
