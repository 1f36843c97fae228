//! Queue log writer.

use crate::error::CoreResult;
use crate::log::reader::LogReader;
use crate::log::record::LogRecord;
use opsync_protocol::{ClientId, QueueEntry};
use opsync_storage::StorageBackend;
use std::collections::HashMap;

/// Result of replaying a log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Latest snapshot of every entry.
    pub entries: HashMap<ClientId, QueueEntry>,
    /// Number of complete records read.
    pub records: usize,
    /// Bytes of incomplete tail record that were dropped.
    pub truncated_bytes: u64,
}

/// Append-only writer over a storage backend.
pub struct QueueLog {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
    records: usize,
}

impl QueueLog {
    /// Wraps a backend. Call [`QueueLog::replay`] before appending to an
    /// existing log.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend,
            sync_on_write,
            records: 0,
        }
    }

    /// Reads every record, keeping the last snapshot per entry.
    ///
    /// An incomplete final record is truncated away so later appends start
    /// on a record boundary. Checksum and framing errors are returned
    /// without modifying the log.
    pub fn replay(&mut self) -> CoreResult<Replay> {
        let data = self.backend.read_all()?;
        let mut reader = LogReader::new(&data);
        let mut replay = Replay::default();

        for item in reader.by_ref() {
            let (_, record) = item?;
            let entry = record.into_entry();
            replay.entries.insert(entry.client_id, entry);
            replay.records += 1;
        }

        if let Some(valid_len) = reader.torn_tail() {
            replay.truncated_bytes = data.len() as u64 - valid_len;
            tracing::warn!(
                offset = valid_len,
                bytes = replay.truncated_bytes,
                "truncating torn record at end of queue log"
            );
            self.backend.truncate(valid_len)?;
            self.backend.sync()?;
        }

        self.records = replay.records;
        Ok(replay)
    }

    /// Appends an entry snapshot. Returns the record offset.
    ///
    /// With `sync_on_write` the record is on disk when this returns.
    pub fn append(&mut self, entry: &QueueEntry) -> CoreResult<u64> {
        let data = LogRecord::Put(entry.clone()).encode()?;
        let offset = self.backend.append(&data)?;
        if self.sync_on_write {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        self.records += 1;
        Ok(offset)
    }

    /// Changes whether appends sync before returning.
    pub fn set_sync_on_write(&mut self, sync_on_write: bool) {
        self.sync_on_write = sync_on_write;
    }

    /// Forces all appended records to disk.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Log size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Number of records in the log, live or superseded.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Reads the raw log image.
    pub fn read_all(&self) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read_all()?)
    }
}
