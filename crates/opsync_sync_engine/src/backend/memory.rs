//! In-memory backend with failure injection.

use super::{record_id, BackendError, Record, RemoteBackend};
use async_trait::async_trait;
use opsync_protocol::{record_version, DEFAULT_VERSION};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// A call observed by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    /// Operation name (`insert`, `update`, `delete`, `select_one`, `select_eq`).
    pub operation: &'static str,
    /// Target table.
    pub table: String,
    /// Target row id, if any.
    pub id: Option<String>,
}

/// A backend that keeps tables in memory.
///
/// Behaves like a server that owns record versions: inserts start at
/// version 1 and every update bumps the stored version, whatever the
/// client sent. Writes can be made to fail for tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, BTreeMap<String, Map<String, Value>>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    next_write_failures: Mutex<VecDeque<BackendError>>,
    write_failure: Mutex<Option<BackendError>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<BackendCall>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` as-is, keyed by its `id`. Returns the id.
    pub fn seed(&self, table: &str, record: Value) -> Option<String> {
        let id = record_id(&record)?;
        let Value::Object(row) = record else {
            return None;
        };
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(id.clone(), row);
        Some(id)
    }

    /// Returns the row with `id`.
    pub fn record(&self, table: &str, id: &str) -> Option<Value> {
        self.tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(id))
            .map(|row| Value::Object(row.clone()))
    }

    /// Returns every row in `table`.
    pub fn records(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Makes every call fail as unreachable while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next write (insert, update or delete) with `error`.
    /// Queued failures are used in order.
    pub fn fail_next_write(&self, error: BackendError) {
        self.next_write_failures.lock().push_back(error);
    }

    /// Fails every write with `error` until cleared.
    pub fn fail_all_writes(&self, error: BackendError) {
        *self.write_failure.lock() = Some(error);
    }

    /// Clears injected write failures.
    pub fn clear_failures(&self) {
        self.next_write_failures.lock().clear();
        *self.write_failure.lock() = None;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Calls observed so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Number of write calls observed, failed or not.
    pub fn write_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c.operation, "insert" | "update" | "delete"))
            .count()
    }

    async fn enter(&self, operation: &'static str, table: &str, id: Option<&str>) -> Result<(), BackendError> {
        self.calls.lock().push(BackendCall {
            operation,
            table: table.to_string(),
            id: id.map(str::to_string),
        });

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::offline("backend unreachable"));
        }

        if matches!(operation, "insert" | "update" | "delete") {
            if let Some(err) = self.next_write_failures.lock().pop_front() {
                return Err(err);
            }
            if let Some(err) = self.write_failure.lock().clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn not_found(table: &str, id: &str) -> BackendError {
        BackendError::status(404, format!("no row {id} in {table}"))
    }
}

fn into_row(data: Value) -> Result<Map<String, Value>, BackendError> {
    match data {
        Value::Object(row) => Ok(row),
        _ => Err(BackendError::status(400, "row data must be a JSON object")),
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn insert(&self, table: &str, data: Value) -> Result<Record, BackendError> {
        self.enter("insert", table, None).await?;
        let mut row = into_row(data)?;

        let id = match record_id(&Value::Object(row.clone())) {
            Some(id) => id,
            None => format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        };
        row.insert("id".into(), Value::String(id.clone()));
        row.insert("version".into(), Value::from(DEFAULT_VERSION));

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(BackendError::status(409, format!("duplicate id {id} in {table}")));
        }
        rows.insert(id, row.clone());
        Ok(Value::Object(row))
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Record, BackendError> {
        self.enter("update", table, Some(id)).await?;
        let changes = into_row(data)?;

        let mut tables = self.tables.lock();
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| Self::not_found(table, id))?;

        let version = record_version(row.get("version"));
        for (field, value) in changes {
            if field != "id" && field != "version" {
                row.insert(field, value);
            }
        }
        row.insert("version".into(), Value::from(version + 1));
        Ok(Value::Object(row.clone()))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError> {
        self.enter("delete", table, Some(id)).await?;
        self.tables
            .lock()
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(table, id))
    }

    async fn select_one(&self, table: &str, id: &str) -> Result<Option<Record>, BackendError> {
        self.enter("select_one", table, Some(id)).await?;
        Ok(self.record(table, id))
    }

    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Record>, BackendError> {
        self.enter("select_eq", table, None).await?;
        let matches = |v: &Value| match v {
            Value::String(s) => s == value,
            other => other.to_string() == value,
        };
        Ok(self
            .records(table)
            .into_iter()
            .filter(|row| row.get(column).is_some_and(|v| matches(v)))
            .collect())
    }
}
