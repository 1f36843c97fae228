//! The remote backend boundary.
//!
//! The engine only needs generic row operations against a remote
//! relational store. Authentication and access control live behind the
//! implementation.

mod memory;
mod rest;

pub use memory::{BackendCall, MemoryBackend};
pub use rest::{HttpClient, HttpRequest, HttpResponse, Method, RestBackend};

use async_trait::async_trait;
use opsync_protocol::ErrorKind;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// A row as returned by the backend.
pub type Record = Value;

/// A failure reported by, or on the way to, the remote backend.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct BackendError {
    /// HTTP-style status code, when the backend answered.
    pub status: Option<u16>,
    /// Human-readable message.
    pub message: String,
    /// Structured detail from the backend.
    pub details: Option<Value>,
    /// True if the request never reached the backend.
    pub offline: bool,
}

impl BackendError {
    /// A failure the backend answered with `status`.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            details: None,
            offline: false,
        }
    }

    /// The backend could not be reached.
    pub fn offline(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            details: None,
            offline: true,
        }
    }

    /// A failure with no status, such as a malformed response.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            details: None,
            offline: false,
        }
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Maps the failure onto the queue's error taxonomy.
    ///
    /// `online` is the connectivity reported by the network monitor when
    /// the failure happened; being offline wins over any status code.
    pub fn classify(&self, online: bool) -> ErrorKind {
        if self.offline || !online {
            return ErrorKind::Network;
        }
        match self.status {
            Some(401 | 403) => ErrorKind::Authorization,
            Some(409) => ErrorKind::Conflict,
            Some(400 | 422) => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        }
    }

    /// Structured form stored in a queue entry's `error_details`.
    pub fn to_details(&self) -> Value {
        json!({
            "status": self.status,
            "offline": self.offline,
            "details": self.details,
        })
    }
}

/// Generic row operations against the remote store.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Inserts a row and returns it as stored, including its id.
    async fn insert(&self, table: &str, data: Value) -> Result<Record, BackendError>;

    /// Updates the row with `id` and returns it as stored.
    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Record, BackendError>;

    /// Deletes the row with `id`.
    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError>;

    /// Fetches the row with `id`.
    async fn select_one(&self, table: &str, id: &str) -> Result<Option<Record>, BackendError>;

    /// Fetches rows whose `column` equals `value`.
    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Record>, BackendError>;
}

#[async_trait]
impl<T: RemoteBackend + ?Sized> RemoteBackend for Arc<T> {
    async fn insert(&self, table: &str, data: Value) -> Result<Record, BackendError> {
        (**self).insert(table, data).await
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Record, BackendError> {
        (**self).update(table, id, data).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError> {
        (**self).delete(table, id).await
    }

    async fn select_one(&self, table: &str, id: &str) -> Result<Option<Record>, BackendError> {
        (**self).select_one(table, id).await
    }

    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Record>, BackendError> {
        (**self).select_eq(table, column, value).await
    }
}

/// Extracts a row's `id` as a string.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let online = true;
        assert_eq!(BackendError::offline("dns").classify(online), ErrorKind::Network);
        assert_eq!(BackendError::status(500, "boom").classify(false), ErrorKind::Network);
        assert_eq!(BackendError::status(401, "jwt").classify(online), ErrorKind::Authorization);
        assert_eq!(BackendError::status(403, "rls").classify(online), ErrorKind::Authorization);
        assert_eq!(BackendError::status(409, "dup").classify(online), ErrorKind::Conflict);
        assert_eq!(BackendError::status(400, "bad").classify(online), ErrorKind::Validation);
        assert_eq!(BackendError::status(422, "bad").classify(online), ErrorKind::Validation);
        assert_eq!(BackendError::status(500, "boom").classify(online), ErrorKind::Unknown);
        assert_eq!(BackendError::status(404, "gone").classify(online), ErrorKind::Unknown);
        assert_eq!(BackendError::other("garbled").classify(online), ErrorKind::Unknown);
    }

    #[test]
    fn details_shape() {
        let err = BackendError::status(422, "price must be positive")
            .with_details(json!({"code": "23514"}));
        let details = err.to_details();
        assert_eq!(details["status"], 422);
        assert_eq!(details["offline"], false);
        assert_eq!(details["details"]["code"], "23514");
    }

    #[test]
    fn ids_from_rows() {
        assert_eq!(record_id(&json!({"id": "a1"})).as_deref(), Some("a1"));
        assert_eq!(record_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(record_id(&json!({"name": "x"})), None);
    }
}
