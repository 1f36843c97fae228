//! Operation and failure classification enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of write a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Insert a new record; the server assigns its id.
    Create,
    /// Update an existing record by id.
    Update,
    /// Delete an existing record by id.
    Delete,
}

impl OperationType {
    /// Returns true if the operation targets an existing record.
    pub const fn requires_record_id(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }

    /// Lowercase name as persisted.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a queue entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// No connectivity when the apply failed.
    Network,
    /// Rejected locally by the validator, or 400/422 from the backend.
    Validation,
    /// 401/403 from the backend.
    Authorization,
    /// Version conflict, detected locally or reported as 409.
    Conflict,
    /// Anything else, including undecodable payloads.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in display order.
    pub const ALL: [ErrorKind; 5] = [
        Self::Network,
        Self::Validation,
        Self::Authorization,
        Self::Conflict,
        Self::Unknown,
    ];

    /// Returns true if the failure may succeed when simply tried again.
    ///
    /// Authorization failures need a fresh session and validation failures
    /// need different data, so neither is transient.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Conflict | Self::Unknown)
    }

    /// Lowercase name as persisted.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::Conflict => "conflict",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_requirements() {
        assert!(!OperationType::Create.requires_record_id());
        assert!(OperationType::Update.requires_record_id());
        assert!(OperationType::Delete.requires_record_id());
    }

    #[test]
    fn transient_kinds() {
        let transient: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|k| k.is_transient())
            .collect();
        assert_eq!(
            transient,
            vec![ErrorKind::Network, ErrorKind::Conflict, ErrorKind::Unknown]
        );
    }

    #[test]
    fn serde_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::Authorization).unwrap(),
            "\"authorization\""
        );
        assert_eq!(
            serde_json::from_str::<OperationType>("\"delete\"").unwrap(),
            OperationType::Delete
        );
    }
}
