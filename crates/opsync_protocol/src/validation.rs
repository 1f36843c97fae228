//! The validator capability consumed at enqueue time.

use crate::operation::OperationType;
use crate::payload::{json_type_name, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Machine-readable reason a field failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// A required field is absent or null.
    Required,
    /// The field has the wrong JSON type.
    WrongType,
    /// A numeric field must be greater than zero.
    NotPositive,
    /// A domain rule rejected the value.
    Invalid,
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Offending field.
    pub field: String,
    /// Failure code.
    pub code: ValidationCode,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    /// Creates a validation error.
    pub fn new(field: impl Into<String>, code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }
}

/// A non-empty set of validation failures for one payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a failure.
    pub fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Returns true if nothing failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The individual failures.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// `Ok(())` if empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Structured form stored in a queue entry's `error_details`.
    pub fn to_details(&self) -> Value {
        serde_json::json!({ "validation_errors": self.errors })
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Checks that an update or delete names its target record.
pub fn check_target(
    operation: OperationType,
    record_id: Option<&str>,
) -> Result<(), ValidationError> {
    if operation.requires_record_id() && record_id.is_none() {
        return Err(ValidationError::new(
            "record_id",
            ValidationCode::Required,
            format!("{operation} operations require a record id"),
        ));
    }
    Ok(())
}

/// Validates a mutation before it is queued.
///
/// Implementations cover schema shape and domain rules for their tables.
pub trait Validator: Send + Sync {
    /// Returns the failures for `payload`, if any.
    fn validate(
        &self,
        table: &str,
        operation: OperationType,
        payload: &Payload,
    ) -> Result<(), ValidationErrors>;
}

/// Validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _: &str, _: OperationType, _: &Payload) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// A string.
    String,
    /// Any number.
    Number,
    /// An integral number.
    Integer,
    /// A boolean.
    Boolean,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Shape rules for a single table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    required: BTreeSet<String>,
    kinds: BTreeMap<String, FieldKind>,
    positive: BTreeSet<String>,
}

impl TableSchema {
    /// Creates a schema with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `field` on creates.
    #[must_use]
    pub fn required(mut self, field: impl Into<String>) -> Self {
        self.required.insert(field.into());
        self
    }

    /// Constrains the JSON type of `field` when present.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.kinds.insert(field.into(), kind);
        self
    }

    /// Requires a numeric `field` to be greater than zero when present.
    #[must_use]
    pub fn positive(mut self, field: impl Into<String>) -> Self {
        self.positive.insert(field.into());
        self
    }

    fn check(&self, operation: OperationType, payload: &Payload) -> ValidationErrors {
        let mut errors = ValidationErrors::new();

        // Updates are partial, so only creates must carry every required field.
        if operation == OperationType::Create {
            for field in &self.required {
                if matches!(payload.get(field), None | Some(Value::Null)) {
                    errors.push(ValidationError::new(
                        field.as_str(),
                        ValidationCode::Required,
                        "is required",
                    ));
                }
            }
        }

        for (field, kind) in &self.kinds {
            match payload.get(field) {
                Some(Value::Null) | None => {}
                Some(value) if kind.matches(value) => {}
                Some(value) => errors.push(ValidationError::new(
                    field.as_str(),
                    ValidationCode::WrongType,
                    format!("expected {}, got {}", kind.name(), json_type_name(value)),
                )),
            }
        }

        for field in &self.positive {
            if let Some(n) = payload.get(field).and_then(Value::as_f64) {
                if n <= 0.0 {
                    errors.push(ValidationError::new(
                        field.as_str(),
                        ValidationCode::NotPositive,
                        "must be greater than zero",
                    ));
                }
            }
        }

        errors
    }
}

/// Table-keyed validator. Tables without a schema pass.
///
/// Deletes carry no field data and are never checked.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaValidator {
    /// Creates a validator with no tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the schema for `table`.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>, schema: TableSchema) -> Self {
        self.tables.insert(table.into(), schema);
        self
    }

    /// Returns the schema registered for `table`.
    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }
}

impl Validator for SchemaValidator {
    fn validate(
        &self,
        table: &str,
        operation: OperationType,
        payload: &Payload,
    ) -> Result<(), ValidationErrors> {
        if operation == OperationType::Delete {
            return Ok(());
        }
        match self.tables.get(table) {
            Some(schema) => schema.check(operation, payload).into_result(),
            None => Ok(()),
        }
    }
}
