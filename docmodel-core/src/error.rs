//! Error types and result types for document model operations.
//!
//! Casting and validation failures are structured values ([`CastError`], [`ValidatorError`],
//! [`ValidationError`]) that serialize losslessly through serde. Everything else a document
//! operation can fail with is a [`DocumentError`]. Use [`DocumentResult<T>`] as the return type
//! for fallible operations.

use std::{collections::BTreeMap, fmt};

use bson::{Bson, error::Error as BsonError};
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// The declared type a cast was attempting to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastKind {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Uuid,
    Array,
    Embedded,
    Map,
    /// A scalar or array was assigned where an object was expected.
    #[serde(rename = "ObjectExpectedError")]
    ObjectExpected,
    /// A user-defined setter rejected the value before casting.
    Setter,
}

impl fmt::Display for CastKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CastKind::String => "string",
            CastKind::Number => "Number",
            CastKind::Boolean => "Boolean",
            CastKind::Date => "date",
            CastKind::ObjectId => "ObjectId",
            CastKind::Uuid => "UUID",
            CastKind::Array => "Array",
            CastKind::Embedded => "Embedded",
            CastKind::Map => "Map",
            CastKind::ObjectExpected => "ObjectExpectedError",
            CastKind::Setter => "setter",
        };

        f.write_str(name)
    }
}

/// Raw input could not be converted to a path's declared type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Cast to {kind} failed for value {value} at path \"{path}\"")]
pub struct CastError {
    /// Path the cast was performed for, relative to the document root once reported.
    pub path: String,
    /// The rejected input.
    pub value: Bson,
    /// The type the cast was attempting to produce.
    pub kind: CastKind,
    /// Message of the underlying failure, if any.
    pub reason: Option<String>,
}

impl CastError {
    pub fn new(path: impl Into<String>, value: Bson, kind: CastKind) -> Self {
        Self {
            path: path.into(),
            value,
            kind,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn prefixed(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.path = format!("{}.{}", prefix, self.path);
        }
        self
    }
}

/// Distinguishes required failures from built-in constraints and user validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorKind {
    Required,
    Enum,
    Min,
    Max,
    #[serde(rename = "minlength")]
    MinLength,
    #[serde(rename = "maxlength")]
    MaxLength,
    Regexp,
    #[serde(rename = "user defined")]
    UserDefined,
    /// A user validator that declared its own kind.
    #[serde(untagged)]
    Custom(String),
}

impl fmt::Display for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidatorKind::Required => "required",
            ValidatorKind::Enum => "enum",
            ValidatorKind::Min => "min",
            ValidatorKind::Max => "max",
            ValidatorKind::MinLength => "minlength",
            ValidatorKind::MaxLength => "maxlength",
            ValidatorKind::Regexp => "regexp",
            ValidatorKind::UserDefined => "user defined",
            ValidatorKind::Custom(kind) => kind,
        };

        f.write_str(name)
    }
}

/// A required, built-in or custom validator rejected a value.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ValidatorError {
    pub path: String,
    pub value: Bson,
    pub kind: ValidatorKind,
    pub message: String,
    /// Message of an error raised by the validator function itself.
    pub reason: Option<String>,
}

impl ValidatorError {
    pub(crate) fn prefixed(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.path = format!("{}.{}", prefix, self.path);
        }
        self
    }
}

/// One entry of a [`ValidationError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum PathError {
    #[serde(rename = "CastError")]
    Cast(CastError),
    #[serde(rename = "ValidatorError")]
    Validator(ValidatorError),
    /// Aggregate error of an embedded document, keyed by the child's own paths.
    #[serde(rename = "ValidationError")]
    Subdocument(ValidationError),
}

impl PathError {
    pub fn message(&self) -> String {
        match self {
            PathError::Cast(err) => err.to_string(),
            PathError::Validator(err) => err.message.clone(),
            PathError::Subdocument(err) => err.to_string(),
        }
    }

    /// The validator kind, when this entry came from a validator.
    pub fn validator_kind(&self) -> Option<&ValidatorKind> {
        match self {
            PathError::Validator(err) => Some(&err.kind),
            _ => None,
        }
    }
}

/// Aggregate result of a validation pass: one error per failing path.
#[derive(Error, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Name of the model the document belongs to, when known.
    pub model: Option<String>,
    pub errors: BTreeMap<String, PathError>,
}

impl ValidationError {
    pub fn new(model: Option<String>) -> Self {
        Self {
            model,
            errors: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn get(&self, path: &str) -> Option<&PathError> {
        self.errors.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(String::as_str)
    }

    pub fn add(&mut self, path: impl Into<String>, error: PathError) {
        self.errors.insert(path.into(), error);
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{} validation failed", model)?,
            None => f.write_str("Validation failed")?,
        }

        for (index, (path, error)) in self.errors.iter().enumerate() {
            let separator = if index == 0 { ": " } else { ", " };
            write!(f, "{}{}: {}", separator, path, error.message())?;
        }

        Ok(())
    }
}

/// Represents all possible errors that can occur when working with documents.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error(transparent)]
    Cast(#[from] CastError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A second validation was started on a node while one is in flight.
    #[error("Can't validate() the same doc multiple times in parallel. Document: {0}")]
    ParallelValidate(String),
    /// The persistence target no longer exists.
    #[error("No document found for query \"{filter}\" on model \"{model}\"")]
    DocumentNotFound { filter: String, model: String },
    /// A write to an undeclared or immutable path under throw-strict mode.
    #[error("{message}")]
    StrictMode { path: String, message: String },
    /// A non-object was passed where a document body was required.
    #[error("Parameter \"{name}\" to Document() must be an object, got \"{value}\"")]
    ObjectParameter { name: String, value: Bson },
    /// A unique-constraint violation reported by the persistence backend.
    #[error("E11000 duplicate key error collection: {collection} dup key: {key}")]
    DuplicateKey { collection: String, key: String },
    /// A positional insert and a generic array mutation were mixed in one change window.
    #[error("Cannot {operation} on array `{path}` while a conflicting array operation is pending")]
    ArrayOperationConflict { path: String, operation: String },
    #[error("Invalid path `{0}`: {1}")]
    InvalidPath(String, String),
    /// A hook returned an error; it is reported on the channel of the operation it wraps.
    #[error("{point} hook failed: {message}")]
    Hook { point: String, message: String },
    #[error("Method `{0}` is not defined on the schema")]
    MethodNotFound(String),
    #[error("Transform failed: {0}")]
    Transform(String),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// An error occurred in the persistence backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DocumentError {
    pub(crate) fn strict(path: impl Into<String>) -> Self {
        let path = path.into();
        DocumentError::StrictMode {
            message: format!(
                "Field `{}` is not in schema and strict mode is set to throw.",
                path
            ),
            path,
        }
    }

    pub(crate) fn immutable(path: impl Into<String>) -> Self {
        let path = path.into();
        DocumentError::StrictMode {
            message: format!(
                "Path `{}` is immutable and strict mode is set to throw.",
                path
            ),
            path,
        }
    }

    /// Returns the aggregate validation error, if this is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            DocumentError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

/// A specialized `Result` type for document operations.
pub type DocumentResult<T> = Result<T, DocumentError>;

impl From<BsonError> for DocumentError {
    fn from(err: BsonError) -> Self {
        DocumentError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_path() {
        let mut err = ValidationError::new(Some("User".into()));
        err.add(
            "name",
            PathError::Validator(ValidatorError {
                path: "name".into(),
                value: Bson::Undefined,
                kind: ValidatorKind::Required,
                message: "Path `name` is required.".into(),
                reason: None,
            }),
        );
        err.add(
            "age",
            PathError::Cast(CastError::new("age", Bson::String("abc".into()), CastKind::Number)),
        );

        let message = err.to_string();
        assert!(message.starts_with("User validation failed: "));
        assert!(message.contains("name: Path `name` is required."));
        assert!(message.contains("age: Cast to Number failed"));
    }

    #[test]
    fn validation_error_survives_json_round_trip() {
        let mut inner = ValidationError::new(None);
        inner.add(
            "street",
            PathError::Validator(ValidatorError {
                path: "street".into(),
                value: Bson::Null,
                kind: ValidatorKind::UserDefined,
                message: "bad street".into(),
                reason: Some("boom".into()),
            }),
        );

        let mut outer = ValidationError::new(Some("Person".into()));
        outer.add("address", PathError::Subdocument(inner));
        outer.add(
            "tag",
            PathError::Cast(
                CastError::new("tag", Bson::String("1".into()), CastKind::ObjectExpected).with_reason("nope"),
            ),
        );

        let json = serde_json::to_string(&outer).unwrap();
        assert!(json.contains("\"ObjectExpectedError\""));
        assert!(json.contains("\"user defined\""));

        let back: ValidationError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outer);
    }

    #[test]
    fn custom_validator_kind_serializes_as_plain_string() {
        let json = serde_json::to_string(&ValidatorKind::Custom("unique".into())).unwrap();
        assert_eq!(json, "\"unique\"");
        let kind: ValidatorKind = serde_json::from_str("\"min\"").unwrap();
        assert_eq!(kind, ValidatorKind::Min);
    }
}
