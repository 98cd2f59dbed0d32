use std::{fmt, io};

#[cfg(feature = "service")]
use std::{borrow::Cow, error::Error as StdError};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[cfg(feature = "service")]
use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    Error as SqlxError,
};

use crate::properties::{FieldId, RecordId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum CalcError {
    #[error("Detected a cycle: {field_id} is part of a circular dependency")]
    SchemaCycle { field_id: FieldId },
    #[error("Dependency resolution error: {0}")]
    DependencyResolution(String),
    #[error("Cell evaluation failed for field {field_id}, record {record_id}: {message}")]
    CellEvaluation {
        field_id: FieldId,
        record_id: RecordId,
        message: String,
    },
    #[error("Configuration warning: {0}")]
    Configuration(String),
    #[error("Expression evaluation error: {0}")]
    Evaluation(String),
    #[error("Cache/Database error: {0}")]
    Cache(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("File System error: {0}")]
    Io(String),
}

impl CalcError {
    /// Fatal errors abort a calculation pass. Cell evaluation errors and configuration warnings
    /// are recovered inside the pass and only reported.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CalcError::CellEvaluation { .. } | CalcError::Configuration(_)
        )
    }

    pub fn cycle<F: Into<FieldId>>(field_id: F) -> CalcError {
        CalcError::SchemaCycle {
            field_id: field_id.into(),
        }
    }
}

impl From<toml::de::Error> for CalcError {
    fn from(src: toml::de::Error) -> CalcError {
        CalcError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for CalcError {
    fn from(src: toml::ser::Error) -> CalcError {
        CalcError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for CalcError {
    fn from(src: JsonError) -> CalcError {
        CalcError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<regex::Error> for CalcError {
    fn from(x: regex::Error) -> Self {
        CalcError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<io::Error> for CalcError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => CalcError::NotFound(format!("{x}")),
            _ => CalcError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for CalcError {
    fn from(x: fmt::Error) -> Self {
        CalcError::Serialization(format!("{x}"))
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for CalcError {
    fn from(db_error: SqlxError) -> Self {
        CalcError::Cache(format!("database error: {db_error:?}"))
    }
}

#[cfg(feature = "service")]
impl DatabaseError for CalcError {
    fn message(&self) -> &str {
        "recalc-core FromRow parsing failure"
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        DatabaseErrorKind::Other
    }

    #[inline]
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_error_classification() {
        assert!(CalcError::cycle("fldA").is_fatal());
        assert!(CalcError::DependencyResolution("missing".into()).is_fatal());
        assert!(!CalcError::Configuration("bad filter".into()).is_fatal());
        assert!(!CalcError::CellEvaluation {
            field_id: "fldA".into(),
            record_id: "rec1".into(),
            message: "div by zero".into(),
        }
        .is_fatal());
        assert_eq!(
            CalcError::cycle("fldA").to_string(),
            "Detected a cycle: fldA is part of a circular dependency"
        );
    }
}
