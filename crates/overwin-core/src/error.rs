//! Error types for request validation and aggregation folds

use crate::agg::AggFunc;
use thiserror::Error;

/// Construction-time configuration errors. Fatal and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported aggregation function '{name}'{hint}")]
    UnsupportedAggFunc { name: String, hint: String },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid limit {0}: limit must be a positive integer")]
    InvalidLimit(i64),

    #[error("Invalid window size {0}ms: window size must be at least 1ms")]
    InvalidWindowSize(i64),

    #[error("Group-by key '{0}' is listed more than once")]
    DuplicateGroupKey(String),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid column '{column}': {source}")]
    Column {
        column: String,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors raised while folding admitted values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggError {
    #[error("{func}({field}) cannot aggregate a {found} value")]
    TypeMismatch {
        func: AggFunc,
        field: String,
        found: &'static str,
    },

    #[error("{func}({field}) overflowed the integer range")]
    Overflow { func: AggFunc, field: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
