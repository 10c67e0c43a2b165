//! Error types for QUARRY operations

use std::fmt;
use thiserror::Error;

/// Errors produced while fetching, mutating or addressing cached queries.
///
/// Errors are `Clone` because a single fetch result is shared between every
/// caller that was de-duplicated onto it, and the last error is kept in the
/// query's state snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The query or mutation function itself failed.
    #[error("Fetch failed: {reason}")]
    Fetch { reason: String },

    /// The request was canceled or superseded before it settled.
    #[error("Request was cancelled")]
    Cancelled,

    #[error("No query function registered for key {key}")]
    MissingQueryFn { key: String },

    #[error("Type mismatch for key {key}: cached entry does not hold {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// Automatic fetching was requested for a query whose `enabled` flag is off.
    #[error("Query {key} is disabled")]
    Disabled { key: String },

    #[error("No async runtime available to run {operation}")]
    NoRuntime { operation: &'static str },

    #[error("Fetch task for {key} terminated abnormally: {reason}")]
    TaskFailed { key: String, reason: String },
}

impl QueryError {
    /// Wrap any displayable failure from a query or mutation function.
    pub fn fetch(reason: impl fmt::Display) -> Self {
        Self::Fetch {
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error represents an abort rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all QUARRY errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuarryError {
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fetch and mutation paths.
pub type QueryResult<T> = Result<T, QueryError>;

/// Result type alias for QUARRY operations.
pub type QuarryResult<T> = Result<T, QuarryError>;

// =============================================================================
// TESTS
// =============================================================================
