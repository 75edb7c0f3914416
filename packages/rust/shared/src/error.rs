//! Error types for bulkmapper.
//!
//! Library crates use [`BulkMapperError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Individual failed lookups are not errors: they travel as
//! [`QueryOutcome::Failed`](crate::QueryOutcome) values and end up as CSV rows.
//! Only conditions that stop the whole run surface here.

use std::path::PathBuf;

/// Top-level error type for all bulkmapper operations.
#[derive(Debug, thiserror::Error)]
pub enum BulkMapperError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error that prevents any request from being made.
    #[error("network error: {0}")]
    Network(String),

    /// The Mapper API rejected the API key. Aborts the run.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Input or output file content could not be parsed.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad flag value, unknown encoding, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// CSV reader/writer error.
    #[error("CSV error at {path:?}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BulkMapperError>;

impl BulkMapperError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a `csv::Error` with the path of the file being read or written.
    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}
