//! Core error types shared across the orchestrator workspace, using
//! Railway-Oriented Programming.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for generic, cross-cutting operations (I/O, parsing,
/// malformed records). Domain-specific errors (expression evaluation,
/// persistence, task execution) live in their own crate-level error enums
/// and convert into this one only where no finer-grained type exists.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read file '{path}'")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write file '{path}'")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parse error")]
    JsonParseFailed {
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a file write error.
    pub fn file_write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a JSON parse error.
    pub fn json_parse_failed(source: serde_json::Error) -> Self {
        Self::JsonParseFailed { source }
    }

    /// Create an invalid record error.
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}
