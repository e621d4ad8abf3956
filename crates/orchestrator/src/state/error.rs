//! Error taxonomy for state-store operations, grounded on the teacher's
//! persistence-layer error design: named variants with `is_retryable`
//! guidance rather than string-typed errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateStoreError>;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("connection to state store failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("{entity_type} '{id}' not found")]
    NotFound { entity_type: String, id: String },

    #[error("{entity_type} '{id}' already exists")]
    AlreadyExists { entity_type: String, id: String },

    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    #[error("lease conflict: expected lease '{expected}', got '{actual}'")]
    LeaseMismatch { expected: String, actual: String },

    #[error("schema initialization failed: {reason}")]
    SchemaError { reason: String },
}

impl StateStoreError {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    pub fn lease_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::LeaseMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the caller may reasonably retry the operation unmodified.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::QueryFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_retryable() {
        let err = StateStoreError::not_found("pipeline", "p1");
        assert!(!err.is_retryable());
    }

    #[test]
    fn connection_failed_is_retryable() {
        let err = StateStoreError::connection_failed("timeout");
        assert!(err.is_retryable());
    }
}
