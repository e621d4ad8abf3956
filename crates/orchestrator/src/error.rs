//! Crate-level error taxonomy for the orchestrator.
//!
//! Mirrors the error taxonomy in the design: configuration errors are
//! surfaced synchronously from submission, task/stage errors are recovered
//! locally or escalate to pipeline failure, and store/transport errors
//! escalate to the caller with best-effort cleanup.

use thiserror::Error;

use crate::state::StateStoreError;
use crate::transport::TransportError;

/// Result type alias used throughout the orchestrator crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Duplicate stage names, cyclic DAG, unknown dependency, invalid
    /// executor config, or an unknown stage mode. Surfaced synchronously
    /// from submission.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// An expression could not be evaluated where a non-optional result was
    /// required (e.g. actor-name resolution returning null).
    #[error("expression error: {reason}")]
    Expression { reason: String },

    /// A worker reported a task failure that exhausted its retry policy.
    #[error("task execution failed for stage '{stage}' task {task_index}: {message}")]
    TaskExecution {
        stage: String,
        task_index: u32,
        message: String,
    },

    /// Stage dispatch was rejected by an open circuit breaker.
    #[error("circuit breaker open for actor type '{actor_type}'")]
    CircuitOpen { actor_type: String },

    /// A human reviewer explicitly rejected an approval.
    #[error("approval '{approval_id}' rejected: {comment}")]
    ApprovalRejected { approval_id: String, comment: String },

    /// The pipeline was cancelled; short-circuits all subsequent scheduling.
    #[error("pipeline '{pipeline_id}' was cancelled")]
    Cancelled { pipeline_id: String },

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OrchestratorError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn expression(reason: impl Into<String>) -> Self {
        Self::Expression {
            reason: reason.into(),
        }
    }

    pub fn task_execution(
        stage: impl Into<String>,
        task_index: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskExecution {
            stage: stage.into(),
            task_index,
            message: message.into(),
        }
    }

    pub fn circuit_open(actor_type: impl Into<String>) -> Self {
        Self::CircuitOpen {
            actor_type: actor_type.into(),
        }
    }

    pub fn approval_rejected(approval_id: impl Into<String>, comment: impl Into<String>) -> Self {
        Self::ApprovalRejected {
            approval_id: approval_id.into(),
            comment: comment.into(),
        }
    }

    pub fn cancelled(pipeline_id: impl Into<String>) -> Self {
        Self::Cancelled {
            pipeline_id: pipeline_id.into(),
        }
    }

    /// Whether this error is one that legitimately leaves the pipeline in a
    /// terminal `failed` state, as opposed to one an internal retry loop
    /// should have already absorbed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Expression { .. })
    }
}
