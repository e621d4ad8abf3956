//! Durable record types persisted through the [`crate::state::StateStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::{ApprovalFallback, PipelineDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeCursor {
    pub stage_name: String,
    pub stage_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub pipeline_id: String,
    pub definition: PipelineDefinition,
    pub status: PipelineStatus,
    pub trigger_data: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub stage_order: Vec<String>,
    pub current_stage: Option<String>,
    pub resume_cursor: Option<ResumeCursor>,
    pub active_stages: Vec<String>,
    pub context_version: u64,
    pub metadata: Option<Value>,
    /// Present when submission carried an idempotency key, so a repeat
    /// submission with the same key can be recognized as a no-op.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub pipeline_id: String,
    pub stage_name: String,
    pub status: StageStatus,
    pub attempt: u32,
    pub expected_tasks: u32,
    pub completed_tasks: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs_ref: Option<String>,
    pub pending_approval_id: Option<String>,
    pub error: Option<String>,
    /// Set when the stage was torn down due to pipeline cancellation, so the
    /// archive can tell "failed" apart from "cancelled" without overloading
    /// `error`.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(pipeline_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            attempt: 1,
            expected_tasks: 0,
            completed_tasks: 0,
            started_at: None,
            completed_at: None,
            outputs_ref: None,
            pending_approval_id: None,
            error: None,
            cancelled_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttemptRecord {
    pub pipeline_id: String,
    pub stage_name: String,
    pub task_index: u32,
    pub attempt: u32,
    pub retry_attempt: u32,
    pub status: TaskStatus,
    pub queue_name: String,
    pub actor_type: String,
    pub message_id: String,
    pub input: Value,
    pub metadata: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub available_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLeaseRecord {
    pub pipeline_id: String,
    pub stage_name: String,
    pub task_index: u32,
    pub lease_id: String,
    pub owner: Option<String>,
    pub ttl_ms: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub pipeline_id: String,
    pub version: u64,
    pub data: ContextData,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextData {
    pub trigger: Value,
    pub stages: std::collections::BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub queue_name: String,
    pub archived_at: DateTime<Utc>,
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub pipeline_id: String,
    pub stage_name: String,
    pub actor: String,
    pub input: Value,
    pub stage_output: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-actor-type circuit breaker state, keyed by actor type in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub actor_type: String,
    pub state: BreakerState,
    pub failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
    pub half_open_successes: u32,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub half_open_requests: u32,
}

impl CircuitBreakerState {
    pub fn closed(
        actor_type: impl Into<String>,
        failure_threshold: u32,
        timeout_ms: u64,
        half_open_requests: u32,
    ) -> Self {
        Self {
            actor_type: actor_type.into(),
            state: BreakerState::Closed,
            failures: 0,
            last_failure_time: None,
            half_open_attempts: 0,
            half_open_successes: 0,
            failure_threshold,
            timeout_ms,
            half_open_requests,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecisionKind {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: ApprovalDecisionKind,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub pipeline_id: String,
    pub stage_name: String,
    pub assign_to: Option<String>,
    pub data: Value,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decision: Option<ApprovalDecision>,
    pub created_at: DateTime<Utc>,
    /// Carried forward from `HumanApprovalConfig.fallback` so the timeout
    /// worker can apply it without needing the originating pipeline
    /// definition in scope.
    pub fallback: ApprovalFallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stage_record_starts_pending_at_attempt_one() {
        let record = StageRecord::new("p1", "double");
        assert_eq!(record.status, StageStatus::Pending);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.completed_tasks, 0);
    }
}
