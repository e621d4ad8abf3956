//! State Store (C2): atomic persistence of pipeline/stage/task/lease/context
//! /DLQ/saga/circuit-breaker/approval records.

pub mod error;
pub mod memory;
pub mod surreal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use error::{Result, StateStoreError};

use crate::records::{
    ApprovalRequest, CircuitBreakerState, CompensationEntry, ContextData, ContextSnapshot,
    DeadLetterRecord, PipelineRecord, PipelineStatus, StageRecord, StageStatus, TaskAttemptRecord,
    TaskLeaseRecord, TaskStatus,
};

/// A patch applied to a pipeline record alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct PipelineStatusPatch {
    pub current_stage: Option<Option<String>>,
    pub active_stages: Option<Vec<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A delta applied to a stage record's progress fields. `None` fields are
/// left untouched; `completed_tasks_delta` is added to the existing count.
#[derive(Debug, Clone, Default)]
pub struct StageProgressDelta {
    pub status: Option<StageStatus>,
    pub expected_tasks: Option<u32>,
    pub completed_tasks_delta: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs_ref: Option<String>,
    pub error: Option<String>,
    pub pending_approval_id: Option<Option<String>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Result of requesting a task lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted(String),
    Denied,
}

/// Durable persistence for everything the orchestrator needs to survive a
/// restart. Operations that must change more than one piece of state
/// together (task attempt + task list, pipeline status + running-set
/// membership, context snapshot + latest-version pointer) are documented as
/// such and implementations must apply them atomically.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_pipeline(&self, record: PipelineRecord) -> Result<()>;
    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>>;
    async fn find_pipeline_by_idempotency_key(&self, key: &str) -> Result<Option<String>>;
    /// Atomically updates status, timestamps, and running-set membership.
    async fn set_pipeline_status(
        &self,
        pipeline_id: &str,
        status: PipelineStatus,
        patch: PipelineStatusPatch,
    ) -> Result<()>;
    async fn list_running_pipelines(&self) -> Result<Vec<String>>;

    async fn upsert_stage(&self, record: StageRecord) -> Result<()>;
    async fn get_stage(&self, pipeline_id: &str, stage_name: &str) -> Result<Option<StageRecord>>;
    async fn update_stage_progress(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        delta: StageProgressDelta,
    ) -> Result<StageRecord>;
    async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<StageRecord>>;

    /// Appends to the per-stage task list and writes the per-taskIndex
    /// "latest" cell atomically. Missing fields on update are filled from
    /// the prior value for that task index.
    async fn record_task_attempt(&self, record: TaskAttemptRecord) -> Result<()>;
    async fn list_task_attempts(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<TaskAttemptRecord>>;
    async fn get_task_status_map(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<std::collections::BTreeMap<u32, TaskStatus>>;
    async fn get_pending_tasks(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<TaskAttemptRecord>>;

    /// Succeeds only if there is no owner, the same owner already holds it,
    /// or the existing lease is expired.
    async fn acquire_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        owner: Option<String>,
        ttl_ms: u64,
    ) -> Result<LeaseOutcome>;
    /// Succeeds only if both the lease id and owner match.
    async fn renew_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        lease_id: &str,
        owner: &str,
    ) -> Result<bool>;
    /// Succeeds only if the lease id matches; silently no-ops otherwise.
    async fn release_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        lease_id: &str,
    ) -> Result<bool>;
    async fn get_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
    ) -> Result<Option<TaskLeaseRecord>>;

    /// Allocates the next version monotonically and updates the pipeline
    /// record's `contextVersion` atomically with the new snapshot.
    async fn snapshot_context(&self, pipeline_id: &str, data: ContextData) -> Result<ContextSnapshot>;
    async fn get_latest_context(&self, pipeline_id: &str) -> Result<Option<ContextSnapshot>>;

    async fn append_stage_output(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
        output: Value,
    ) -> Result<()>;
    async fn get_stage_outputs(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<Value>>;
    async fn clear_stage_outputs(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<()>;

    async fn mark_pipeline_cancelled(&self, pipeline_id: &str) -> Result<()>;
    async fn clear_pipeline_cancellation(&self, pipeline_id: &str) -> Result<()>;
    async fn is_pipeline_cancelled(&self, pipeline_id: &str) -> Result<bool>;

    async fn push_compensation(&self, entry: CompensationEntry) -> Result<()>;
    async fn pop_compensation(&self, pipeline_id: &str) -> Result<Option<CompensationEntry>>;
    async fn has_pending_compensations(&self, pipeline_id: &str) -> Result<bool>;
    async fn clear_compensations(&self, pipeline_id: &str) -> Result<()>;

    /// Archives into a capped ring (default 100) keyed by queue name.
    async fn archive_dead_letter(&self, record: DeadLetterRecord) -> Result<()>;
    async fn list_dead_letters(&self, queue_name: &str, limit: usize) -> Result<Vec<DeadLetterRecord>>;

    async fn get_circuit_breaker(&self, actor_type: &str) -> Result<Option<CircuitBreakerState>>;
    async fn save_circuit_breaker(&self, state: CircuitBreakerState) -> Result<()>;

    async fn save_approval(&self, request: ApprovalRequest) -> Result<()>;
    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>>;
    async fn list_pending_approvals(
        &self,
        pipeline_id: Option<&str>,
        assign_to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>>;
}

pub use memory::InMemoryStateStore;
pub use surreal::SurrealStateStore;
