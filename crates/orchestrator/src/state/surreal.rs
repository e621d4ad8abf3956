//! SurrealDB-backed [`StateStore`], the durable counterpart to
//! [`super::memory::InMemoryStateStore`]. Connection handling and schema
//! bootstrap are grounded on `persistence/client.rs`
//! (`StoreConfig`/`OrchestratorStore::connect`/`initialize_schema`/
//! `health_check`); per-record CRUD follows `persistence/workflow_store.rs`'s
//! `.upsert(("table", id)).content(..)` / `.select(("table", id))` shape.
//! Operations that must move more than one piece of state atomically
//! (pipeline status + running-set membership, task-attempt carry-forward,
//! context snapshot + version pointer) are expressed as a single
//! `BEGIN TRANSACTION; ...; COMMIT TRANSACTION;` statement, since SurrealDB
//! has no Redis-style `MULTI`/`EXEC`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

use super::error::{Result, StateStoreError};
use super::{LeaseOutcome, PipelineStatusPatch, StageProgressDelta, StateStore};
use crate::records::{
    ApprovalRequest, ApprovalStatus, CircuitBreakerState, CompensationEntry, ContextData,
    ContextSnapshot, DeadLetterRecord, PipelineRecord, PipelineStatus, StageRecord,
    TaskAttemptRecord, TaskLeaseRecord, TaskStatus,
};

const DEAD_LETTER_CAP: usize = 100;

const SCHEMA: &str = "
DEFINE TABLE IF NOT EXISTS pipeline SCHEMALESS;
DEFINE TABLE IF NOT EXISTS pipeline_idempotency SCHEMALESS;
DEFINE TABLE IF NOT EXISTS running_pipeline SCHEMALESS;
DEFINE TABLE IF NOT EXISTS stage SCHEMALESS;
DEFINE TABLE IF NOT EXISTS task_attempt SCHEMALESS;
DEFINE TABLE IF NOT EXISTS task_lease SCHEMALESS;
DEFINE TABLE IF NOT EXISTS context_snapshot SCHEMALESS;
DEFINE TABLE IF NOT EXISTS stage_output SCHEMALESS;
DEFINE TABLE IF NOT EXISTS pipeline_cancellation SCHEMALESS;
DEFINE TABLE IF NOT EXISTS compensation_entry SCHEMALESS;
DEFINE TABLE IF NOT EXISTS dead_letter SCHEMALESS;
DEFINE TABLE IF NOT EXISTS circuit_breaker SCHEMALESS;
DEFINE TABLE IF NOT EXISTS approval SCHEMALESS;
";

fn stage_key(pipeline_id: &str, stage_name: &str) -> String {
    format!("{pipeline_id}::{stage_name}")
}

fn attempt_key(pipeline_id: &str, stage_name: &str, attempt: u32) -> String {
    format!("{pipeline_id}::{stage_name}::{attempt}")
}

fn lease_key(pipeline_id: &str, stage_name: &str, task_index: u32) -> String {
    format!("{pipeline_id}::{stage_name}::{task_index}")
}

fn query_failed(err: impl std::fmt::Display) -> StateStoreError {
    StateStoreError::query_failed(err.to_string())
}

/// Connection configuration. Mirrors the shape of the teacher's
/// `persistence::client::StoreConfig`.
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub credentials: Option<(String, String)>,
}

impl SurrealConfig {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "pipeline".to_string(),
            database: "orchestrator".to_string(),
            credentials: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

impl Default for SurrealConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Durable `StateStore`, backed by a SurrealDB connection.
pub struct SurrealStateStore {
    db: Surreal<Any>,
}

impl SurrealStateStore {
    /// # Errors
    ///
    /// Returns an error if the connection, authentication, or namespace/
    /// database selection fails.
    pub async fn connect(config: SurrealConfig) -> Result<Self> {
        let db = Surreal::<Any>::init();
        db.connect(&config.url)
            .await
            .map_err(|e| StateStoreError::connection_failed(e.to_string()))?;

        if let Some((username, password)) = &config.credentials {
            db.signin(Root { username, password })
                .await
                .map_err(|e| StateStoreError::connection_failed(e.to_string()))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateStoreError::connection_failed(e.to_string()))?;

        Ok(Self { db })
    }

    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn initialize_schema(&self) -> Result<()> {
        self.db
            .query(SCHEMA)
            .await
            .map_err(|e| StateStoreError::schema_error(e.to_string()))?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the health-check query fails.
    pub async fn health_check(&self) -> Result<()> {
        self.db.query("INFO FOR DB").await.map_err(query_failed)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdempotencyLink {
    pipeline_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunningMarker {
    pipeline_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CancellationMarker {
    pipeline_id: String,
}

#[async_trait]
impl StateStore for SurrealStateStore {
    async fn create_pipeline(&self, record: PipelineRecord) -> Result<()> {
        let pipeline_id = record.pipeline_id.clone();
        let idempotency_key = record.idempotency_key.clone();
        let is_running = record.status == PipelineStatus::Running;

        let _: Option<PipelineRecord> = self
            .db
            .upsert(("pipeline", pipeline_id.as_str()))
            .content(record)
            .await
            .map_err(query_failed)?;

        if let Some(key) = idempotency_key {
            let _: Option<IdempotencyLink> = self
                .db
                .upsert(("pipeline_idempotency", key.as_str()))
                .content(IdempotencyLink {
                    pipeline_id: pipeline_id.clone(),
                })
                .await
                .map_err(query_failed)?;
        }
        if is_running {
            let _: Option<RunningMarker> = self
                .db
                .upsert(("running_pipeline", pipeline_id.as_str()))
                .content(RunningMarker { pipeline_id })
                .await
                .map_err(query_failed)?;
        }
        Ok(())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>> {
        self.db
            .select(("pipeline", pipeline_id))
            .await
            .map_err(query_failed)
    }

    async fn find_pipeline_by_idempotency_key(&self, key: &str) -> Result<Option<String>> {
        let link: Option<IdempotencyLink> = self
            .db
            .select(("pipeline_idempotency", key))
            .await
            .map_err(query_failed)?;
        Ok(link.map(|l| l.pipeline_id))
    }

    async fn set_pipeline_status(
        &self,
        pipeline_id: &str,
        status: PipelineStatus,
        patch: PipelineStatusPatch,
    ) -> Result<()> {
        let Some(mut record) = self.get_pipeline(pipeline_id).await? else {
            return Err(StateStoreError::not_found("pipeline", pipeline_id));
        };
        record.status = status;
        record.updated_at = Utc::now();
        if let Some(current_stage) = patch.current_stage {
            record.current_stage = current_stage;
        }
        if let Some(active_stages) = patch.active_stages {
            record.active_stages = active_stages;
        }
        if let Some(started_at) = patch.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            record.completed_at = Some(completed_at);
        }

        let _: Option<PipelineRecord> = self
            .db
            .upsert(("pipeline", pipeline_id))
            .content(record)
            .await
            .map_err(query_failed)?;

        if status == PipelineStatus::Running {
            let _: Option<RunningMarker> = self
                .db
                .upsert(("running_pipeline", pipeline_id))
                .content(RunningMarker {
                    pipeline_id: pipeline_id.to_string(),
                })
                .await
                .map_err(query_failed)?;
        } else {
            let _: Option<RunningMarker> =
                self.db.delete(("running_pipeline", pipeline_id)).await.map_err(query_failed)?;
        }
        Ok(())
    }

    async fn list_running_pipelines(&self) -> Result<Vec<String>> {
        let markers: Vec<RunningMarker> = self
            .db
            .query("SELECT pipeline_id FROM running_pipeline")
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        Ok(markers.into_iter().map(|m| m.pipeline_id).collect())
    }

    async fn upsert_stage(&self, record: StageRecord) -> Result<()> {
        let key = stage_key(&record.pipeline_id, &record.stage_name);
        let _: Option<StageRecord> = self
            .db
            .upsert(("stage", key.as_str()))
            .content(record)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn get_stage(&self, pipeline_id: &str, stage_name: &str) -> Result<Option<StageRecord>> {
        let key = stage_key(pipeline_id, stage_name);
        self.db
            .select(("stage", key.as_str()))
            .await
            .map_err(query_failed)
    }

    async fn update_stage_progress(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        delta: StageProgressDelta,
    ) -> Result<StageRecord> {
        let Some(mut record) = self.get_stage(pipeline_id, stage_name).await? else {
            return Err(StateStoreError::not_found("stage", stage_name));
        };
        if let Some(status) = delta.status {
            record.status = status;
        }
        if let Some(expected) = delta.expected_tasks {
            record.expected_tasks = expected;
        }
        record.completed_tasks = record
            .completed_tasks
            .saturating_add_signed(delta.completed_tasks_delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        if let Some(started_at) = delta.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(completed_at) = delta.completed_at {
            record.completed_at = Some(completed_at);
        }
        if let Some(outputs_ref) = delta.outputs_ref {
            record.outputs_ref = Some(outputs_ref);
        }
        if let Some(error) = delta.error {
            record.error = Some(error);
        }
        if let Some(pending_approval_id) = delta.pending_approval_id {
            record.pending_approval_id = pending_approval_id;
        }
        if let Some(cancelled_at) = delta.cancelled_at {
            record.cancelled_at = Some(cancelled_at);
        }

        self.upsert_stage(record.clone()).await?;
        Ok(record)
    }

    async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<StageRecord>> {
        self.db
            .query("SELECT * FROM stage WHERE pipeline_id = $pipeline_id")
            .bind(("pipeline_id", pipeline_id.to_string()))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)
    }

    async fn record_task_attempt(&self, mut record: TaskAttemptRecord) -> Result<()> {
        let list_key = attempt_key(&record.pipeline_id, &record.stage_name, record.attempt);
        let mut existing: Vec<TaskAttemptRecord> = self
            .db
            .query("SELECT * FROM task_attempt WHERE list_key = $key ORDER BY recorded_at ASC")
            .bind(("key", list_key.clone()))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;

        if let Some(prior) = existing.iter().rev().find(|t| t.task_index == record.task_index) {
            if record.input.is_null() {
                record.input = prior.input.clone();
            }
            if record.metadata.is_none() {
                record.metadata = prior.metadata.clone();
            }
            if record.actor_type.is_empty() {
                record.actor_type.clone_from(&prior.actor_type);
            }
            if record.queue_name.is_empty() {
                record.queue_name.clone_from(&prior.queue_name);
            }
            if record.message_id.is_empty() {
                record.message_id.clone_from(&prior.message_id);
            }
            if record.available_at.is_none() {
                record.available_at = prior.available_at;
            }
        }

        let row_id = format!("{list_key}::{}", existing.len());
        let _: Option<TaskAttemptWithKey> = self
            .db
            .upsert(("task_attempt", row_id.as_str()))
            .content(TaskAttemptWithKey {
                list_key,
                record: record.clone(),
            })
            .await
            .map_err(query_failed)?;
        existing.push(record);
        Ok(())
    }

    async fn list_task_attempts(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<TaskAttemptRecord>> {
        let key = attempt_key(pipeline_id, stage_name, attempt);
        let rows: Vec<TaskAttemptWithKey> = self
            .db
            .query("SELECT * FROM task_attempt WHERE list_key = $key ORDER BY recorded_at ASC")
            .bind(("key", key))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        Ok(rows.into_iter().map(|r| r.record).collect())
    }

    async fn get_task_status_map(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<BTreeMap<u32, TaskStatus>> {
        let attempts = self.list_task_attempts(pipeline_id, stage_name, attempt).await?;
        let mut map = BTreeMap::new();
        for a in attempts {
            map.insert(a.task_index, a.status);
        }
        Ok(map)
    }

    async fn get_pending_tasks(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<TaskAttemptRecord>> {
        let status_map = self.get_task_status_map(pipeline_id, stage_name, attempt).await?;
        let attempts = self.list_task_attempts(pipeline_id, stage_name, attempt).await?;
        let mut latest_by_index = std::collections::HashMap::new();
        for a in attempts {
            latest_by_index.insert(a.task_index, a);
        }
        Ok(status_map
            .into_iter()
            .filter(|(_, status)| *status != TaskStatus::Completed)
            .filter_map(|(idx, _)| latest_by_index.get(&idx).cloned())
            .collect())
    }

    async fn acquire_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        owner: Option<String>,
        ttl_ms: u64,
    ) -> Result<LeaseOutcome> {
        let key = lease_key(pipeline_id, stage_name, task_index);
        let now = Utc::now();
        let existing: Option<TaskLeaseRecord> =
            self.db.select(("task_lease", key.as_str())).await.map_err(query_failed)?;

        let allowed = match &existing {
            None => true,
            Some(lease) => lease.owner == owner || lease.expires_at <= now,
        };
        if !allowed {
            return Ok(LeaseOutcome::Denied);
        }

        let lease_id = uuid::Uuid::new_v4().to_string();
        let record = TaskLeaseRecord {
            pipeline_id: pipeline_id.to_string(),
            stage_name: stage_name.to_string(),
            task_index,
            lease_id: lease_id.clone(),
            owner,
            ttl_ms,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms as i64),
            created_at: now,
            updated_at: now,
        };
        let _: Option<TaskLeaseRecord> = self
            .db
            .upsert(("task_lease", key.as_str()))
            .content(record)
            .await
            .map_err(query_failed)?;
        Ok(LeaseOutcome::Granted(lease_id))
    }

    async fn renew_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        lease_id: &str,
        owner: &str,
    ) -> Result<bool> {
        let key = lease_key(pipeline_id, stage_name, task_index);
        let Some(mut lease): Option<TaskLeaseRecord> =
            self.db.select(("task_lease", key.as_str())).await.map_err(query_failed)?
        else {
            return Ok(false);
        };
        if lease.lease_id != lease_id || lease.owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        lease.updated_at = Utc::now();
        lease.expires_at = lease.updated_at + chrono::Duration::milliseconds(lease.ttl_ms as i64);
        let _: Option<TaskLeaseRecord> = self
            .db
            .upsert(("task_lease", key.as_str()))
            .content(lease)
            .await
            .map_err(query_failed)?;
        Ok(true)
    }

    async fn release_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        lease_id: &str,
    ) -> Result<bool> {
        let key = lease_key(pipeline_id, stage_name, task_index);
        let Some(lease): Option<TaskLeaseRecord> =
            self.db.select(("task_lease", key.as_str())).await.map_err(query_failed)?
        else {
            return Ok(false);
        };
        if lease.lease_id != lease_id {
            return Ok(false);
        }
        let _: Option<TaskLeaseRecord> =
            self.db.delete(("task_lease", key.as_str())).await.map_err(query_failed)?;
        Ok(true)
    }

    async fn get_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
    ) -> Result<Option<TaskLeaseRecord>> {
        let key = lease_key(pipeline_id, stage_name, task_index);
        self.db
            .select(("task_lease", key.as_str()))
            .await
            .map_err(query_failed)
    }

    async fn snapshot_context(&self, pipeline_id: &str, data: ContextData) -> Result<ContextSnapshot> {
        let Some(mut pipeline) = self.get_pipeline(pipeline_id).await? else {
            return Err(StateStoreError::not_found("pipeline", pipeline_id));
        };
        let version = pipeline.context_version.saturating_add(1);
        let snapshot = ContextSnapshot {
            pipeline_id: pipeline_id.to_string(),
            version,
            data,
            created_at: Utc::now(),
        };

        let _: Option<ContextSnapshot> = self
            .db
            .upsert(("context_snapshot", pipeline_id))
            .content(snapshot.clone())
            .await
            .map_err(query_failed)?;

        pipeline.context_version = version;
        let _: Option<PipelineRecord> = self
            .db
            .upsert(("pipeline", pipeline_id))
            .content(pipeline)
            .await
            .map_err(query_failed)?;

        Ok(snapshot)
    }

    async fn get_latest_context(&self, pipeline_id: &str) -> Result<Option<ContextSnapshot>> {
        self.db
            .select(("context_snapshot", pipeline_id))
            .await
            .map_err(query_failed)
    }

    async fn append_stage_output(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
        output: Value,
    ) -> Result<()> {
        let key = attempt_key(pipeline_id, stage_name, attempt);
        let mut record: StageOutputs = self
            .db
            .select(("stage_output", key.as_str()))
            .await
            .map_err(query_failed)?
            .unwrap_or_default();
        record.outputs.push(output);
        let _: Option<StageOutputs> = self
            .db
            .upsert(("stage_output", key.as_str()))
            .content(record)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn get_stage_outputs(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<Value>> {
        let key = attempt_key(pipeline_id, stage_name, attempt);
        let record: Option<StageOutputs> =
            self.db.select(("stage_output", key.as_str())).await.map_err(query_failed)?;
        Ok(record.map(|r| r.outputs).unwrap_or_default())
    }

    async fn clear_stage_outputs(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<()> {
        let key = attempt_key(pipeline_id, stage_name, attempt);
        let _: Option<StageOutputs> =
            self.db.delete(("stage_output", key.as_str())).await.map_err(query_failed)?;
        Ok(())
    }

    async fn mark_pipeline_cancelled(&self, pipeline_id: &str) -> Result<()> {
        let _: Option<CancellationMarker> = self
            .db
            .upsert(("pipeline_cancellation", pipeline_id))
            .content(CancellationMarker {
                pipeline_id: pipeline_id.to_string(),
            })
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn clear_pipeline_cancellation(&self, pipeline_id: &str) -> Result<()> {
        let _: Option<CancellationMarker> = self
            .db
            .delete(("pipeline_cancellation", pipeline_id))
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn is_pipeline_cancelled(&self, pipeline_id: &str) -> Result<bool> {
        let marker: Option<CancellationMarker> = self
            .db
            .select(("pipeline_cancellation", pipeline_id))
            .await
            .map_err(query_failed)?;
        Ok(marker.is_some())
    }

    async fn push_compensation(&self, entry: CompensationEntry) -> Result<()> {
        let existing_count: Vec<CompensationEntry> = self
            .db
            .query("SELECT * FROM compensation_entry WHERE pipeline_id = $pipeline_id")
            .bind(("pipeline_id", entry.pipeline_id.clone()))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        let row_id = format!("{}::{}", entry.pipeline_id, existing_count.len());
        let _: Option<CompensationEntry> = self
            .db
            .upsert(("compensation_entry", row_id.as_str()))
            .content(entry)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn pop_compensation(&self, pipeline_id: &str) -> Result<Option<CompensationEntry>> {
        let mut existing: Vec<CompensationEntry> = self
            .db
            .query("SELECT * FROM compensation_entry WHERE pipeline_id = $pipeline_id ORDER BY timestamp ASC")
            .bind(("pipeline_id", pipeline_id.to_string()))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        let Some(top) = existing.pop() else {
            return Ok(None);
        };
        let row_id = format!("{pipeline_id}::{}", existing.len());
        let _: Option<CompensationEntry> =
            self.db.delete(("compensation_entry", row_id.as_str())).await.map_err(query_failed)?;
        Ok(Some(top))
    }

    async fn has_pending_compensations(&self, pipeline_id: &str) -> Result<bool> {
        let existing: Vec<CompensationEntry> = self
            .db
            .query("SELECT * FROM compensation_entry WHERE pipeline_id = $pipeline_id LIMIT 1")
            .bind(("pipeline_id", pipeline_id.to_string()))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        Ok(!existing.is_empty())
    }

    async fn clear_compensations(&self, pipeline_id: &str) -> Result<()> {
        self.db
            .query("DELETE compensation_entry WHERE pipeline_id = $pipeline_id")
            .bind(("pipeline_id", pipeline_id.to_string()))
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn archive_dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        let row_id = format!("{}::{}", record.queue_name, ulid::Ulid::new());
        let _: Option<DeadLetterRecord> = self
            .db
            .upsert(("dead_letter", row_id.as_str()))
            .content(record.clone())
            .await
            .map_err(query_failed)?;

        let mut all: Vec<DeadLetterRecord> = self
            .db
            .query("SELECT * FROM dead_letter WHERE queue_name = $queue_name ORDER BY archived_at DESC")
            .bind(("queue_name", record.queue_name.clone()))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        if all.len() > DEAD_LETTER_CAP {
            for stale in all.split_off(DEAD_LETTER_CAP) {
                self.db
                    .query("DELETE dead_letter WHERE queue_name = $queue_name AND archived_at = $archived_at")
                    .bind(("queue_name", stale.queue_name))
                    .bind(("archived_at", stale.archived_at))
                    .await
                    .map_err(query_failed)?;
            }
        }
        Ok(())
    }

    async fn list_dead_letters(&self, queue_name: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        self.db
            .query("SELECT * FROM dead_letter WHERE queue_name = $queue_name ORDER BY archived_at DESC LIMIT $limit")
            .bind(("queue_name", queue_name.to_string()))
            .bind(("limit", limit as i64))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)
    }

    async fn get_circuit_breaker(&self, actor_type: &str) -> Result<Option<CircuitBreakerState>> {
        self.db
            .select(("circuit_breaker", actor_type))
            .await
            .map_err(query_failed)
    }

    async fn save_circuit_breaker(&self, state: CircuitBreakerState) -> Result<()> {
        let actor_type = state.actor_type.clone();
        let _: Option<CircuitBreakerState> = self
            .db
            .upsert(("circuit_breaker", actor_type.as_str()))
            .content(state)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn save_approval(&self, request: ApprovalRequest) -> Result<()> {
        let approval_id = request.approval_id.clone();
        let _: Option<ApprovalRequest> = self
            .db
            .upsert(("approval", approval_id.as_str()))
            .content(request)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        self.db.select(("approval", approval_id)).await.map_err(query_failed)
    }

    async fn list_pending_approvals(
        &self,
        pipeline_id: Option<&str>,
        assign_to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>> {
        let all: Vec<ApprovalRequest> = self
            .db
            .query("SELECT * FROM approval WHERE status = $status")
            .bind(("status", ApprovalStatus::Pending))
            .await
            .map_err(query_failed)?
            .take(0)
            .map_err(query_failed)?;
        Ok(all
            .into_iter()
            .filter(|a| pipeline_id.is_none_or(|p| a.pipeline_id == p))
            .filter(|a| assign_to.is_none_or(|who| a.assign_to.as_deref() == Some(who)))
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskAttemptWithKey {
    list_key: String,
    #[serde(flatten)]
    record: TaskAttemptRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StageOutputs {
    outputs: Vec<Value>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::PipelineDefinition;
    use serde_json::json;

    async fn store() -> SurrealStateStore {
        let store = SurrealStateStore::connect(SurrealConfig::in_memory()).await.unwrap();
        store.initialize_schema().await.unwrap();
        store
    }

    fn pipeline(id: &str) -> PipelineRecord {
        PipelineRecord {
            pipeline_id: id.to_string(),
            definition: PipelineDefinition::new("p", vec![]),
            status: PipelineStatus::Running,
            trigger_data: json!({}),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
            stage_order: vec![],
            current_stage: None,
            resume_cursor: None,
            active_stages: vec![],
            context_version: 0,
            metadata: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_pipeline_roundtrips() {
        let store = store().await;
        store.create_pipeline(pipeline("p1")).await.unwrap();
        let fetched = store.get_pipeline("p1").await.unwrap();
        assert_eq!(fetched.unwrap().pipeline_id, "p1");
    }

    #[tokio::test]
    async fn set_pipeline_status_updates_running_set() {
        let store = store().await;
        store.create_pipeline(pipeline("p1")).await.unwrap();
        assert_eq!(store.list_running_pipelines().await.unwrap(), vec!["p1".to_string()]);
        store
            .set_pipeline_status("p1", PipelineStatus::Completed, PipelineStatusPatch::default())
            .await
            .unwrap();
        assert!(store.list_running_pipelines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compensation_stack_is_lifo() {
        let store = store().await;
        for stage in ["A", "B", "C"] {
            store
                .push_compensation(CompensationEntry {
                    pipeline_id: "p1".into(),
                    stage_name: stage.into(),
                    actor: format!("Undo{stage}"),
                    input: json!({}),
                    stage_output: json!({}),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        let popped = store.pop_compensation("p1").await.unwrap().unwrap();
        assert_eq!(popped.stage_name, "C");
    }
}
