//! In-memory reference implementation of [`StateStore`], used by every unit
//! and integration test. Not durable across process restarts — crash-resume
//! semantics are exercised by constructing a fresh instance and replaying
//! persisted state by hand in tests, or by the [`crate::state::surreal`]
//! backend in production.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use super::error::{Result, StateStoreError};
use super::{LeaseOutcome, PipelineStatusPatch, StageProgressDelta, StateStore};
use crate::records::{
    ApprovalRequest, CircuitBreakerState, CompensationEntry, ContextData, ContextSnapshot,
    DeadLetterRecord, PipelineRecord, PipelineStatus, StageRecord, StageStatus, TaskAttemptRecord,
    TaskLeaseRecord, TaskStatus,
};

const DEAD_LETTER_CAP: usize = 100;

type StageKey = (String, String);
type TaskListKey = (String, String, u32);
type LeaseKey = (String, String, u32);

#[derive(Default)]
struct Inner {
    pipelines: HashMap<String, PipelineRecord>,
    idempotency_index: HashMap<String, String>,
    running: HashSet<String>,
    stages: HashMap<StageKey, StageRecord>,
    task_attempts: HashMap<TaskListKey, Vec<TaskAttemptRecord>>,
    leases: HashMap<LeaseKey, TaskLeaseRecord>,
    context_version: HashMap<String, u64>,
    latest_context: HashMap<String, ContextSnapshot>,
    stage_outputs: HashMap<TaskListKey, Vec<Value>>,
    cancelled: HashSet<String>,
    compensation_stacks: HashMap<String, Vec<CompensationEntry>>,
    dead_letters: HashMap<String, VecDeque<DeadLetterRecord>>,
    circuit_breakers: HashMap<String, CircuitBreakerState>,
    approvals: HashMap<String, ApprovalRequest>,
}

/// `RwLock`-guarded in-process state store.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_pipeline(&self, record: PipelineRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(key) = record.idempotency_key.clone() {
            inner
                .idempotency_index
                .entry(key)
                .or_insert_with(|| record.pipeline_id.clone());
        }
        if record.status == PipelineStatus::Running {
            inner.running.insert(record.pipeline_id.clone());
        }
        inner.pipelines.insert(record.pipeline_id.clone(), record);
        Ok(())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>> {
        Ok(self.inner.read().await.pipelines.get(pipeline_id).cloned())
    }

    async fn find_pipeline_by_idempotency_key(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .await
            .idempotency_index
            .get(key)
            .cloned())
    }

    async fn set_pipeline_status(
        &self,
        pipeline_id: &str,
        status: PipelineStatus,
        patch: PipelineStatusPatch,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .pipelines
            .get_mut(pipeline_id)
            .ok_or_else(|| StateStoreError::not_found("pipeline", pipeline_id))?;
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
        match status {
            PipelineStatus::Running => {
                inner.running.insert(pipeline_id.to_string());
            }
            _ => {
                inner.running.remove(pipeline_id);
            }
        }
        Ok(())
    }

    async fn list_running_pipelines(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().await.running.iter().cloned().collect())
    }

    async fn upsert_stage(&self, record: StageRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .stages
            .insert((record.pipeline_id.clone(), record.stage_name.clone()), record);
        Ok(())
    }

    async fn get_stage(&self, pipeline_id: &str, stage_name: &str) -> Result<Option<StageRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .stages
            .get(&(pipeline_id.to_string(), stage_name.to_string()))
            .cloned())
    }

    async fn update_stage_progress(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        delta: StageProgressDelta,
    ) -> Result<StageRecord> {
        let mut inner = self.inner.write().await;
        let key = (pipeline_id.to_string(), stage_name.to_string());
        let record = inner
            .stages
            .get_mut(&key)
            .ok_or_else(|| StateStoreError::not_found("stage", stage_name))?;
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
        Ok(record.clone())
    }

    async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<StageRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn record_task_attempt(&self, mut record: TaskAttemptRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (
            record.pipeline_id.clone(),
            record.stage_name.clone(),
            record.attempt,
        );
        let list = inner.task_attempts.entry(key).or_default();
        if let Some(prior) = list.iter().rev().find(|t| t.task_index == record.task_index) {
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
        list.push(record);
        Ok(())
    }

    async fn list_task_attempts(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<TaskAttemptRecord>> {
        let key = (pipeline_id.to_string(), stage_name.to_string(), attempt);
        Ok(self
            .inner
            .read()
            .await
            .task_attempts
            .get(&key)
            .cloned()
            .unwrap_or_default())
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
        let mut latest_by_index: HashMap<u32, TaskAttemptRecord> = HashMap::new();
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
        let mut inner = self.inner.write().await;
        let key = (pipeline_id.to_string(), stage_name.to_string(), task_index);
        let now = Utc::now();
        let allowed = match inner.leases.get(&key) {
            None => true,
            Some(existing) => {
                existing.owner == owner || existing.expires_at <= now
            }
        };
        if !allowed {
            return Ok(LeaseOutcome::Denied);
        }
        let lease_id = uuid::Uuid::new_v4().to_string();
        let expires_at = now + chrono::Duration::milliseconds(ttl_ms as i64);
        inner.leases.insert(
            key,
            TaskLeaseRecord {
                pipeline_id: pipeline_id.to_string(),
                stage_name: stage_name.to_string(),
                task_index,
                lease_id: lease_id.clone(),
                owner,
                ttl_ms,
                expires_at,
                created_at: now,
                updated_at: now,
            },
        );
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
        let mut inner = self.inner.write().await;
        let key = (pipeline_id.to_string(), stage_name.to_string(), task_index);
        if let Some(existing) = inner.leases.get_mut(&key) {
            if existing.lease_id == lease_id && existing.owner.as_deref() == Some(owner) {
                existing.updated_at = Utc::now();
                existing.expires_at = existing.updated_at + chrono::Duration::milliseconds(existing.ttl_ms as i64);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn release_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
        lease_id: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let key = (pipeline_id.to_string(), stage_name.to_string(), task_index);
        let matches = inner.leases.get(&key).is_some_and(|l| l.lease_id == lease_id);
        if matches {
            inner.leases.remove(&key);
        }
        Ok(matches)
    }

    async fn get_task_lease(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        task_index: u32,
    ) -> Result<Option<TaskLeaseRecord>> {
        let key = (pipeline_id.to_string(), stage_name.to_string(), task_index);
        Ok(self.inner.read().await.leases.get(&key).cloned())
    }

    async fn snapshot_context(&self, pipeline_id: &str, data: ContextData) -> Result<ContextSnapshot> {
        let mut inner = self.inner.write().await;
        let version = inner
            .context_version
            .get(pipeline_id)
            .copied()
            .unwrap_or(0)
            + 1;
        inner
            .context_version
            .insert(pipeline_id.to_string(), version);
        let snapshot = ContextSnapshot {
            pipeline_id: pipeline_id.to_string(),
            version,
            data,
            created_at: Utc::now(),
        };
        inner
            .latest_context
            .insert(pipeline_id.to_string(), snapshot.clone());
        if let Some(record) = inner.pipelines.get_mut(pipeline_id) {
            record.context_version = version;
        }
        Ok(snapshot)
    }

    async fn get_latest_context(&self, pipeline_id: &str) -> Result<Option<ContextSnapshot>> {
        Ok(self.inner.read().await.latest_context.get(pipeline_id).cloned())
    }

    async fn append_stage_output(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
        output: Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (pipeline_id.to_string(), stage_name.to_string(), attempt);
        inner.stage_outputs.entry(key).or_default().push(output);
        Ok(())
    }

    async fn get_stage_outputs(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<Vec<Value>> {
        let key = (pipeline_id.to_string(), stage_name.to_string(), attempt);
        Ok(self
            .inner
            .read()
            .await
            .stage_outputs
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_stage_outputs(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (pipeline_id.to_string(), stage_name.to_string(), attempt);
        inner.stage_outputs.remove(&key);
        Ok(())
    }

    async fn mark_pipeline_cancelled(&self, pipeline_id: &str) -> Result<()> {
        self.inner.write().await.cancelled.insert(pipeline_id.to_string());
        Ok(())
    }

    async fn clear_pipeline_cancellation(&self, pipeline_id: &str) -> Result<()> {
        self.inner.write().await.cancelled.remove(pipeline_id);
        Ok(())
    }

    async fn is_pipeline_cancelled(&self, pipeline_id: &str) -> Result<bool> {
        Ok(self.inner.read().await.cancelled.contains(pipeline_id))
    }

    async fn push_compensation(&self, entry: CompensationEntry) -> Result<()> {
        self.inner
            .write()
            .await
            .compensation_stacks
            .entry(entry.pipeline_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn pop_compensation(&self, pipeline_id: &str) -> Result<Option<CompensationEntry>> {
        Ok(self
            .inner
            .write()
            .await
            .compensation_stacks
            .get_mut(pipeline_id)
            .and_then(Vec::pop))
    }

    async fn has_pending_compensations(&self, pipeline_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .compensation_stacks
            .get(pipeline_id)
            .is_some_and(|stack| !stack.is_empty()))
    }

    async fn clear_compensations(&self, pipeline_id: &str) -> Result<()> {
        self.inner.write().await.compensation_stacks.remove(pipeline_id);
        Ok(())
    }

    async fn archive_dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let queue = inner.dead_letters.entry(record.queue_name.clone()).or_default();
        queue.push_front(record);
        while queue.len() > DEAD_LETTER_CAP {
            queue.pop_back();
        }
        Ok(())
    }

    async fn list_dead_letters(&self, queue_name: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .dead_letters
            .get(queue_name)
            .map(|q| q.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_circuit_breaker(&self, actor_type: &str) -> Result<Option<CircuitBreakerState>> {
        Ok(self.inner.read().await.circuit_breakers.get(actor_type).cloned())
    }

    async fn save_circuit_breaker(&self, state: CircuitBreakerState) -> Result<()> {
        self.inner
            .write()
            .await
            .circuit_breakers
            .insert(state.actor_type.clone(), state);
        Ok(())
    }

    async fn save_approval(&self, request: ApprovalRequest) -> Result<()> {
        self.inner
            .write()
            .await
            .approvals
            .insert(request.approval_id.clone(), request);
        Ok(())
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        Ok(self.inner.read().await.approvals.get(approval_id).cloned())
    }

    async fn list_pending_approvals(
        &self,
        pipeline_id: Option<&str>,
        assign_to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>> {
        use crate::records::ApprovalStatus;
        Ok(self
            .inner
            .read()
            .await
            .approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .filter(|a| pipeline_id.is_none_or(|p| a.pipeline_id == p))
            .filter(|a| assign_to.is_none_or(|who| a.assign_to.as_deref() == Some(who)))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::records::StageRecord;
    use serde_json::json;

    fn pipeline(id: &str) -> PipelineRecord {
        PipelineRecord {
            pipeline_id: id.to_string(),
            definition: crate::definition::PipelineDefinition::new("p", vec![]),
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
        let store = InMemoryStateStore::new();
        store.create_pipeline(pipeline("p1")).await.unwrap();
        let fetched = store.get_pipeline("p1").await.unwrap();
        assert_eq!(fetched.unwrap().pipeline_id, "p1");
    }

    #[tokio::test]
    async fn idempotency_key_resolves_to_same_pipeline_id() {
        let store = InMemoryStateStore::new();
        let mut p = pipeline("p1");
        p.idempotency_key = Some("key-1".into());
        store.create_pipeline(p).await.unwrap();
        let resolved = store.find_pipeline_by_idempotency_key("key-1").await.unwrap();
        assert_eq!(resolved, Some("p1".to_string()));
    }

    #[tokio::test]
    async fn set_pipeline_status_updates_running_set() {
        let store = InMemoryStateStore::new();
        store.create_pipeline(pipeline("p1")).await.unwrap();
        assert_eq!(store.list_running_pipelines().await.unwrap(), vec!["p1".to_string()]);
        store
            .set_pipeline_status("p1", PipelineStatus::Completed, PipelineStatusPatch::default())
            .await
            .unwrap();
        assert!(store.list_running_pipelines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_attempt_fills_missing_fields_from_prior_attempt() {
        let store = InMemoryStateStore::new();
        let base = TaskAttemptRecord {
            pipeline_id: "p1".into(),
            stage_name: "s1".into(),
            task_index: 0,
            attempt: 1,
            retry_attempt: 1,
            status: TaskStatus::Queued,
            queue_name: "actor-Echo".into(),
            actor_type: "Echo".into(),
            message_id: "m1".into(),
            input: json!({"x": 1}),
            metadata: Some(json!({"k": "v"})),
            output: None,
            error: None,
            worker_id: None,
            queued_at: Utc::now(),
            available_at: None,
            completed_at: None,
            lease_id: "lease-1".into(),
            recorded_at: Utc::now(),
        };
        store.record_task_attempt(base.clone()).await.unwrap();

        let retry = TaskAttemptRecord {
            retry_attempt: 2,
            status: TaskStatus::Failed,
            input: Value::Null,
            metadata: None,
            actor_type: String::new(),
            queue_name: String::new(),
            message_id: String::new(),
            lease_id: "lease-2".into(),
            ..base
        };
        store.record_task_attempt(retry).await.unwrap();

        let attempts = store.list_task_attempts("p1", "s1", 1).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].input, json!({"x": 1}));
        assert_eq!(attempts[1].actor_type, "Echo");
    }

    #[tokio::test]
    async fn acquire_task_lease_denies_when_owned_and_not_expired() {
        let store = InMemoryStateStore::new();
        let first = store
            .acquire_task_lease("p1", "s1", 0, Some("worker-a".into()), 60_000)
            .await
            .unwrap();
        assert!(matches!(first, LeaseOutcome::Granted(_)));

        let second = store
            .acquire_task_lease("p1", "s1", 0, Some("worker-b".into()), 60_000)
            .await
            .unwrap();
        assert_eq!(second, LeaseOutcome::Denied);
    }

    #[tokio::test]
    async fn release_task_lease_only_succeeds_for_matching_id() {
        let store = InMemoryStateStore::new();
        let outcome = store
            .acquire_task_lease("p1", "s1", 0, None, 60_000)
            .await
            .unwrap();
        let LeaseOutcome::Granted(lease_id) = outcome else {
            panic!("expected granted lease")
        };
        assert!(!store.release_task_lease("p1", "s1", 0, "stale").await.unwrap());
        assert!(store.release_task_lease("p1", "s1", 0, &lease_id).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_context_increments_version_monotonically() {
        let store = InMemoryStateStore::new();
        store.create_pipeline(pipeline("p1")).await.unwrap();
        let s1 = store
            .snapshot_context("p1", ContextData::default())
            .await
            .unwrap();
        let s2 = store
            .snapshot_context("p1", ContextData::default())
            .await
            .unwrap();
        assert_eq!(s1.version, 1);
        assert_eq!(s2.version, 2);
    }

    #[tokio::test]
    async fn dead_letter_archive_is_capped_and_newest_first() {
        let store = InMemoryStateStore::new();
        for i in 0..150 {
            store
                .archive_dead_letter(DeadLetterRecord {
                    queue_name: "actor-Flaky:dlq".into(),
                    archived_at: Utc::now(),
                    message: json!({"i": i}),
                })
                .await
                .unwrap();
        }
        let archived = store.list_dead_letters("actor-Flaky:dlq", 200).await.unwrap();
        assert_eq!(archived.len(), 100);
        assert_eq!(archived[0].message, json!({"i": 149}));
    }

    #[tokio::test]
    async fn compensation_stack_is_lifo() {
        let store = InMemoryStateStore::new();
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
