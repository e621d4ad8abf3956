//! Pipeline Orchestrator (C7): the DAG scheduler and state machine that ties
//! every other component together — graph construction and validation,
//! throttled task dispatch, barrier-gated stage completion, retry/DLQ/saga
//! failure handling, cooperative cancellation, and crash-resume. Grounded on
//! the teacher's pattern of a single service struct holding `Arc`-shared
//! collaborators behind a `RwLock`-guarded in-process cache, with durable
//! state as the source of truth and the in-process cache only an
//! optimization for throttling counters that would otherwise round-trip the
//! store on every dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::Utc;
use pipeline_core::GenericResultExt;
use pipeline_events::EventBus;
use pipeline_events::{EventKind, EventPattern, EventSubscription, PipelineEvent};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::approval::{ApprovalError, ApprovalOutcome, HumanApprovalExecutor};
use crate::circuit_breaker::CircuitBreaker;
use crate::dag::StageGraph;
use crate::definition::{ActorRef, PipelineDefinition, RetryPolicy, StageDefinition, StageMode};
use crate::error::{OrchestratorError, Result};
use crate::executors;
use crate::records::{
    ApprovalDecisionKind, ApprovalRequest, ContextData, DeadLetterRecord, PipelineRecord,
    PipelineStatus, StageRecord, StageStatus, TaskAttemptRecord, TaskStatus,
};
use crate::saga::SagaCoordinator;
use crate::state::{LeaseOutcome, PipelineStatusPatch, StageProgressDelta, StateStore};
use crate::tracer::Tracer;
use crate::transport::{EnqueuedJob, Transport};
use crate::worker::{FailurePayload, ResultPayload};

const TIMEOUT_QUEUE: &str = "approval-timeout-handler";
const TIMEOUT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

/// A task whose dispatch was deferred by a stage's `concurrency` limit.
#[derive(Debug, Clone)]
struct PendingTask {
    task_index: u32,
    actor_type: String,
    input: Value,
    metadata: Option<Value>,
    retry_policy: RetryPolicy,
    retry_attempt: u32,
    delay_ms: u64,
}

/// In-process-only scheduling state for one in-flight pipeline. Everything
/// that must survive a restart lives in the [`StateStore`] instead; this is
/// purely an optimization so concurrency throttling doesn't round-trip the
/// store on every dispatch.
struct ExecutionState {
    graph: StageGraph,
    active_tasks: HashMap<String, u32>,
    pending_tasks: HashMap<String, VecDeque<PendingTask>>,
}

/// The Pipeline Orchestrator: owns DAG execution for every in-flight
/// pipeline backed by a shared [`StateStore`] and [`Transport`].
pub struct PipelineOrchestrator {
    self_weak: Weak<PipelineOrchestrator>,
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    saga: SagaCoordinator,
    approvals: HumanApprovalExecutor,
    tracer: Arc<dyn Tracer>,
    events: Arc<EventBus>,
    instance_id: String,
    /// Whether the circuit breaker is driven by the transport's wildcard
    /// failure stream rather than this orchestrator's own failure handling,
    /// to avoid double-counting the same failure (§9 Open Question b).
    breaker_driven_by_transport: bool,
    state: RwLock<HashMap<String, ExecutionState>>,
    resume_rx: watch::Receiver<bool>,
}

impl PipelineOrchestrator {
    /// Constructs the orchestrator and immediately spawns its two background
    /// loops: crash-resume (runs once) and, if the transport exposes one, a
    /// listener that drives the circuit breaker from its wildcard failure
    /// stream. A third loop drains the human-approval timeout queue.
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        tracer: Arc<dyn Tracer>,
    ) -> Arc<Self> {
        let (resume_tx, resume_rx) = watch::channel(false);
        let breaker = CircuitBreaker::new(store.clone());
        let saga = SagaCoordinator::new(store.clone(), transport.clone());
        let approvals = HumanApprovalExecutor::new(store.clone(), transport.clone(), events.clone());
        let breaker_driven_by_transport = transport.subscribe_failures().is_some();

        let orchestrator = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            store,
            transport: transport.clone(),
            breaker,
            saga,
            approvals,
            tracer,
            events,
            instance_id: Ulid::new().to_string(),
            breaker_driven_by_transport,
            state: RwLock::new(HashMap::new()),
            resume_rx,
        });

        if let Some(mut failures) = transport.subscribe_failures() {
            let orch = orchestrator.clone();
            tokio::spawn(async move {
                while let Ok(event) = failures.recv().await {
                    if let Err(err) = orch.breaker.record_failure(&event.actor_type).await {
                        warn!(actor_type = %event.actor_type, error = %err, "failed to record breaker failure");
                    }
                }
            });
        }

        let timeout_orch = orchestrator.clone();
        tokio::spawn(async move { timeout_orch.run_approval_timeout_loop().await });

        let resume_orch = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = resume_orch.resume_in_flight_pipelines().await {
                warn!(error = %err, "resume of in-flight pipelines failed");
            }
            let _ = resume_tx.send(true);
        });

        orchestrator
    }

    /// Upgrades the orchestrator's own weak handle. Returns `None` only if
    /// the orchestrator itself has already been dropped, in which case there
    /// is nothing left to spawn work against.
    fn handle(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    fn spawn_stage(&self, pipeline_id: String, stage_name: String) {
        let Some(orch) = self.handle() else {
            warn!(pipeline_id = %pipeline_id, stage = %stage_name, "orchestrator dropped, skipping stage spawn");
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = orch.execute_stage(pipeline_id.clone(), stage_name.clone()).await {
                warn!(pipeline_id = %pipeline_id, stage = %stage_name, error = %err, "stage execution failed");
            }
        });
    }

    /// Blocks until the initial crash-resume scan has finished, so a fresh
    /// submission or result/failure report can't race a pipeline still being
    /// rehydrated from durable state.
    pub async fn wait_for_resume(&self) {
        let mut rx = self.resume_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    // ---- External API --------------------------------------------------

    /// Submits a pipeline for execution. If `idempotency_key` names a
    /// pipeline already submitted, returns its id without starting a second
    /// run.
    pub async fn execute(
        &self,
        definition: PipelineDefinition,
        trigger_data: Value,
        idempotency_key: Option<String>,
    ) -> Result<String> {
        self.wait_for_resume().await;

        if let Some(key) = &idempotency_key {
            if let Some(existing_id) = self.store.find_pipeline_by_idempotency_key(key).await? {
                return Ok(existing_id);
            }
        }

        let graph = StageGraph::build(&definition)?;
        let pipeline_id = Ulid::new().to_string();
        let now = Utc::now();
        let entry_stages = graph.entry_stages();
        let stage_order = graph.topological_order().to_vec();

        let record = PipelineRecord {
            pipeline_id: pipeline_id.clone(),
            definition: definition.clone(),
            status: PipelineStatus::Running,
            trigger_data: trigger_data.clone(),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
            stage_order,
            current_stage: None,
            resume_cursor: None,
            active_stages: Vec::new(),
            context_version: 0,
            metadata: None,
            idempotency_key,
        };
        self.store.create_pipeline(record).await?;

        for stage in &definition.stages {
            self.store.upsert_stage(StageRecord::new(&pipeline_id, &stage.name)).await?;
        }

        self.store
            .snapshot_context(
                &pipeline_id,
                ContextData {
                    trigger: trigger_data,
                    stages: Default::default(),
                },
            )
            .await?;

        self.state.write().await.insert(
            pipeline_id.clone(),
            ExecutionState {
                graph,
                active_tasks: HashMap::new(),
                pending_tasks: HashMap::new(),
            },
        );

        self.tracer.pipeline_started(&pipeline_id, &definition.name);
        let _ = self
            .events
            .publish(PipelineEvent::new(pipeline_id.clone(), EventKind::PipelineStarted))
            .await;

        for stage_name in entry_stages {
            self.spawn_stage(pipeline_id.clone(), stage_name);
        }

        Ok(pipeline_id)
    }

    /// Cancels a pipeline. Cooperative: outstanding task results/failures
    /// still arrive and are dropped rather than drained eagerly.
    pub async fn cancel(&self, pipeline_id: &str) -> Result<()> {
        self.store.mark_pipeline_cancelled(pipeline_id).await?;
        self.abort_if_cancelled(pipeline_id).await?;
        Ok(())
    }

    pub async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>> {
        Ok(self.store.get_pipeline(pipeline_id).await?)
    }

    pub async fn list_dead_letter_messages(&self, queue_name: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.store.list_dead_letters(queue_name, limit).await?)
    }

    pub async fn submit_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecisionKind,
        decided_by: &str,
        comment: Option<String>,
    ) -> Result<()> {
        Ok(self.approvals.submit_decision(approval_id, decision, decided_by, comment).await?)
    }

    pub async fn get_pending_approvals(
        &self,
        pipeline_id: Option<&str>,
        assign_to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>> {
        Ok(self.approvals.get_pending_approvals(pipeline_id, assign_to, limit).await?)
    }

    pub async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        Ok(self.approvals.get_approval(approval_id).await?)
    }

    pub async fn subscribe_to_approvals(&self) -> EventSubscription {
        let (_, subscription) = self
            .events
            .subscribe_with_pattern(EventPattern::ByTypes(vec![
                "approval_requested".to_string(),
                "approval_decided".to_string(),
                "approval_escalated".to_string(),
            ]))
            .await;
        subscription
    }

    async fn run_approval_timeout_loop(self: Arc<Self>) {
        loop {
            match self.transport.receive(TIMEOUT_QUEUE).await {
                Ok(Some(job)) => {
                    if let Some(approval_id) = job.payload.get("approvalId").and_then(Value::as_str) {
                        if let Err(err) = self.approvals.handle_timeout(approval_id).await {
                            warn!(approval_id, error = %err, "approval timeout handling failed");
                        }
                    }
                }
                Ok(None) => tokio::time::sleep(TIMEOUT_POLL_INTERVAL).await,
                Err(err) => {
                    warn!(error = %err, "approval timeout queue receive failed");
                    tokio::time::sleep(TIMEOUT_POLL_INTERVAL).await;
                }
            }
        }
    }

    // ---- Cancellation ----------------------------------------------------

    /// Returns `true` (and tears down in-process/durable state exactly once)
    /// if the pipeline has been cancelled.
    async fn abort_if_cancelled(&self, pipeline_id: &str) -> Result<bool> {
        if !self.store.is_pipeline_cancelled(pipeline_id).await? {
            return Ok(false);
        }
        let evicted = self.state.write().await.remove(pipeline_id).is_some();
        if evicted {
            self.saga.clear(pipeline_id).await?;
            self.store
                .set_pipeline_status(
                    pipeline_id,
                    PipelineStatus::Failed,
                    PipelineStatusPatch {
                        current_stage: Some(None),
                        active_stages: Some(Vec::new()),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.tracer.pipeline_failed(pipeline_id, "cancelled");
            let _ = self
                .events
                .publish(PipelineEvent::new(
                    pipeline_id.to_string(),
                    EventKind::PipelineFailed {
                        error: "cancelled".to_string(),
                    },
                ))
                .await;
        }
        Ok(true)
    }

    // ---- Stage execution ---------------------------------------------

    async fn execute_stage(&self, pipeline_id: String, stage_name: String) -> Result<()> {
        if self.abort_if_cancelled(&pipeline_id).await? {
            return Ok(());
        }

        let Some(pipeline_record) = self.store.get_pipeline(&pipeline_id).await? else {
            return Ok(());
        };
        let Some(stage) = pipeline_record.definition.stage(&stage_name).cloned() else {
            return Err(OrchestratorError::configuration(format!(
                "stage '{stage_name}' not found in its own pipeline definition"
            )));
        };

        if let Some(breaker_config) = &stage.circuit_breaker {
            let actor_hint = breaker_actor_hint(&stage);
            self.breaker.ensure_config(&actor_hint, breaker_config).await?;
            if !self.breaker.should_allow(&actor_hint).await? {
                let error = OrchestratorError::circuit_open(actor_hint).to_string();
                self.handle_pipeline_failure(&pipeline_id, &stage_name, error).await?;
                return Ok(());
            }
        }

        self.store.clear_stage_outputs(&pipeline_id, &stage_name, 1).await?;
        self.store
            .update_stage_progress(
                &pipeline_id,
                &stage_name,
                StageProgressDelta {
                    status: Some(StageStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.add_active_stage(&pipeline_id, &stage_name).await?;
        self.tracer.stage_started(&pipeline_id, &stage_name, 1);
        let _ = self
            .events
            .publish(
                PipelineEvent::new(pipeline_id.clone(), EventKind::StageStarted { attempt: 1 })
                    .with_stage(stage_name.clone()),
            )
            .await;

        let context = self.build_context_value(&pipeline_id).await?;

        if stage.mode == StageMode::HumanApproval {
            return self.execute_human_approval_stage(pipeline_id, stage_name, stage, context).await;
        }

        let Some(executor) = executors::for_mode(stage.mode) else {
            self.handle_pipeline_failure(&pipeline_id, &stage_name, "no executor registered for stage mode".into())
                .await?;
            return Ok(());
        };
        if let Err(reason) = executor.validate(&stage) {
            self.handle_pipeline_failure(&pipeline_id, &stage_name, reason).await?;
            return Ok(());
        }
        let outcome = match executor.execute(&stage, &context) {
            Ok(outcome) => outcome,
            Err(reason) => {
                self.handle_pipeline_failure(&pipeline_id, &stage_name, reason).await?;
                return Ok(());
            }
        };

        self.store
            .update_stage_progress(
                &pipeline_id,
                &stage_name,
                StageProgressDelta {
                    expected_tasks: Some(outcome.expected_tasks),
                    ..Default::default()
                },
            )
            .await?;

        for (index, task) in outcome.tasks.into_iter().enumerate() {
            let task_index = u32::try_from(index).unwrap_or(u32::MAX);
            let retry_policy = task.retry_policy.clone().unwrap_or_else(|| stage.effective_retry());
            let delay_ms = task.delay_ms.unwrap_or(stage.config.initial_delay_ms);
            self.schedule_task(
                &pipeline_id,
                &stage,
                1,
                task_index,
                task.actor_type,
                task.input,
                task.metadata,
                retry_policy,
                1,
                delay_ms,
            )
            .await?;
        }

        if outcome.expected_tasks == 0 {
            if let Some(output) = outcome.synchronous_output {
                self.store.append_stage_output(&pipeline_id, &stage_name, 1, output).await?;
            }
            self.complete_stage(&pipeline_id, &stage_name).await?;
        }

        Ok(())
    }

    async fn execute_human_approval_stage(
        &self,
        pipeline_id: String,
        stage_name: String,
        stage: StageDefinition,
        context: Value,
    ) -> Result<()> {
        let Some(config) = &stage.human_approval else {
            self.handle_pipeline_failure(
                &pipeline_id,
                &stage_name,
                "human-approval stage missing its humanApproval config".into(),
            )
            .await?;
            return Ok(());
        };
        let input = Value::Object(crate::expr::resolve_input_map(&stage.input, &context));

        match self.approvals.execute(&pipeline_id, &stage_name, config, input).await {
            Ok(ApprovalOutcome::Approved { output }) => {
                self.store
                    .update_stage_progress(
                        &pipeline_id,
                        &stage_name,
                        StageProgressDelta {
                            expected_tasks: Some(0),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store.append_stage_output(&pipeline_id, &stage_name, 1, output).await?;
                self.complete_stage(&pipeline_id, &stage_name).await?;
            }
            Ok(ApprovalOutcome::Rejected { comment }) => {
                let err = OrchestratorError::approval_rejected(&stage_name, comment.unwrap_or_default());
                self.handle_pipeline_failure(&pipeline_id, &stage_name, err.to_string()).await?;
            }
            Err(err @ ApprovalError::HardTimeout(_)) => {
                self.handle_pipeline_failure(&pipeline_id, &stage_name, err.to_string()).await?;
            }
            Err(err) => {
                self.handle_pipeline_failure(&pipeline_id, &stage_name, err.to_string()).await?;
            }
        }
        Ok(())
    }

    // ---- Task scheduling & dispatch ------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn schedule_task(
        &self,
        pipeline_id: &str,
        stage: &StageDefinition,
        attempt: u32,
        task_index: u32,
        actor_type: String,
        input: Value,
        metadata: Option<Value>,
        retry_policy: RetryPolicy,
        retry_attempt: u32,
        delay_ms: u64,
    ) -> Result<()> {
        if self.abort_if_cancelled(pipeline_id).await? {
            return Ok(());
        }

        let should_dispatch = {
            let mut guard = self.state.write().await;
            let Some(execution) = guard.get_mut(pipeline_id) else {
                return Ok(());
            };
            let active = *execution.active_tasks.get(&stage.name).unwrap_or(&0);
            if stage.config.concurrency > 0 && active >= stage.config.concurrency {
                execution.pending_tasks.entry(stage.name.clone()).or_default().push_back(PendingTask {
                    task_index,
                    actor_type,
                    input,
                    metadata,
                    retry_policy,
                    retry_attempt,
                    delay_ms,
                });
                false
            } else {
                let slot = execution.active_tasks.entry(stage.name.clone()).or_insert(0);
                    *slot = slot.saturating_add(1);
                true
            }
        };

        if should_dispatch {
            self.dispatch(pipeline_id, stage, attempt, task_index, actor_type, input, metadata, retry_policy, retry_attempt, delay_ms)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        pipeline_id: &str,
        stage: &StageDefinition,
        attempt: u32,
        task_index: u32,
        actor_type: String,
        input: Value,
        metadata: Option<Value>,
        retry_policy: RetryPolicy,
        retry_attempt: u32,
        delay_ms: u64,
    ) -> Result<()> {
        let ttl_ms = stage.lease_ttl_ms();
        let lease_outcome = self
            .store
            .acquire_task_lease(pipeline_id, &stage.name, task_index, Some(self.instance_id.clone()), ttl_ms)
            .await?;
        let LeaseOutcome::Granted(lease_id) = lease_outcome else {
            return Ok(());
        };

        let message_id = Ulid::new().to_string();
        let job_id = deterministic_job_id(pipeline_id, &stage.name, attempt, task_index, retry_attempt);
        let queue_name = format!("actor-{actor_type}");
        let payload = serde_json::json!({
            "messageId": message_id,
            "from": pipeline_id,
            "to": actor_type,
            "type": "execute",
            "payload": {
                "pipelineId": pipeline_id,
                "stageName": stage.name,
                "taskIndex": task_index,
                "input": input,
                "metadata": metadata,
                "attempt": attempt,
                "retryAttempt": retry_attempt,
                "retryPolicy": retry_policy,
                "leaseId": lease_id,
                "leaseTtlMs": ttl_ms,
            },
            "timestamp": Utc::now(),
        });

        self.transport
            .enqueue(EnqueuedJob::now(job_id, queue_name.clone(), payload).with_attempts(1).delayed(delay_ms))
            .await?;

        self.store
            .record_task_attempt(TaskAttemptRecord {
                pipeline_id: pipeline_id.to_string(),
                stage_name: stage.name.clone(),
                task_index,
                attempt,
                retry_attempt,
                status: TaskStatus::Queued,
                queue_name,
                actor_type: actor_type.clone(),
                message_id,
                input,
                metadata,
                output: None,
                error: None,
                worker_id: None,
                queued_at: Utc::now(),
                available_at: if delay_ms > 0 {
                    Some(Utc::now() + chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64))
                } else {
                    None
                },
                completed_at: None,
                lease_id,
                recorded_at: Utc::now(),
            })
            .await?;

        self.tracer.task_scheduled(pipeline_id, &stage.name, task_index, &actor_type);
        Ok(())
    }

    async fn drain_pending(&self, pipeline_id: &str, stage: &StageDefinition, attempt: u32) -> Result<()> {
        loop {
            let popped = {
                let mut guard = self.state.write().await;
                let Some(execution) = guard.get_mut(pipeline_id) else {
                    return Ok(());
                };
                let active = *execution.active_tasks.get(&stage.name).unwrap_or(&0);
                if stage.config.concurrency > 0 && active >= stage.config.concurrency {
                    None
                } else {
                    match execution.pending_tasks.get_mut(&stage.name).and_then(VecDeque::pop_front) {
                        Some(task) => {
                            let slot = execution.active_tasks.entry(stage.name.clone()).or_insert(0);
                    *slot = slot.saturating_add(1);
                            Some(task)
                        }
                        None => None,
                    }
                }
            };
            let Some(task) = popped else { break };
            self.dispatch(
                pipeline_id,
                stage,
                attempt,
                task.task_index,
                task.actor_type,
                task.input,
                task.metadata,
                task.retry_policy,
                task.retry_attempt,
                task.delay_ms,
            )
            .await?;
        }
        Ok(())
    }

    async fn decrement_active(&self, pipeline_id: &str, stage_name: &str) {
        let mut guard = self.state.write().await;
        if let Some(execution) = guard.get_mut(pipeline_id) {
            if let Some(active) = execution.active_tasks.get_mut(stage_name) {
                *active = active.saturating_sub(1);
            }
        }
    }

    async fn stage_is_active(&self, pipeline_id: &str, stage_name: &str) -> bool {
        matches!(
            self.store.get_pipeline(pipeline_id).await,
            Ok(Some(record)) if record.active_stages.iter().any(|s| s == stage_name)
        )
    }

    async fn latest_task_attempt(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        attempt: u32,
        task_index: u32,
    ) -> Result<Option<TaskAttemptRecord>> {
        let attempts = self.store.list_task_attempts(pipeline_id, stage_name, attempt).await?;
        Ok(attempts.into_iter().rev().find(|a| a.task_index == task_index))
    }

    // ---- Result / failure handling (called by the C8 worker) ---------

    /// Handles a worker-reported task success.
    pub async fn handle_stage_result(&self, payload: ResultPayload) -> Result<()> {
        self.wait_for_resume().await;
        let attempt = payload.attempt.unwrap_or(1);

        let Some(lease_id) = payload.lease_id else {
            warn!(pipeline_id = %payload.pipeline_id, stage = %payload.stage_name, "result missing leaseId, dropping");
            return Ok(());
        };
        let released = self
            .store
            .release_task_lease(&payload.pipeline_id, &payload.stage_name, payload.task_index, &lease_id)
            .await?;
        if !released {
            warn!(pipeline_id = %payload.pipeline_id, stage = %payload.stage_name, task_index = payload.task_index, "stale lease on result, dropping");
            return Ok(());
        }
        if self.abort_if_cancelled(&payload.pipeline_id).await? {
            return Ok(());
        }
        if !self.stage_is_active(&payload.pipeline_id, &payload.stage_name).await {
            return Ok(());
        }

        self.decrement_active(&payload.pipeline_id, &payload.stage_name).await;

        let prior = self
            .latest_task_attempt(&payload.pipeline_id, &payload.stage_name, attempt, payload.task_index)
            .await?;
        let retry_attempt = payload.retry_attempt.or(prior.as_ref().map(|p| p.retry_attempt)).unwrap_or(1);
        let queued_at = prior.as_ref().map(|p| p.queued_at).unwrap_or_else(Utc::now);
        let actor_type = prior.as_ref().map(|p| p.actor_type.clone()).unwrap_or_default();

        self.store
            .record_task_attempt(TaskAttemptRecord {
                pipeline_id: payload.pipeline_id.clone(),
                stage_name: payload.stage_name.clone(),
                task_index: payload.task_index,
                attempt,
                retry_attempt,
                status: TaskStatus::Completed,
                queue_name: String::new(),
                actor_type: String::new(),
                message_id: String::new(),
                input: Value::Null,
                metadata: None,
                output: Some(payload.output.clone()),
                error: None,
                worker_id: payload.worker_id,
                queued_at,
                available_at: None,
                completed_at: Some(Utc::now()),
                lease_id,
                recorded_at: Utc::now(),
            })
            .await?;

        self.store
            .append_stage_output(&payload.pipeline_id, &payload.stage_name, attempt, payload.output)
            .await?;

        let Some(pipeline_record) = self.store.get_pipeline(&payload.pipeline_id).await? else {
            return Ok(());
        };
        let Some(stage_def) = pipeline_record.definition.stage(&payload.stage_name).cloned() else {
            return Ok(());
        };

        if stage_def.circuit_breaker.is_some() && !actor_type.is_empty() {
            self.breaker.record_success(&actor_type).await?;
        }

        let updated_stage = self
            .store
            .update_stage_progress(
                &payload.pipeline_id,
                &payload.stage_name,
                StageProgressDelta {
                    completed_tasks_delta: 1,
                    ..Default::default()
                },
            )
            .await?;

        self.drain_pending(&payload.pipeline_id, &stage_def, attempt).await?;

        if updated_stage.completed_tasks >= updated_stage.expected_tasks {
            self.complete_stage(&payload.pipeline_id, &payload.stage_name).await?;
        }

        Ok(())
    }

    /// Handles a worker-reported task failure: retries with backoff, or
    /// archives to the dead-letter queue and fails the pipeline once the
    /// retry budget is exhausted.
    pub async fn handle_stage_failure(&self, payload: FailurePayload) -> Result<()> {
        self.wait_for_resume().await;
        let attempt = payload.attempt.unwrap_or(1);

        let Some(lease_id) = payload.lease_id else {
            warn!(pipeline_id = %payload.pipeline_id, stage = %payload.stage_name, "failure missing leaseId, dropping");
            return Ok(());
        };
        let released = self
            .store
            .release_task_lease(&payload.pipeline_id, &payload.stage_name, payload.task_index, &lease_id)
            .await?;
        if !released {
            warn!(pipeline_id = %payload.pipeline_id, stage = %payload.stage_name, task_index = payload.task_index, "stale lease on failure, dropping");
            return Ok(());
        }
        if self.abort_if_cancelled(&payload.pipeline_id).await? {
            return Ok(());
        }
        if !self.stage_is_active(&payload.pipeline_id, &payload.stage_name).await {
            return Ok(());
        }

        self.decrement_active(&payload.pipeline_id, &payload.stage_name).await;

        let prior = self
            .latest_task_attempt(&payload.pipeline_id, &payload.stage_name, attempt, payload.task_index)
            .await?;
        let retry_attempt = payload.retry_attempt.or(prior.as_ref().map(|p| p.retry_attempt)).unwrap_or(1);
        let queued_at = prior.as_ref().map(|p| p.queued_at).unwrap_or_else(Utc::now);

        self.store
            .record_task_attempt(TaskAttemptRecord {
                pipeline_id: payload.pipeline_id.clone(),
                stage_name: payload.stage_name.clone(),
                task_index: payload.task_index,
                attempt,
                retry_attempt,
                status: TaskStatus::Failed,
                queue_name: String::new(),
                actor_type: payload.actor_type.clone(),
                message_id: String::new(),
                input: payload.input.clone(),
                metadata: payload.metadata.clone(),
                output: None,
                error: Some(payload.error.message.clone()),
                worker_id: None,
                queued_at,
                available_at: None,
                completed_at: Some(Utc::now()),
                lease_id,
                recorded_at: Utc::now(),
            })
            .await?;

        let Some(pipeline_record) = self.store.get_pipeline(&payload.pipeline_id).await? else {
            return Ok(());
        };
        let Some(stage_def) = pipeline_record.definition.stage(&payload.stage_name).cloned() else {
            return Ok(());
        };

        self.drain_pending(&payload.pipeline_id, &stage_def, attempt).await?;

        if !self.breaker_driven_by_transport && stage_def.circuit_breaker.is_some() {
            self.breaker.record_failure(&payload.actor_type).await?;
        }

        let policy = payload.retry_policy.unwrap_or_else(|| stage_def.effective_retry());

        if retry_attempt < policy.max_attempts {
            let next_retry_attempt = retry_attempt.saturating_add(1);
            let delay_ms = policy.backoff_for(next_retry_attempt);
            self.tracer
                .task_retried(&payload.pipeline_id, &payload.stage_name, payload.task_index, next_retry_attempt);
            self.schedule_task(
                &payload.pipeline_id,
                &stage_def,
                attempt,
                payload.task_index,
                payload.actor_type,
                payload.input,
                payload.metadata,
                policy,
                next_retry_attempt,
                delay_ms,
            )
            .await?;
            return Ok(());
        }

        let queue_name = stage_def.dead_letter_queue(&payload.actor_type);
        let dlq_message = serde_json::json!({
            "type": "dead-letter",
            "pipelineId": payload.pipeline_id,
            "stageName": payload.stage_name,
            "taskIndex": payload.task_index,
            "actorType": payload.actor_type,
            "input": payload.input,
            "metadata": payload.metadata,
            "error": {
                "message": payload.error.message,
                "code": payload.error.code,
                "retryable": payload.error.retryable,
            },
            "deadLetterQueue": queue_name,
        });
        self.store
            .archive_dead_letter(DeadLetterRecord {
                queue_name: queue_name.clone(),
                archived_at: Utc::now(),
                message: dlq_message.clone(),
            })
            .await?;
        self.transport
            .enqueue(EnqueuedJob::now(
                format!("dlq-{}-{}-{}", payload.pipeline_id, payload.stage_name, payload.task_index),
                queue_name.clone(),
                dlq_message,
            ))
            .await
            .tap_err(|err| warn!(queue_name = %queue_name, error = %err, "dead-letter notification enqueue failed"))
            .ok();
        self.tracer
            .task_dead_lettered(&payload.pipeline_id, &payload.stage_name, payload.task_index, &queue_name);

        let message = format!("task {} exhausted retries: {}", payload.task_index, payload.error.message);
        self.handle_pipeline_failure(&payload.pipeline_id, &payload.stage_name, message).await?;

        Ok(())
    }

    // ---- Stage/pipeline completion & failure ---------------------------

    async fn complete_stage(&self, pipeline_id: &str, stage_name: &str) -> Result<()> {
        let Some(stage_record) = self.store.get_stage(pipeline_id, stage_name).await? else {
            return Ok(());
        };
        let Some(pipeline_record) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(());
        };
        let Some(stage_def) = pipeline_record.definition.stage(stage_name).cloned() else {
            return Ok(());
        };

        let outputs = self.store.get_stage_outputs(pipeline_id, stage_name, stage_record.attempt).await?;

        if let Some(compensation) = &stage_def.compensation {
            let output_for_compensation = match outputs.as_slice() {
                [only] => only.clone(),
                _ => Value::Array(outputs.clone()),
            };
            self.saga.record_compensation(pipeline_id, stage_name, compensation, &output_for_compensation).await?;
        }

        self.store
            .update_stage_progress(
                pipeline_id,
                stage_name,
                StageProgressDelta {
                    status: Some(StageStatus::Completed),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.tracer.stage_completed(
            pipeline_id,
            stage_name,
            stage_record.attempt,
            stage_record.completed_tasks.max(u32::try_from(outputs.len()).unwrap_or(u32::MAX)),
        );
        let _ = self
            .events
            .publish(
                PipelineEvent::new(pipeline_id.to_string(), EventKind::StageCompleted { attempt: stage_record.attempt })
                    .with_stage(stage_name.to_string()),
            )
            .await;

        let mut context_data = self.store.get_latest_context(pipeline_id).await?.map(|s| s.data).unwrap_or_default();
        context_data.stages.insert(stage_name.to_string(), outputs);
        self.store.snapshot_context(pipeline_id, context_data).await?;

        {
            let mut guard = self.state.write().await;
            if let Some(execution) = guard.get_mut(pipeline_id) {
                execution.active_tasks.remove(stage_name);
                execution.pending_tasks.remove(stage_name);
            }
        }
        let remaining_active = self.remove_active_stage(pipeline_id, stage_name).await?;

        let graph_snapshot = self.state.read().await.get(pipeline_id).map(|e| e.graph.clone());
        if let Some(graph) = graph_snapshot {
            for dependent in graph.dependents_of(stage_name) {
                if !self.dependencies_satisfied(pipeline_id, &graph, &dependent).await? {
                    continue;
                }
                let is_pending = matches!(
                    self.store.get_stage(pipeline_id, &dependent).await?,
                    Some(record) if record.status == StageStatus::Pending
                );
                if is_pending {
                    self.spawn_stage(pipeline_id.to_string(), dependent);
                }
            }
        }

        if remaining_active.is_empty() {
            let stages = self.store.list_stages(pipeline_id).await?;
            if stages.iter().all(|s| s.status == StageStatus::Completed) {
                self.finalize_pipeline_completed(pipeline_id).await?;
            }
        }

        Ok(())
    }

    async fn dependencies_satisfied(&self, pipeline_id: &str, graph: &StageGraph, stage_name: &str) -> Result<bool> {
        for dependency in graph.dependencies_of(stage_name) {
            match self.store.get_stage(pipeline_id, &dependency).await? {
                Some(record) if record.status == StageStatus::Completed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn add_active_stage(&self, pipeline_id: &str, stage_name: &str) -> Result<()> {
        let Some(mut record) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(());
        };
        if !record.active_stages.iter().any(|s| s == stage_name) {
            record.active_stages.push(stage_name.to_string());
        }
        let active_stages = record.active_stages.clone();
        self.store
            .set_pipeline_status(
                pipeline_id,
                record.status,
                PipelineStatusPatch {
                    active_stages: Some(active_stages),
                    current_stage: Some(Some(stage_name.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_active_stage(&self, pipeline_id: &str, stage_name: &str) -> Result<Vec<String>> {
        let Some(mut record) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(Vec::new());
        };
        record.active_stages.retain(|s| s != stage_name);
        let remaining = record.active_stages.clone();
        self.store
            .set_pipeline_status(
                pipeline_id,
                record.status,
                PipelineStatusPatch {
                    active_stages: Some(remaining.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(remaining)
    }

    async fn finalize_pipeline_completed(&self, pipeline_id: &str) -> Result<()> {
        self.saga.clear(pipeline_id).await?;
        self.store
            .set_pipeline_status(
                pipeline_id,
                PipelineStatus::Completed,
                PipelineStatusPatch {
                    completed_at: Some(Utc::now()),
                    current_stage: Some(None),
                    active_stages: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await?;
        self.state.write().await.remove(pipeline_id);
        self.tracer.pipeline_completed(pipeline_id);
        let _ = self
            .events
            .publish(PipelineEvent::new(pipeline_id.to_string(), EventKind::PipelineCompleted))
            .await;
        Ok(())
    }

    async fn handle_pipeline_failure(&self, pipeline_id: &str, stage_name: &str, error: String) -> Result<()> {
        self.store
            .update_stage_progress(
                pipeline_id,
                stage_name,
                StageProgressDelta {
                    status: Some(StageStatus::Failed),
                    error: Some(error.clone()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.tracer.stage_failed(pipeline_id, stage_name, 1, &error);
        let _ = self
            .events
            .publish(
                PipelineEvent::new(
                    pipeline_id.to_string(),
                    EventKind::StageFailed {
                        attempt: 1,
                        error: error.clone(),
                    },
                )
                .with_stage(stage_name.to_string()),
            )
            .await;

        if self.saga.has_pending(pipeline_id).await? {
            self.saga.execute_compensations(pipeline_id).await?;
        }

        self.store
            .set_pipeline_status(
                pipeline_id,
                PipelineStatus::Failed,
                PipelineStatusPatch {
                    current_stage: Some(None),
                    active_stages: Some(Vec::new()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.state.write().await.remove(pipeline_id);
        self.tracer.pipeline_failed(pipeline_id, &error);
        let _ = self
            .events
            .publish(PipelineEvent::new(pipeline_id.to_string(), EventKind::PipelineFailed { error }))
            .await;
        Ok(())
    }

    async fn build_context_value(&self, pipeline_id: &str) -> Result<Value> {
        let data = self.store.get_latest_context(pipeline_id).await?.map(|s| s.data).unwrap_or_default();
        Ok(serde_json::json!({
            "trigger": data.trigger,
            "stages": data.stages,
        }))
    }

    // ---- Crash resume ---------------------------------------------------

    /// Rehydrates in-process scheduling state for every pipeline the store
    /// still lists as running, re-dispatches stages that never got past
    /// `pending`, and re-enqueues only the *failed* task attempts of stages
    /// that were `running` (queued/in-flight attempts are assumed to still
    /// be live on the durable transport).
    async fn resume_in_flight_pipelines(&self) -> Result<()> {
        let running = self.store.list_running_pipelines().await?;
        for pipeline_id in running {
            if let Err(err) = self.resume_one_pipeline(&pipeline_id).await {
                warn!(pipeline_id = %pipeline_id, error = %err, "failed to resume pipeline, leaving it for a later attempt");
            }
        }
        Ok(())
    }

    async fn resume_one_pipeline(&self, pipeline_id: &str) -> Result<()> {
        if self.state.read().await.contains_key(pipeline_id) {
            return Ok(());
        }
        let Some(pipeline_record) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(());
        };
        let graph = StageGraph::build(&pipeline_record.definition)?;
        self.state.write().await.insert(
            pipeline_id.to_string(),
            ExecutionState {
                graph: graph.clone(),
                active_tasks: HashMap::new(),
                pending_tasks: HashMap::new(),
            },
        );

        let stages = self.store.list_stages(pipeline_id).await?;
        for stage_record in &stages {
            if stage_record.status == StageStatus::Running {
                self.resume_running_stage(pipeline_id, &pipeline_record, stage_record).await?;
            }
        }
        for stage_record in &stages {
            if stage_record.status != StageStatus::Pending {
                continue;
            }
            if self.dependencies_satisfied(pipeline_id, &graph, &stage_record.stage_name).await? {
                self.spawn_stage(pipeline_id.to_string(), stage_record.stage_name.clone());
            }
        }
        Ok(())
    }

    async fn resume_running_stage(
        &self,
        pipeline_id: &str,
        pipeline_record: &PipelineRecord,
        stage_record: &StageRecord,
    ) -> Result<()> {
        let Some(stage_def) = pipeline_record.definition.stage(&stage_record.stage_name).cloned() else {
            return Ok(());
        };
        let pending = self
            .store
            .get_pending_tasks(pipeline_id, &stage_record.stage_name, stage_record.attempt)
            .await?;
        {
            let mut guard = self.state.write().await;
            if let Some(execution) = guard.get_mut(pipeline_id) {
                let active = u32::try_from(pending.iter().filter(|t| t.status != TaskStatus::Failed).count()).unwrap_or(0);
                execution.active_tasks.insert(stage_def.name.clone(), active);
            }
        }
        for task in pending {
            if task.status != TaskStatus::Failed {
                continue;
            }
            let policy = stage_def.effective_retry();
            let next_retry_attempt = task.retry_attempt.saturating_add(1);
            if next_retry_attempt > policy.max_attempts {
                continue;
            }
            let delay_ms = policy.backoff_for(next_retry_attempt);
            self.schedule_task(
                pipeline_id,
                &stage_def,
                stage_record.attempt,
                task.task_index,
                task.actor_type,
                task.input,
                task.metadata,
                policy,
                next_retry_attempt,
                delay_ms,
            )
            .await?;
        }
        Ok(())
    }
}

fn breaker_actor_hint(stage: &StageDefinition) -> String {
    match &stage.actor {
        ActorRef::Literal(name) => name.clone(),
        _ => stage.name.clone(),
    }
}

fn deterministic_job_id(pipeline_id: &str, stage_name: &str, attempt: u32, task_index: u32, retry_attempt: u32) -> String {
    format!("{}-{stage_name}-{attempt}-{task_index}-r{retry_attempt}", pipeline_id.replace(':', "_"))
}
