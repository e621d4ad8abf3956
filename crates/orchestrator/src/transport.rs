//! Transport (external collaborator, §1): "a durable queue with per-queue
//! workers, delayed jobs, jobId deduplication" — described only at its
//! interface boundary. [`InMemoryTransport`] is the reference implementation
//! used by every test double "worker" in this crate's own test suite; a
//! production deployment swaps in a durable queue (e.g. BullMQ in the
//! original system) behind the same trait.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport backend error: {reason}")]
    Backend { reason: String },
}

impl TransportError {
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// A unit of work enqueued onto a named queue, addressed by the
/// deterministic `job_id` from §6's jobId format for idempotent requeue.
#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    pub job_id: String,
    pub queue_name: String,
    pub payload: Value,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
}

impl EnqueuedJob {
    pub fn now(job_id: impl Into<String>, queue_name: impl Into<String>, payload: Value) -> Self {
        Self {
            job_id: job_id.into(),
            queue_name: queue_name.into(),
            payload,
            attempts: 1,
            available_at: Utc::now(),
        }
    }

    pub fn delayed(mut self, delay_ms: u64) -> Self {
        self.available_at = Utc::now() + chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// A worker-observed task failure, published onto a wildcard event stream
/// for transports that expose one — §4.3's "the worker emits a
/// per-job-failed event that the breaker subscribes to via a queue event
/// stream" and §9 Open Question (b).
#[derive(Debug, Clone)]
pub struct TaskFailureEvent {
    pub actor_type: String,
    pub pipeline_id: String,
    pub stage_name: String,
    pub task_index: u32,
}

/// The external message-transport boundary: per-actor job queues with
/// delayed delivery and jobId deduplication, plus an optional wildcard
/// failure-event stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue a job. Returns `false` without enqueuing again if
    /// `job.job_id` has already been seen and not yet acknowledged — the
    /// "idempotent on resume" property from §8.
    async fn enqueue(&self, job: EnqueuedJob) -> Result<bool>;

    /// Pop the oldest ready (non-delayed) job from a queue, if any.
    async fn receive(&self, queue_name: &str) -> Result<Option<EnqueuedJob>>;

    /// Acknowledge a job as finished, releasing its dedup slot.
    async fn ack(&self, job_id: &str) -> Result<()>;

    /// Cancel a not-yet-delivered job (used to cancel the approval timeout
    /// handler once an explicit decision arrives).
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    /// Number of jobs currently queued (ready or delayed) on a queue.
    async fn queue_len(&self, queue_name: &str) -> Result<usize>;

    /// A wildcard failure-event stream, for transports that expose one so
    /// the circuit breaker can drive itself directly from worker-side
    /// events rather than orchestrator-side retry observation (§9 Open
    /// Question b). `InMemoryTransport` does expose one, driven by
    /// [`InMemoryTransport::publish_failure`] — tests that want to exercise
    /// direct orchestrator-side observation instead simply don't call it.
    fn subscribe_failures(&self) -> Option<broadcast::Receiver<TaskFailureEvent>> {
        None
    }
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<EnqueuedJob>>,
    seen_job_ids: HashSet<String>,
}

/// In-process reference transport. Not durable across process restarts —
/// crash-resume is exercised by constructing a fresh instance alongside a
/// [`crate::state::StateStore`] that *is* durable, matching how
/// `InMemoryStateStore` documents the same limitation.
pub struct InMemoryTransport {
    inner: RwLock<Inner>,
    failure_tx: broadcast::Sender<TaskFailureEvent>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (failure_tx, _) = broadcast::channel(1000);
        Self {
            inner: RwLock::new(Inner::default()),
            failure_tx,
        }
    }

    /// Publish a worker-observed failure onto the wildcard stream.
    pub fn publish_failure(&self, event: TaskFailureEvent) {
        let _ = self.failure_tx.send(event);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn enqueue(&self, job: EnqueuedJob) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.seen_job_ids.contains(&job.job_id) {
            return Ok(false);
        }
        inner.seen_job_ids.insert(job.job_id.clone());
        inner
            .queues
            .entry(job.queue_name.clone())
            .or_default()
            .push_back(job);
        Ok(true)
    }

    async fn receive(&self, queue_name: &str) -> Result<Option<EnqueuedJob>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let queue = inner.queues.entry(queue_name.to_string()).or_default();
        let position = queue.iter().position(|job| job.available_at <= now);
        Ok(position.and_then(|index| queue.remove(index)))
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        self.inner.write().await.seen_job_ids.remove(job_id);
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let mut removed = false;
        for queue in inner.queues.values_mut() {
            let before = queue.len();
            queue.retain(|job| job.job_id != job_id);
            removed |= queue.len() != before;
        }
        inner.seen_job_ids.remove(job_id);
        Ok(removed)
    }

    async fn queue_len(&self, queue_name: &str) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .await
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len))
    }

    fn subscribe_failures(&self) -> Option<broadcast::Receiver<TaskFailureEvent>> {
        Some(self.failure_tx.subscribe())
    }
}
