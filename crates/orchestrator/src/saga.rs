//! Saga Coordinator (C4): per-pipeline LIFO compensation stack.
//!
//! Grounded on the same "typed collaborators behind `Arc`" shape the teacher
//! uses to wire its actor-facing services together, generalized here to
//! plain async methods rather than actor messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::definition::CompensationConfig;
use crate::expr::resolve_input_map;
use crate::records::CompensationEntry;
use crate::state::{Result, StateStore};
use crate::transport::{EnqueuedJob, Transport};

/// Pacing delay between sequential compensation dispatches (§5: "individual
/// compensation dispatch ordering is sequential with a small pacing delay").
const COMPENSATION_PACING: Duration = Duration::from_millis(50);
const COMPENSATION_ATTEMPTS: u32 = 3;
const COMPENSATION_BASE_DELAY_MS: u64 = 1_000;

pub struct SagaCoordinator {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
}

impl SagaCoordinator {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Resolves `compensation.input` against the stage output and pushes a
    /// compensation entry onto the pipeline's LIFO stack.
    pub async fn record_compensation(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        compensation: &CompensationConfig,
        stage_output: &Value,
    ) -> Result<()> {
        let resolved = resolve_input_map(&compensation.input, stage_output);
        self.store
            .push_compensation(CompensationEntry {
                pipeline_id: pipeline_id.to_string(),
                stage_name: stage_name.to_string(),
                actor: compensation.actor.clone(),
                input: Value::Object(resolved),
                stage_output: stage_output.clone(),
                timestamp: Utc::now(),
            })
            .await
    }

    pub async fn has_pending(&self, pipeline_id: &str) -> Result<bool> {
        self.store.has_pending_compensations(pipeline_id).await
    }

    pub async fn clear(&self, pipeline_id: &str) -> Result<()> {
        self.store.clear_compensations(pipeline_id).await
    }

    /// Pops and dispatches compensation entries one at a time until the
    /// stack is empty. A single entry's enqueue failure is logged and does
    /// not abort the rest of the rollback.
    pub async fn execute_compensations(&self, pipeline_id: &str) -> Result<()> {
        while let Some(entry) = self.store.pop_compensation(pipeline_id).await? {
            let job_id = format!("compensation-{}-{}", entry.pipeline_id, entry.stage_name);
            let job = EnqueuedJob::now(job_id, format!("actor-{}", entry.actor), compensation_payload(&entry))
                .with_attempts(COMPENSATION_ATTEMPTS)
                .delayed(0);

            if let Err(err) = self.transport.enqueue(job).await {
                warn!(
                    pipeline_id = %entry.pipeline_id,
                    stage = %entry.stage_name,
                    actor = %entry.actor,
                    error = %err,
                    "compensation dispatch failed, continuing rollback"
                );
            }
            tokio::time::sleep(COMPENSATION_PACING).await;
        }
        Ok(())
    }
}

fn compensation_payload(entry: &CompensationEntry) -> Value {
    serde_json::json!({
        "type": "execute",
        "taskType": "compensation",
        "pipelineId": entry.pipeline_id,
        "stageName": entry.stage_name,
        "input": entry.input,
        "retryPolicy": {
            "maxAttempts": COMPENSATION_ATTEMPTS,
            "backoff": "exponential",
            "baseDelayMs": COMPENSATION_BASE_DELAY_MS,
        },
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::InputMap;
    use crate::state::InMemoryStateStore;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    fn compensation(actor: &str) -> CompensationConfig {
        CompensationConfig {
            actor: actor.to_string(),
            input: InputMap::new(),
        }
    }

    #[tokio::test]
    async fn compensations_execute_in_lifo_order() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let saga = SagaCoordinator::new(store, transport.clone());

        for stage in ["A", "B", "C"] {
            saga.record_compensation("p1", stage, &compensation(&format!("Undo{stage}")), &json!({}))
                .await
                .unwrap();
        }
        assert!(saga.has_pending("p1").await.unwrap());
        saga.execute_compensations("p1").await.unwrap();
        assert!(!saga.has_pending("p1").await.unwrap());

        assert_eq!(transport.queue_len("actor-UndoC").await.unwrap(), 1);
        assert_eq!(transport.queue_len("actor-UndoB").await.unwrap(), 1);
        assert_eq!(transport.queue_len("actor-UndoA").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_empties_the_stack_without_dispatching() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let saga = SagaCoordinator::new(store, transport.clone());
        saga.record_compensation("p1", "A", &compensation("UndoA"), &json!({}))
            .await
            .unwrap();
        saga.clear("p1").await.unwrap();
        assert!(!saga.has_pending("p1").await.unwrap());
        assert_eq!(transport.queue_len("actor-UndoA").await.unwrap(), 0);
    }
}
