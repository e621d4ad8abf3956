//! Result/Failure Worker (C8): a small spawned loop over the `Transport`'s
//! `pipeline-stage-results` control queue, deserializing each message into
//! a [`ControlMessage`] and forwarding it into
//! [`crate::pipeline::PipelineOrchestrator::handle_stage_result`] /
//! [`crate::pipeline::PipelineOrchestrator::handle_stage_failure`]. Mirrors
//! the teacher's "spawn a loop that forwards into actor/engine methods"
//! pattern rather than inventing a new concurrency primitive.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::pipeline::PipelineOrchestrator;
use crate::transport::Transport;

/// The control queue every worker publishes `result`/`failure` messages to.
pub const CONTROL_QUEUE: &str = "pipeline-stage-results";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Deserialize)]
pub struct FailureError {
    pub message: String,
    pub code: Option<String>,
    pub retryable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub pipeline_id: String,
    pub stage_name: String,
    pub task_index: u32,
    pub output: Value,
    pub worker_id: Option<String>,
    pub attempt: Option<u32>,
    pub retry_attempt: Option<u32>,
    pub lease_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePayload {
    pub pipeline_id: String,
    pub stage_name: String,
    pub task_index: u32,
    pub actor_type: String,
    pub input: Value,
    pub metadata: Option<Value>,
    pub error: FailureError,
    pub attempt: Option<u32>,
    pub retry_attempt: Option<u32>,
    pub retry_policy: Option<crate::definition::RetryPolicy>,
    pub lease_id: Option<String>,
}

/// Orchestrator-bound control message, tagged by `type` per §6's wire format.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Result { payload: ResultPayload },
    Failure { payload: FailurePayload },
}

/// Spawns a loop that drains [`CONTROL_QUEUE`] and forwards each message to
/// the orchestrator. Never returns; intended to be dropped or aborted
/// alongside the process/test that owns it.
pub struct ControlQueueWorker {
    orchestrator: Arc<PipelineOrchestrator>,
    transport: Arc<dyn Transport>,
}

impl ControlQueueWorker {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, transport: Arc<dyn Transport>) -> Self {
        Self {
            orchestrator,
            transport,
        }
    }

    /// Spawns the drain loop on the current tokio runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        loop {
            match self.transport.receive(CONTROL_QUEUE).await {
                Ok(Some(job)) => {
                    if let Err(err) = self.handle_job(job.payload).await {
                        warn!(error = %err, "control message handling failed");
                    }
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(err) => {
                    warn!(error = %err, "control queue receive failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn handle_job(&self, payload: Value) -> Result<()> {
        let message: ControlMessage = serde_json::from_value(payload)
            .map_err(|err| OrchestratorError::configuration(format!("malformed control message: {err}")))?;
        match message {
            ControlMessage::Result { payload } => self.orchestrator.handle_stage_result(payload).await,
            ControlMessage::Failure { payload } => self.orchestrator.handle_stage_failure(payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::records::PipelineStatus;
    use crate::state::InMemoryStateStore;
    use crate::tracer::TracingTracer;
    use crate::transport::{EnqueuedJob, InMemoryTransport};
    use pipeline_events::EventBus;
    use serde_json::json;

    #[tokio::test]
    async fn worker_forwards_result_message_into_orchestrator() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
        let events = Arc::new(EventBus::default());
        let tracer = Arc::new(TracingTracer);
        let orchestrator = PipelineOrchestrator::new(store.clone(), transport.clone(), events, tracer);
        orchestrator.wait_for_resume().await;

        let definition = crate::definition::PipelineDefinition::new(
            "demo",
            vec![crate::definition::StageDefinition {
                name: "double".into(),
                mode: crate::definition::StageMode::Single,
                actor: crate::definition::ActorRef::Literal("Echo".into()),
                input: crate::definition::InputMap::new(),
                depends_on: vec![],
                retry: None,
                circuit_breaker: None,
                compensation: None,
                human_approval: None,
                config: crate::definition::StageRuntimeConfig::default(),
                executor_config: None,
            }],
        );
        let pipeline_id = orchestrator.execute(definition, json!({"value": 3}), None).await.unwrap();

        let job = wait_for_job(&transport, "actor-Echo").await;
        let lease_id = job["payload"]["leaseId"].as_str().unwrap().to_string();

        let worker = ControlQueueWorker::new(orchestrator.clone(), transport.clone());
        let _handle = worker.spawn();

        transport
            .enqueue(EnqueuedJob::now(
                "result-1",
                CONTROL_QUEUE,
                json!({
                    "type": "result",
                    "payload": {
                        "pipelineId": pipeline_id,
                        "stageName": "double",
                        "taskIndex": 0,
                        "output": {"doubled": 6},
                        "leaseId": lease_id,
                    }
                }),
            ))
            .await
            .unwrap();

        wait_until(|| async {
            orchestrator
                .get_pipeline(&pipeline_id)
                .await
                .unwrap()
                .map(|p| p.status == PipelineStatus::Completed)
                .unwrap_or(false)
        })
        .await;
    }

    async fn wait_for_job(transport: &Arc<dyn Transport>, queue: &str) -> Value {
        for _ in 0..200 {
            if let Some(job) = transport.receive(queue).await.unwrap() {
                return job.payload;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no job appeared on {queue}");
    }

    async fn wait_until<F, Fut>(mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }
}
