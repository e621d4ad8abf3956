//! Human Approval Executor (C5): combines the state store, the event bus,
//! and the transport to implement a stage that blocks for an external
//! decision. Grounded on the teacher's pattern of composing a handful of
//! `Arc`-shared collaborators behind one request-scoped service struct,
//! generalized from actor messages to plain async methods.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipeline_events::{EventBus, EventKind, EventPattern, PipelineEvent};
use serde_json::Value;
use tracing::warn;
use ulid::Ulid;

use crate::definition::{ApprovalFallback, HumanApprovalConfig};
use crate::records::{ApprovalDecision, ApprovalDecisionKind, ApprovalRequest, ApprovalStatus};
use crate::state::{Result as StateResult, StateStore};
use crate::transport::{EnqueuedJob, Transport};

/// Retention window for a decided/expired approval record past its
/// terminal transition (§4.5: "retained for audit for 1h").
const AUDIT_RETENTION_MS: i64 = 60 * 60 * 1000;
const TTL_GRACE_MS: i64 = 60_000;
const HARD_TIMEOUT_GRACE_MS: u64 = 5_000;
const TIMEOUT_QUEUE: &str = "approval-timeout-handler";

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    Approved { output: Value },
    Rejected { comment: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("state store error: {0}")]
    Store(#[from] crate::state::StateStoreError),
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("approval '{0}' timed out waiting for a decision")]
    HardTimeout(String),
}

pub struct HumanApprovalExecutor {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    http: reqwest::Client,
}

impl HumanApprovalExecutor {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<dyn Transport>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            transport,
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Runs a human-approval stage to completion: creates the durable
    /// request, notifies, schedules the timeout handler, and blocks for a
    /// decision (or the hard timeout safety net).
    pub async fn execute(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        config: &HumanApprovalConfig,
        input: Value,
    ) -> std::result::Result<ApprovalOutcome, ApprovalError> {
        let approval_id = Ulid::new().to_string();
        let now = Utc::now();
        let request = ApprovalRequest {
            approval_id: approval_id.clone(),
            pipeline_id: pipeline_id.to_string(),
            stage_name: stage_name.to_string(),
            assign_to: config.assign_to.clone(),
            data: input.clone(),
            expires_at: now + chrono::Duration::milliseconds(config.timeout_ms as i64 + TTL_GRACE_MS),
            status: ApprovalStatus::Pending,
            decision: None,
            created_at: now,
            fallback: config.fallback,
        };
        self.store.save_approval(request).await?;

        let _ = self
            .events
            .publish(
                PipelineEvent::new(
                    pipeline_id,
                    EventKind::ApprovalRequested {
                        approval_id: approval_id.clone(),
                        assign_to: config.assign_to.clone(),
                    },
                )
                .with_stage(stage_name),
            )
            .await;

        if let Some(webhook_url) = config.webhook_url.clone() {
            let http = self.http.clone();
            let approval_id_for_webhook = approval_id.clone();
            let payload = serde_json::json!({"approvalId": approval_id_for_webhook, "pipelineId": pipeline_id, "stageName": stage_name, "data": input});
            tokio::spawn(async move {
                if let Err(err) = http.post(&webhook_url).json(&payload).send().await {
                    warn!(approval_id = %approval_id_for_webhook, error = %err, "approval webhook delivery failed");
                }
            });
        }

        self.transport
            .enqueue(
                EnqueuedJob::now(approval_id.clone(), TIMEOUT_QUEUE, serde_json::json!({"approvalId": approval_id}))
                    .delayed(config.timeout_ms),
            )
            .await?;

        let (subscriber_id, mut subscription) = self
            .events
            .subscribe_with_pattern(EventPattern::ByApproval(approval_id.clone()))
            .await;

        let hard_timeout = Duration::from_millis(config.timeout_ms.saturating_add(HARD_TIMEOUT_GRACE_MS));
        let wait_result = tokio::time::timeout(hard_timeout, async {
            loop {
                match subscription.recv().await {
                    Ok(event) => {
                        if let EventKind::ApprovalDecided { decision, .. } = event.kind {
                            return Some(decision);
                        }
                    }
                    Err(_) => return None,
                }
            }
        })
        .await;
        self.events.unsubscribe(&subscriber_id).await;

        match wait_result {
            Ok(Some(decision)) if decision == "approve" => {
                let mut approved_input = match input {
                    Value::Object(map) => map,
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                approved_input.insert("__approval".to_string(), serde_json::json!({"decision": "approve"}));
                Ok(ApprovalOutcome::Approved {
                    output: Value::Object(approved_input),
                })
            }
            Ok(Some(_)) => {
                let approval = self.store.get_approval(&approval_id).await?;
                let comment = approval.and_then(|a| a.decision).and_then(|d| d.comment);
                Ok(ApprovalOutcome::Rejected { comment })
            }
            Ok(None) | Err(_) => Err(ApprovalError::HardTimeout(approval_id)),
        }
    }

    /// External API: `submitApproval`. Cancels the pending timeout job,
    /// records the decision, and publishes it on the per-approval channel.
    pub async fn submit_decision(
        &self,
        approval_id: &str,
        decision: ApprovalDecisionKind,
        decided_by: &str,
        comment: Option<String>,
    ) -> StateResult<()> {
        let Some(mut request) = self.store.get_approval(approval_id).await? else {
            return Ok(());
        };
        if request.status != ApprovalStatus::Pending {
            return Ok(());
        }

        let _ = self.transport.cancel(approval_id).await;

        request.status = match decision {
            ApprovalDecisionKind::Approve => ApprovalStatus::Approved,
            ApprovalDecisionKind::Reject => ApprovalStatus::Rejected,
        };
        request.decision = Some(ApprovalDecision {
            decision,
            decided_by: decided_by.to_string(),
            decided_at: Utc::now(),
            comment,
        });
        self.store.save_approval(request).await?;

        let decision_str = match decision {
            ApprovalDecisionKind::Approve => "approve",
            ApprovalDecisionKind::Reject => "reject",
        };
        let _ = self
            .events
            .publish(PipelineEvent::new(
                String::new(),
                EventKind::ApprovalDecided {
                    approval_id: approval_id.to_string(),
                    decision: decision_str.to_string(),
                    decided_by: decided_by.to_string(),
                },
            ))
            .await;
        Ok(())
    }

    pub async fn get_pending_approvals(
        &self,
        pipeline_id: Option<&str>,
        assign_to: Option<&str>,
        limit: usize,
    ) -> StateResult<Vec<ApprovalRequest>> {
        self.store.list_pending_approvals(pipeline_id, assign_to, limit).await
    }

    pub async fn get_approval(&self, approval_id: &str) -> StateResult<Option<ApprovalRequest>> {
        self.store.get_approval(approval_id).await
    }

    /// Runs on the `approval-timeout-handler` queue worker. No-ops if the
    /// approval already has a terminal status (an explicit decision raced
    /// ahead of the timeout job).
    pub async fn handle_timeout(&self, approval_id: &str) -> StateResult<()> {
        let Some(mut request) = self.store.get_approval(approval_id).await? else {
            return Ok(());
        };
        if request.status != ApprovalStatus::Pending {
            return Ok(());
        }

        match request.fallback {
            ApprovalFallback::AutoApprove => {
                self.finalize_timeout(&mut request, ApprovalStatus::Approved, ApprovalDecisionKind::Approve, "system:timeout:auto-approve")
                    .await?;
            }
            ApprovalFallback::AutoReject => {
                self.finalize_timeout(&mut request, ApprovalStatus::Rejected, ApprovalDecisionKind::Reject, "system:timeout:auto-reject")
                    .await?;
            }
            ApprovalFallback::Escalate => {
                let _ = self
                    .events
                    .publish(PipelineEvent::new(
                        request.pipeline_id.clone(),
                        EventKind::ApprovalEscalated {
                            approval_id: approval_id.to_string(),
                        },
                    ))
                    .await;
                self.finalize_timeout(&mut request, ApprovalStatus::Rejected, ApprovalDecisionKind::Reject, "system:timeout:escalate")
                    .await?;
            }
        }
        Ok(())
    }

    async fn finalize_timeout(
        &self,
        request: &mut ApprovalRequest,
        status: ApprovalStatus,
        decision: ApprovalDecisionKind,
        decided_by: &str,
    ) -> StateResult<()> {
        request.status = status;
        request.decision = Some(ApprovalDecision {
            decision,
            decided_by: decided_by.to_string(),
            decided_at: Utc::now(),
            comment: None,
        });
        request.expires_at = Utc::now() + chrono::Duration::milliseconds(AUDIT_RETENTION_MS);
        self.store.save_approval(request.clone()).await?;

        let decision_str = match decision {
            ApprovalDecisionKind::Approve => "approve",
            ApprovalDecisionKind::Reject => "reject",
        };
        let _ = self
            .events
            .publish(PipelineEvent::new(
                request.pipeline_id.clone(),
                EventKind::ApprovalDecided {
                    approval_id: request.approval_id.clone(),
                    decision: decision_str.to_string(),
                    decided_by: decided_by.to_string(),
                },
            ))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::state::InMemoryStateStore;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    fn config(timeout_ms: u64) -> HumanApprovalConfig {
        HumanApprovalConfig {
            assign_to: Some("reviewer".into()),
            timeout_ms,
            fallback: ApprovalFallback::AutoApprove,
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn approve_decision_unblocks_execute_with_synchronous_output() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let events = Arc::new(EventBus::default());
        let executor = Arc::new(HumanApprovalExecutor::new(store, transport, events));

        let executor_for_task = executor.clone();
        let handle = tokio::spawn(async move {
            executor_for_task
                .execute("p1", "review", &config(5_000), json!({"doc": "x"}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = executor.get_pending_approvals(Some("p1"), None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let approval_id = pending[0].approval_id.clone();

        executor
            .submit_decision(&approval_id, ApprovalDecisionKind::Approve, "alice", None)
            .await
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        match outcome {
            ApprovalOutcome::Approved { output } => {
                assert_eq!(output["doc"], json!("x"));
                assert_eq!(output["__approval"]["decision"], json!("approve"));
            }
            ApprovalOutcome::Rejected { .. } => panic!("expected approval"),
        }
    }

    #[tokio::test]
    async fn reject_decision_surfaces_as_rejected_outcome() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let events = Arc::new(EventBus::default());
        let executor = Arc::new(HumanApprovalExecutor::new(store, transport, events));

        let executor_for_task = executor.clone();
        let handle = tokio::spawn(async move {
            executor_for_task
                .execute("p1", "review", &config(5_000), json!({}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = executor.get_pending_approvals(None, None, 10).await.unwrap();
        let approval_id = pending[0].approval_id.clone();

        executor
            .submit_decision(&approval_id, ApprovalDecisionKind::Reject, "bob", Some("not ready".into()))
            .await
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        match outcome {
            ApprovalOutcome::Rejected { comment } => assert_eq!(comment.as_deref(), Some("not ready")),
            ApprovalOutcome::Approved { .. } => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn submit_decision_is_a_no_op_once_already_terminal() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let events = Arc::new(EventBus::default());
        let executor = HumanApprovalExecutor::new(store.clone(), transport, events);

        let request = ApprovalRequest {
            approval_id: "appr-1".into(),
            pipeline_id: "p1".into(),
            stage_name: "review".into(),
            assign_to: None,
            data: json!({}),
            expires_at: Utc::now(),
            status: ApprovalStatus::Approved,
            decision: Some(ApprovalDecision {
                decision: ApprovalDecisionKind::Approve,
                decided_by: "alice".into(),
                decided_at: Utc::now(),
                comment: None,
            }),
            created_at: Utc::now(),
            fallback: ApprovalFallback::AutoApprove,
        };
        store.save_approval(request).await.unwrap();

        executor
            .submit_decision("appr-1", ApprovalDecisionKind::Reject, "mallory", None)
            .await
            .unwrap();

        let stored = store.get_approval("appr-1").await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn timeout_with_auto_approve_fallback_decides_and_unblocks_execute() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let events = Arc::new(EventBus::default());
        let executor = Arc::new(HumanApprovalExecutor::new(store.clone(), transport, events));

        let executor_for_task = executor.clone();
        let handle = tokio::spawn(async move {
            executor_for_task
                .execute("p1", "review", &config(50), json!({"doc": "x"}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = executor.get_pending_approvals(Some("p1"), None, 10).await.unwrap();
        let approval_id = pending[0].approval_id.clone();

        // Simulates the dedicated timeout-handler worker firing the delayed
        // job once `timeout_ms` has elapsed.
        executor.handle_timeout(&approval_id).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        match outcome {
            ApprovalOutcome::Approved { output } => {
                assert_eq!(output["__approval"]["decision"], json!("approve"));
            }
            ApprovalOutcome::Rejected { .. } => panic!("expected auto-approve"),
        }

        let stored = store.get_approval(&approval_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.decision.unwrap().decided_by, "system:timeout:auto-approve");
    }

    #[tokio::test]
    async fn timeout_after_explicit_decision_is_a_no_op() {
        let store = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let events = Arc::new(EventBus::default());
        let executor = HumanApprovalExecutor::new(store.clone(), transport, events);

        let request = ApprovalRequest {
            approval_id: "appr-2".into(),
            pipeline_id: "p1".into(),
            stage_name: "review".into(),
            assign_to: None,
            data: json!({}),
            expires_at: Utc::now(),
            status: ApprovalStatus::Rejected,
            decision: Some(ApprovalDecision {
                decision: ApprovalDecisionKind::Reject,
                decided_by: "bob".into(),
                decided_at: Utc::now(),
                comment: None,
            }),
            created_at: Utc::now(),
            fallback: ApprovalFallback::AutoApprove,
        };
        store.save_approval(request).await.unwrap();

        executor.handle_timeout("appr-2").await.unwrap();

        let stored = store.get_approval("appr-2").await.unwrap().unwrap();
        assert_eq!(stored.decision.unwrap().decided_by, "bob");
    }
}
