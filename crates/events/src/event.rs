//! Event payloads published on the bus: pipeline/stage lifecycle transitions,
//! approval notifications, and approval decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::EventId;

/// An event published on the [`crate::bus::EventBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: EventId,
    pub pipeline_id: String,
    pub stage_name: Option<String>,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

/// The discriminant used for pattern-based subscription filtering, and the
/// payload carried for each lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    PipelineCreated,
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed { error: String },
    StageStarted { attempt: u32 },
    StageCompleted { attempt: u32 },
    StageFailed { attempt: u32, error: String },
    ApprovalRequested { approval_id: String, assign_to: Option<String> },
    ApprovalDecided { approval_id: String, decision: String, decided_by: String },
    ApprovalEscalated { approval_id: String },
}

impl PipelineEvent {
    pub fn new(pipeline_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            pipeline_id: pipeline_id.into(),
            stage_name: None,
            kind,
            at: Utc::now(),
        }
    }

    pub fn with_stage(mut self, stage_name: impl Into<String>) -> Self {
        self.stage_name = Some(stage_name.into());
        self
    }

    /// The string discriminant used by [`crate::bus::EventPattern::ByType`].
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            EventKind::PipelineCreated => "pipeline_created",
            EventKind::PipelineStarted => "pipeline_started",
            EventKind::PipelineCompleted => "pipeline_completed",
            EventKind::PipelineFailed { .. } => "pipeline_failed",
            EventKind::StageStarted { .. } => "stage_started",
            EventKind::StageCompleted { .. } => "stage_completed",
            EventKind::StageFailed { .. } => "stage_failed",
            EventKind::ApprovalRequested { .. } => "approval_requested",
            EventKind::ApprovalDecided { .. } => "approval_decided",
            EventKind::ApprovalEscalated { .. } => "approval_escalated",
        }
    }

    /// The approval id this event concerns, if any — used to match the
    /// per-approval `approval:decision:<id>` channel.
    pub fn approval_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ApprovalRequested { approval_id, .. }
            | EventKind::ApprovalDecided { approval_id, .. }
            | EventKind::ApprovalEscalated { approval_id } => Some(approval_id),
            _ => None,
        }
    }

    /// Render the event as a JSON value, used when publishing over a
    /// webhook or transport-level escalation notice.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_kind() {
        let event = PipelineEvent::new("p1", EventKind::PipelineStarted);
        assert_eq!(event.event_type(), "pipeline_started");
    }

    #[test]
    fn approval_id_present_only_for_approval_events() {
        let requested = PipelineEvent::new(
            "p1",
            EventKind::ApprovalRequested {
                approval_id: "a1".into(),
                assign_to: None,
            },
        );
        assert_eq!(requested.approval_id(), Some("a1"));

        let started = PipelineEvent::new("p1", EventKind::PipelineStarted);
        assert_eq!(started.approval_id(), None);
    }

    #[test]
    fn with_stage_sets_optional_field() {
        let event = PipelineEvent::new("p1", EventKind::StageStarted { attempt: 1 })
            .with_stage("double");
        assert_eq!(event.stage_name.as_deref(), Some("double"));
    }
}
