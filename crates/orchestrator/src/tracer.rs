//! Tracer (C9): structured observability for stage and task lifecycle
//! events, grounded on the teacher's blanket use of `tracing` spans/events
//! rather than a bespoke metrics sink.

use tracing::info;

/// Observability hook for pipeline/stage/task lifecycle transitions. A
/// trait (rather than bare `tracing` calls scattered through the
/// orchestrator) so tests can swap in a recording implementation without
/// parsing log output.
pub trait Tracer: Send + Sync {
    fn pipeline_started(&self, pipeline_id: &str, definition_name: &str);
    fn pipeline_completed(&self, pipeline_id: &str);
    fn pipeline_failed(&self, pipeline_id: &str, error: &str);
    fn stage_started(&self, pipeline_id: &str, stage_name: &str, attempt: u32);
    fn stage_completed(&self, pipeline_id: &str, stage_name: &str, attempt: u32, completed_tasks: u32);
    fn stage_failed(&self, pipeline_id: &str, stage_name: &str, attempt: u32, error: &str);
    fn task_scheduled(&self, pipeline_id: &str, stage_name: &str, task_index: u32, actor_type: &str);
    fn task_retried(&self, pipeline_id: &str, stage_name: &str, task_index: u32, retry_attempt: u32);
    fn task_dead_lettered(&self, pipeline_id: &str, stage_name: &str, task_index: u32, queue_name: &str);
}

/// Default tracer, emitting one `tracing::info!` event per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn pipeline_started(&self, pipeline_id: &str, definition_name: &str) {
        info!(pipeline_id, definition_name, "pipeline started");
    }

    fn pipeline_completed(&self, pipeline_id: &str) {
        info!(pipeline_id, "pipeline completed");
    }

    fn pipeline_failed(&self, pipeline_id: &str, error: &str) {
        info!(pipeline_id, error, "pipeline failed");
    }

    fn stage_started(&self, pipeline_id: &str, stage_name: &str, attempt: u32) {
        info!(pipeline_id, stage_name, attempt, "stage started");
    }

    fn stage_completed(&self, pipeline_id: &str, stage_name: &str, attempt: u32, completed_tasks: u32) {
        info!(pipeline_id, stage_name, attempt, completed_tasks, "stage completed");
    }

    fn stage_failed(&self, pipeline_id: &str, stage_name: &str, attempt: u32, error: &str) {
        info!(pipeline_id, stage_name, attempt, error, "stage failed");
    }

    fn task_scheduled(&self, pipeline_id: &str, stage_name: &str, task_index: u32, actor_type: &str) {
        info!(pipeline_id, stage_name, task_index, actor_type, "task scheduled");
    }

    fn task_retried(&self, pipeline_id: &str, stage_name: &str, task_index: u32, retry_attempt: u32) {
        info!(pipeline_id, stage_name, task_index, retry_attempt, "task retried");
    }

    fn task_dead_lettered(&self, pipeline_id: &str, stage_name: &str, task_index: u32, queue_name: &str) {
        info!(pipeline_id, stage_name, task_index, queue_name, "task dead-lettered");
    }
}
