use serde_json::Value;

use super::{ExecutionOutcome, StageExecutor, TaskRequest};
use crate::definition::{ExecutorConfig, StageDefinition};
use crate::expr::resolve_input_map;

/// Dispatches the same resolved input to every actor named in
/// `broadcast.actors`. When `wait_for_all` is false the stage does not wait
/// on any of the dispatched tasks and completes immediately.
pub struct BroadcastExecutor;

impl StageExecutor for BroadcastExecutor {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn validate(&self, stage: &StageDefinition) -> Result<(), String> {
        match &stage.executor_config {
            Some(ExecutorConfig::Broadcast(config)) if !config.actors.is_empty() => Ok(()),
            Some(ExecutorConfig::Broadcast(_)) => Err("broadcast stage must name at least one actor".to_string()),
            _ => Err("broadcast stage requires a broadcast executor config".to_string()),
        }
    }

    fn execute(&self, stage: &StageDefinition, context: &Value) -> Result<ExecutionOutcome, String> {
        let Some(ExecutorConfig::Broadcast(config)) = &stage.executor_config else {
            return Err("broadcast stage requires a broadcast executor config".to_string());
        };

        let input = Value::Object(resolve_input_map(&stage.input, context));
        let tasks: Vec<TaskRequest> = config
            .actors
            .iter()
            .map(|actor| TaskRequest::new(actor.clone(), input.clone()))
            .collect();

        let expected_tasks = if config.wait_for_all {
            u32::try_from(tasks.len()).unwrap_or(u32::MAX)
        } else {
            0
        };

        Ok(ExecutionOutcome {
            expected_tasks,
            tasks,
            synchronous_output: if config.wait_for_all { None } else { Some(Value::Null) },
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::{ActorRef, BroadcastConfig, InputMap, StageMode, StageRuntimeConfig};
    use serde_json::json;

    fn stage(wait_for_all: bool) -> StageDefinition {
        StageDefinition {
            name: "notify".into(),
            mode: StageMode::Broadcast,
            actor: ActorRef::Literal("unused".into()),
            input: InputMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: Some(ExecutorConfig::Broadcast(BroadcastConfig {
                actors: vec!["Slack".into(), "Email".into()],
                wait_for_all,
            })),
        }
    }

    #[test]
    fn schedules_one_task_per_actor() {
        let outcome = BroadcastExecutor.execute(&stage(true), &json!({})).unwrap();
        assert_eq!(outcome.tasks.len(), 2);
        assert_eq!(outcome.expected_tasks, 2);
    }

    #[test]
    fn wait_for_all_false_expects_zero_tasks_and_completes_synchronously() {
        let outcome = BroadcastExecutor.execute(&stage(false), &json!({})).unwrap();
        assert_eq!(outcome.tasks.len(), 2);
        assert_eq!(outcome.expected_tasks, 0);
        assert!(outcome.synchronous_output.is_some());
    }

    #[test]
    fn validate_rejects_empty_actor_list() {
        let mut s = stage(true);
        s.executor_config = Some(ExecutorConfig::Broadcast(BroadcastConfig {
            actors: vec![],
            wait_for_all: true,
        }));
        assert!(BroadcastExecutor.validate(&s).is_err());
    }
}
