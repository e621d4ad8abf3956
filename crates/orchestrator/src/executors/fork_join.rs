use serde_json::Value;

use super::{ExecutionOutcome, StageExecutor, TaskRequest};
use crate::definition::{ExecutorConfig, StageDefinition};
use crate::expr::resolve_input_map;

/// Dispatches one task per branch, each with its own actor and (optionally)
/// its own input template; branches without one resolve the stage's shared
/// `input` instead.
pub struct ForkJoinExecutor;

impl StageExecutor for ForkJoinExecutor {
    fn name(&self) -> &'static str {
        "fork-join"
    }

    fn validate(&self, stage: &StageDefinition) -> Result<(), String> {
        match &stage.executor_config {
            Some(ExecutorConfig::ForkJoin(config)) if !config.branches.is_empty() => Ok(()),
            Some(ExecutorConfig::ForkJoin(_)) => Err("fork-join stage must name at least one branch".to_string()),
            _ => Err("fork-join stage requires a fork-join executor config".to_string()),
        }
    }

    fn execute(&self, stage: &StageDefinition, context: &Value) -> Result<ExecutionOutcome, String> {
        let Some(ExecutorConfig::ForkJoin(config)) = &stage.executor_config else {
            return Err("fork-join stage requires a fork-join executor config".to_string());
        };

        let tasks: Vec<TaskRequest> = config
            .branches
            .iter()
            .map(|branch| {
                let input_map = branch.input.as_ref().unwrap_or(&stage.input);
                let input = Value::Object(resolve_input_map(input_map, context));
                TaskRequest::new(branch.actor.clone(), input)
            })
            .collect();

        let expected_tasks = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        Ok(ExecutionOutcome {
            expected_tasks,
            tasks,
            synchronous_output: None,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::{ActorRef, ForkJoinBranch, ForkJoinConfig, InputMap, StageMode, StageRuntimeConfig};
    use serde_json::json;

    fn stage() -> StageDefinition {
        let mut branch_input = InputMap::new();
        branch_input.insert("region".into(), json!("eu"));
        StageDefinition {
            name: "fan".into(),
            mode: StageMode::ForkJoin,
            actor: ActorRef::Literal("unused".into()),
            input: InputMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: Some(ExecutorConfig::ForkJoin(ForkJoinConfig {
                branches: vec![
                    ForkJoinBranch {
                        name: "eu".into(),
                        actor: "EuWorker".into(),
                        input: Some(branch_input),
                    },
                    ForkJoinBranch {
                        name: "us".into(),
                        actor: "UsWorker".into(),
                        input: None,
                    },
                ],
            })),
        }
    }

    #[test]
    fn schedules_one_task_per_branch_with_its_own_actor() {
        let outcome = ForkJoinExecutor.execute(&stage(), &json!({})).unwrap();
        assert_eq!(outcome.expected_tasks, 2);
        assert_eq!(outcome.tasks[0].actor_type, "EuWorker");
        assert_eq!(outcome.tasks[0].input, json!({"region": "eu"}));
        assert_eq!(outcome.tasks[1].actor_type, "UsWorker");
    }

    #[test]
    fn validate_rejects_empty_branch_list() {
        let mut s = stage();
        s.executor_config = Some(ExecutorConfig::ForkJoin(ForkJoinConfig { branches: vec![] }));
        assert!(ForkJoinExecutor.validate(&s).is_err());
    }
}
