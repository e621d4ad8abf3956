use serde_json::Value;

use super::{resolve_actor, resolve_scoped_input, scoped_context, ExecutionOutcome, StageExecutor, TaskRequest};
use crate::definition::{ExecutorConfig, StageDefinition};
use crate::expr::{evaluate, evaluate_bool};

/// Evaluates `scatter.input` to an array, flattens one level if it is a
/// single nested array, filters by `scatter.condition` in a scope extended
/// with the `as`-binding, and schedules one task per surviving item.
pub struct ScatterExecutor;

impl StageExecutor for ScatterExecutor {
    fn name(&self) -> &'static str {
        "scatter"
    }

    fn validate(&self, stage: &StageDefinition) -> Result<(), String> {
        match &stage.executor_config {
            Some(ExecutorConfig::Scatter(_)) => Ok(()),
            _ => Err("scatter stage requires a scatter executor config".to_string()),
        }
    }

    fn execute(&self, stage: &StageDefinition, context: &Value) -> Result<ExecutionOutcome, String> {
        let Some(ExecutorConfig::Scatter(config)) = &stage.executor_config else {
            return Err("scatter stage requires a scatter executor config".to_string());
        };

        let items = match evaluate(&config.input, context) {
            Value::Array(items) => flatten_single_nested(items),
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let actor_type = resolve_actor(&stage.actor, context)?;
        let mut tasks = Vec::new();
        for item in items {
            let scope = scoped_context(context, &config.as_name, item.clone());
            if let Some(condition) = &config.condition {
                if !evaluate_bool(condition, &scope) {
                    continue;
                }
            }
            let input = resolve_scoped_input(&stage.input, &scope, &config.as_name);
            tasks.push(TaskRequest::new(actor_type.clone(), input));
        }

        let expected_tasks = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        Ok(ExecutionOutcome {
            expected_tasks,
            tasks,
            synchronous_output: None,
        })
    }
}

/// `[[a, b]]` flattens to `[a, b]`; anything else (including `[a, b]` or an
/// empty array) passes through unchanged.
fn flatten_single_nested(items: Vec<Value>) -> Vec<Value> {
    if let [Value::Array(inner)] = items.as_slice() {
        inner.clone()
    } else {
        items
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::{ActorRef, InputMap, ScatterConfig, StageMode, StageRuntimeConfig};
    use serde_json::json;

    fn stage(condition: Option<&str>) -> StageDefinition {
        StageDefinition {
            name: "split".into(),
            mode: StageMode::Scatter,
            actor: ActorRef::Literal("PageWorker".into()),
            input: InputMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: Some(ExecutorConfig::Scatter(ScatterConfig {
                input: "$.trigger.pages".into(),
                as_name: "page".into(),
                condition: condition.map(str::to_string),
            })),
        }
    }

    #[test]
    fn schedules_one_task_per_item() {
        let ctx = json!({"trigger": {"pages": [{"n": 1}, {"n": 2}, {"n": 3}]}});
        let outcome = ScatterExecutor.execute(&stage(None), &ctx).unwrap();
        assert_eq!(outcome.expected_tasks, 3);
        assert_eq!(outcome.tasks[0].input, json!({"n": 1}));
    }

    #[test]
    fn flattens_single_nested_array() {
        let ctx = json!({"trigger": {"pages": [[{"n": 1}, {"n": 2}]]}});
        let outcome = ScatterExecutor.execute(&stage(None), &ctx).unwrap();
        assert_eq!(outcome.expected_tasks, 2);
    }

    #[test]
    fn condition_filters_surviving_items() {
        let ctx = json!({"trigger": {"pages": [{"n": 1, "keep": true}, {"n": 2, "keep": false}]}});
        let outcome = ScatterExecutor.execute(&stage(Some("$.page.keep")), &ctx).unwrap();
        assert_eq!(outcome.expected_tasks, 1);
        assert_eq!(outcome.tasks[0].input, json!({"n": 1, "keep": true}));
    }

    #[test]
    fn validate_rejects_missing_executor_config() {
        let mut s = stage(None);
        s.executor_config = None;
        assert!(ScatterExecutor.validate(&s).is_err());
    }
}
