use std::collections::HashMap;

use serde_json::{Map, Value};

use super::{resolve_actor, resolve_scoped_input, scoped_context, ExecutionOutcome, StageExecutor, TaskRequest};
use crate::definition::{CombineMode, ExecutorConfig, StageDefinition};
use crate::expr::evaluate;

/// Combines the outputs of one or more upstream stages, optionally grouping
/// by an expression, and schedules one task per group (or one task for the
/// combined whole when ungrouped).
pub struct GatherExecutor;

impl StageExecutor for GatherExecutor {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn validate(&self, stage: &StageDefinition) -> Result<(), String> {
        match &stage.executor_config {
            Some(ExecutorConfig::Gather(config)) if !config.stages.resolve().is_empty() => Ok(()),
            Some(ExecutorConfig::Gather(_)) => Err("gather stage must name at least one source stage".to_string()),
            _ => Err("gather stage requires a gather executor config".to_string()),
        }
    }

    fn execute(&self, stage: &StageDefinition, context: &Value) -> Result<ExecutionOutcome, String> {
        let Some(ExecutorConfig::Gather(config)) = &stage.executor_config else {
            return Err("gather stage requires a gather executor config".to_string());
        };

        let source_names = config.stages.resolve();
        let combined = combine(context, &source_names, config.combine.unwrap_or(CombineMode::Concat));

        let actor_type = resolve_actor(&stage.actor, context)?;

        let Some(group_by) = &config.group_by else {
            let scope = scoped_context(context, "gathered", combined);
            let input = resolve_scoped_input(&stage.input, &scope, "gathered");
            return Ok(ExecutionOutcome {
                expected_tasks: 1,
                tasks: vec![TaskRequest::new(actor_type, input)],
                synchronous_output: None,
            });
        };

        let Value::Array(items) = combined else {
            return Err("group_by requires the combined gather result to be an array".to_string());
        };

        let mut order = Vec::new();
        let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
        for item in items {
            let key = match evaluate(group_by, &item) {
                Value::String(s) => s,
                Value::Null => "unknown".to_string(),
                other => other.to_string(),
            };
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(item);
        }

        let mut tasks = Vec::with_capacity(order.len());
        for key in &order {
            let items = groups.remove(key).unwrap_or_default();
            let group_value = serde_json::json!({"key": key, "items": items});
            let scope = scoped_context(context, "group", group_value);
            let input = resolve_scoped_input(&stage.input, &scope, "group");
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

fn combine(context: &Value, source_names: &[String], mode: CombineMode) -> Value {
    let stage_outputs = |name: &str| -> Vec<Value> {
        context
            .get("stages")
            .and_then(|s| s.get(name))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    match mode {
        CombineMode::Object => {
            let mut object = Map::new();
            for name in source_names {
                object.insert(name.clone(), Value::Array(stage_outputs(name)));
            }
            Value::Object(object)
        }
        CombineMode::Concat => {
            let mut flat = Vec::new();
            for name in source_names {
                flat.extend(stage_outputs(name));
            }
            Value::Array(flat)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::{ActorRef, GatherConfig, GatherStagesField, InputMap, StageMode, StageRuntimeConfig};
    use serde_json::json;

    fn stage(group_by: Option<&str>, combine: Option<CombineMode>) -> StageDefinition {
        StageDefinition {
            name: "merge".into(),
            mode: StageMode::Gather,
            actor: ActorRef::Literal("Merger".into()),
            input: InputMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: Some(ExecutorConfig::Gather(GatherConfig {
                stages: GatherStagesField {
                    stage: Some("split".into()),
                    stages: None,
                },
                group_by: group_by.map(str::to_string),
                combine,
            })),
        }
    }

    #[test]
    fn ungrouped_gather_schedules_one_task_with_combined_value() {
        let ctx = json!({"stages": {"split": [{"n": 1}, {"n": 2}]}});
        let outcome = GatherExecutor.execute(&stage(None, None), &ctx).unwrap();
        assert_eq!(outcome.expected_tasks, 1);
    }

    #[test]
    fn grouped_gather_schedules_one_task_per_distinct_key_in_order() {
        let ctx = json!({"stages": {"split": [
            {"n": 1, "bucket": "b"},
            {"n": 2, "bucket": "a"},
            {"n": 3, "bucket": "b"}
        ]}});
        let outcome = GatherExecutor.execute(&stage(Some("$.bucket"), None), &ctx).unwrap();
        assert_eq!(outcome.expected_tasks, 2);
    }

    #[test]
    fn object_combine_keys_by_source_stage_name() {
        let ctx = json!({"stages": {"split": [{"n": 1}]}});
        let outcome = GatherExecutor
            .execute(&stage(None, Some(CombineMode::Object)), &ctx)
            .unwrap();
        assert_eq!(outcome.tasks[0].input, json!({"split": [{"n": 1}]}));
    }

    #[test]
    fn validate_rejects_empty_stage_list() {
        let mut s = stage(None, None);
        s.executor_config = Some(ExecutorConfig::Gather(GatherConfig {
            stages: GatherStagesField {
                stage: None,
                stages: None,
            },
            group_by: None,
            combine: None,
        }));
        assert!(GatherExecutor.validate(&s).is_err());
    }
}
