use serde_json::Value;

use super::{resolve_actor, ExecutionOutcome, StageExecutor, TaskRequest};
use crate::definition::StageDefinition;
use crate::expr::resolve_input_map;

/// Resolves input and actor, schedules one task. `expectedTasks=1`.
pub struct SingleExecutor;

impl StageExecutor for SingleExecutor {
    fn name(&self) -> &'static str {
        "single"
    }

    fn validate(&self, _stage: &StageDefinition) -> Result<(), String> {
        Ok(())
    }

    fn execute(&self, stage: &StageDefinition, context: &Value) -> Result<ExecutionOutcome, String> {
        let actor_type = resolve_actor(&stage.actor, context)?;
        let input = Value::Object(resolve_input_map(&stage.input, context));
        Ok(ExecutionOutcome {
            expected_tasks: 1,
            tasks: vec![TaskRequest::new(actor_type, input)],
            synchronous_output: None,
        })
    }
}
