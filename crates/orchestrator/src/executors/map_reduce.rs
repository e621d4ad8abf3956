use serde_json::Value;

use super::{ExecutionOutcome, StageExecutor};
use crate::definition::StageDefinition;

/// Map-reduce is declared but intentionally unimplemented: express it as a
/// scatter stage feeding a gather stage instead.
pub struct MapReduceExecutor;

impl StageExecutor for MapReduceExecutor {
    fn name(&self) -> &'static str {
        "map-reduce"
    }

    fn validate(&self, _stage: &StageDefinition) -> Result<(), String> {
        Ok(())
    }

    fn execute(&self, _stage: &StageDefinition, _context: &Value) -> Result<ExecutionOutcome, String> {
        Err("map-reduce stages are not executable; express the same shape as a scatter stage followed by a gather stage".to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::{ActorRef, InputMap, StageMode, StageRuntimeConfig};
    use serde_json::json;

    #[test]
    fn execute_always_errors() {
        let stage = StageDefinition {
            name: "reduce".into(),
            mode: StageMode::MapReduce,
            actor: ActorRef::Literal("unused".into()),
            input: InputMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: None,
        };
        assert!(MapReduceExecutor.execute(&stage, &json!({})).is_err());
        assert!(MapReduceExecutor.validate(&stage).is_ok());
    }
}
