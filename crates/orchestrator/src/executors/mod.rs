//! Stage Executors (C6): one [`StageExecutor`] per [`crate::definition::StageMode`],
//! dispatched by mode and never downcast. Each executor is a pure function
//! of a stage definition and the current pipeline context: it describes the
//! tasks to schedule, and the orchestrator's throttling-aware dispatcher
//! (§4.7) is the only thing that actually enqueues work. Human-approval is
//! handled separately by [`crate::approval::HumanApprovalExecutor`] since it
//! is inherently asynchronous (it blocks on an external decision) rather
//! than a pure description of tasks to schedule.

mod broadcast;
mod fork_join;
mod gather;
mod map_reduce;
mod scatter;
mod single;

use serde_json::Value;

use crate::definition::{ActorRef, InputMap, RetryPolicy, StageDefinition, StageMode};
use crate::expr::{evaluate, evaluate_bool, resolve_input_map};

pub use broadcast::BroadcastExecutor;
pub use fork_join::ForkJoinExecutor;
pub use gather::GatherExecutor;
pub use map_reduce::MapReduceExecutor;
pub use scatter::ScatterExecutor;
pub use single::SingleExecutor;

/// One task an executor wants scheduled. The orchestrator fills in task
/// index, lease, and message framing.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub actor_type: String,
    pub input: Value,
    pub metadata: Option<Value>,
    pub retry_policy: Option<RetryPolicy>,
    pub delay_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(actor_type: impl Into<String>, input: Value) -> Self {
        Self {
            actor_type: actor_type.into(),
            input,
            metadata: None,
            retry_policy: None,
            delay_ms: None,
        }
    }
}

/// What an executor produced: either a set of tasks to dispatch, or (for
/// zero-expected-task outcomes such as `waitForAll=false` broadcast) a
/// synchronous result the orchestrator treats as an immediate barrier
/// release.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub expected_tasks: u32,
    pub tasks: Vec<TaskRequest>,
    pub synchronous_output: Option<Value>,
}

/// A mode-specific stage executor.
pub trait StageExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validation failures cause the stage to fail before any task is
    /// scheduled (§4.6).
    fn validate(&self, stage: &StageDefinition) -> Result<(), String>;

    fn execute(&self, stage: &StageDefinition, context: &Value) -> Result<ExecutionOutcome, String>;
}

/// Looks up the executor for a stage mode. Returns `None` for
/// [`StageMode::HumanApproval`], which the orchestrator routes to
/// [`crate::approval::HumanApprovalExecutor`] instead.
pub fn for_mode(mode: StageMode) -> Option<Box<dyn StageExecutor>> {
    match mode {
        StageMode::Single => Some(Box::new(SingleExecutor)),
        StageMode::Scatter => Some(Box::new(ScatterExecutor)),
        StageMode::Gather => Some(Box::new(GatherExecutor)),
        StageMode::Broadcast => Some(Box::new(BroadcastExecutor)),
        StageMode::ForkJoin => Some(Box::new(ForkJoinExecutor)),
        StageMode::MapReduce => Some(Box::new(MapReduceExecutor)),
        StageMode::HumanApproval => None,
    }
}

/// Resolves a stage's actor strategy against the pipeline context.
pub fn resolve_actor(actor: &ActorRef, context: &Value) -> Result<String, String> {
    match actor {
        ActorRef::Literal(name) => Ok(name.clone()),
        ActorRef::Ternary(expr) => match evaluate(expr, context) {
            Value::String(name) => Ok(name),
            other => Err(format!("ternary actor expression did not resolve to a string: {other:?}")),
        },
        ActorRef::WhenList { cases, default } => {
            for case in cases {
                if evaluate_bool(&case.condition, context) {
                    return Ok(case.actor.clone());
                }
            }
            default
                .clone()
                .ok_or_else(|| "no when-list case matched and no default actor was given".to_string())
        }
    }
}

/// Clones `context` (expected to be a JSON object) with one additional key
/// bound, for scatter/gather's scoped per-item evaluation.
pub fn scoped_context(context: &Value, key: &str, value: Value) -> Value {
    let mut scoped = context.as_object().cloned().unwrap_or_default();
    scoped.insert(key.to_string(), value);
    Value::Object(scoped)
}

/// Resolves a task's input within a scatter/gather scope: an explicit
/// `stage.input` map is resolved as expressions against the scope, but an
/// empty map falls back to the scope's own contextual binding (the scatter
/// `as`-item, the gather `group`/`gathered` value) directly, so authors
/// don't have to write a no-op passthrough input map.
pub fn resolve_scoped_input(stage_input: &InputMap, scope: &Value, fallback_key: &str) -> Value {
    if stage_input.is_empty() {
        scope.get(fallback_key).cloned().unwrap_or(Value::Null)
    } else {
        Value::Object(resolve_input_map(stage_input, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WhenCase;
    use serde_json::json;

    #[test]
    fn resolve_actor_literal_is_verbatim() {
        let actor = ActorRef::Literal("Echo".into());
        assert_eq!(resolve_actor(&actor, &json!({})).unwrap(), "Echo");
    }

    #[test]
    fn resolve_actor_ternary_evaluates_against_context() {
        let actor = ActorRef::Ternary(r#"$.trigger.big ? "Big" : "Small""#.into());
        let ctx = json!({"trigger": {"big": true}});
        assert_eq!(resolve_actor(&actor, &ctx).unwrap(), "Big");
    }

    #[test]
    fn resolve_actor_when_list_falls_back_to_default() {
        let actor = ActorRef::WhenList {
            cases: vec![WhenCase {
                condition: "$.trigger.big".into(),
                actor: "Big".into(),
            }],
            default: Some("Default".into()),
        };
        let ctx = json!({"trigger": {"big": false}});
        assert_eq!(resolve_actor(&actor, &ctx).unwrap(), "Default");
    }

    #[test]
    fn resolve_actor_when_list_without_match_or_default_errors() {
        let actor = ActorRef::WhenList {
            cases: vec![WhenCase {
                condition: "$.trigger.big".into(),
                actor: "Big".into(),
            }],
            default: None,
        };
        let ctx = json!({"trigger": {"big": false}});
        assert!(resolve_actor(&actor, &ctx).is_err());
    }

    #[test]
    fn for_mode_returns_none_for_human_approval() {
        assert!(for_mode(StageMode::HumanApproval).is_none());
    }
}
