//! The pipeline definition data model: the caller-supplied configuration
//! surface for a DAG of stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pipeline definition: a name and an ordered list of stage definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Execution mode for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageMode {
    Single,
    Scatter,
    Gather,
    Broadcast,
    ForkJoin,
    HumanApproval,
    /// Declared but not implemented: validation passes, execution returns a
    /// structured error instructing the author to express it as scatter→gather.
    MapReduce,
}

/// How a stage resolves the actor type it dispatches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorRef {
    /// A literal actor type name.
    Literal(String),
    /// A ternary expression resolved against the pipeline context, e.g.
    /// `"$.trigger.big ? \"BigActor\" : \"SmallActor\""`.
    Ternary(String),
    /// An ordered list of `{condition, actor}` with a default fallback.
    WhenList {
        cases: Vec<WhenCase>,
        default: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhenCase {
    pub condition: String,
    pub actor: String,
}

/// A value in a stage's input map: either a literal or a path expression
/// evaluated against the pipeline context.
pub type InputMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: u64,
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Fixed
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for the given task-level retry attempt
    /// (1-indexed, the attempt *about to be scheduled*).
    pub fn backoff_for(&self, retry_attempt: u32) -> u64 {
        let delay = match self.backoff {
            BackoffKind::Fixed | BackoffKind::Linear => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exponent = retry_attempt.saturating_sub(1).min(32);
                self.base_delay_ms
                    .saturating_mul(2u64.saturating_pow(exponent))
            }
        };
        if self.max_delay_ms > 0 {
            delay.min(self.max_delay_ms)
        } else {
            delay
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

const fn default_half_open_requests() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    pub actor: String,
    /// Input template resolved against the stage's own output.
    pub input: InputMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalFallback {
    AutoApprove,
    AutoReject,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanApprovalConfig {
    pub assign_to: Option<String>,
    pub timeout_ms: u64,
    pub fallback: ApprovalFallback,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRuntimeConfig {
    #[serde(default)]
    pub concurrency: u32,
    #[serde(default)]
    pub lease_ttl_ms: u64,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    Concat,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterConfig {
    /// Path expression evaluating to an array (or single nested array, which
    /// is flattened one level).
    pub input: String,
    /// The name bound to each item in the scoped context.
    #[serde(rename = "as")]
    pub as_name: String,
    /// Optional filter expression evaluated in a scope extended with `as_name`.
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherConfig {
    #[serde(flatten)]
    pub stages: GatherStagesField,
    pub group_by: Option<String>,
    pub combine: Option<CombineMode>,
}

/// Gather accepts either `stage: "name"` or `stages: ["a", "b"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherStagesField {
    pub stage: Option<String>,
    pub stages: Option<Vec<String>>,
}

impl GatherStagesField {
    pub fn resolve(&self) -> Vec<String> {
        if let Some(stages) = &self.stages {
            stages.clone()
        } else if let Some(stage) = &self.stage {
            vec![stage.clone()]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub actors: Vec<String>,
    #[serde(default = "default_true")]
    pub wait_for_all: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkJoinBranch {
    pub name: String,
    pub actor: String,
    pub input: Option<InputMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkJoinConfig {
    pub branches: Vec<ForkJoinBranch>,
}

/// Mode-specific executor configuration. Internally tagged rather than
/// `untagged`: `GatherConfig`'s fields (`stage`/`stages`/`group_by`/`combine`)
/// are all optional, so an untagged enum would match any broadcast or
/// fork-join config as an empty `Gather` before ever trying those variants.
/// The tag is matched against `StageMode` by convention (scatter stages carry
/// a `scatter` config, etc.) the same way `ActorRef` tags its variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    Scatter(ScatterConfig),
    Gather(GatherConfig),
    Broadcast(BroadcastConfig),
    ForkJoin(ForkJoinConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub mode: StageMode,
    pub actor: ActorRef,
    #[serde(default)]
    pub input: InputMap,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub compensation: Option<CompensationConfig>,
    pub human_approval: Option<HumanApprovalConfig>,
    #[serde(default)]
    pub config: StageRuntimeConfig,
    #[serde(default)]
    pub executor_config: Option<ExecutorConfig>,
}

impl StageDefinition {
    pub fn effective_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy {
            max_attempts: 1,
            backoff: BackoffKind::Fixed,
            base_delay_ms: 0,
            max_delay_ms: 0,
        })
    }

    pub fn lease_ttl_ms(&self) -> u64 {
        if self.config.lease_ttl_ms > 0 {
            self.config.lease_ttl_ms
        } else {
            5 * 60 * 1000
        }
    }

    pub fn dead_letter_queue(&self, actor_type: &str) -> String {
        let raw = self
            .config
            .dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("actor-{actor_type}:dlq"));
        raw.replace(':', "-")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_retry_attempt_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(policy.backoff_for(1), 100);
        assert_eq!(policy.backoff_for(2), 200);
        assert_eq!(policy.backoff_for(3), 400);
        assert_eq!(policy.backoff_for(5), 1000); // capped
    }

    #[test]
    fn fixed_and_linear_backoff_return_base_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Linear,
            base_delay_ms: 250,
            max_delay_ms: 0,
        };
        assert_eq!(policy.backoff_for(1), 250);
        assert_eq!(policy.backoff_for(4), 250);
    }

    #[test]
    fn dead_letter_queue_defaults_and_sanitizes_colons() {
        let stage = StageDefinition {
            name: "s".into(),
            mode: StageMode::Single,
            actor: ActorRef::Literal("Echo".into()),
            input: InputMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: None,
        };
        assert_eq!(stage.dead_letter_queue("Echo"), "actor-Echo-dlq");
    }

    #[test]
    fn gather_stages_field_resolves_single_or_many() {
        let one = GatherStagesField {
            stage: Some("split".into()),
            stages: None,
        };
        assert_eq!(one.resolve(), vec!["split".to_string()]);

        let many = GatherStagesField {
            stage: None,
            stages: Some(vec!["a".into(), "b".into()]),
        };
        assert_eq!(many.resolve(), vec!["a".to_string(), "b".to_string()]);
    }
}
