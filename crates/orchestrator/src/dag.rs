//! Stage dependency graph: derives each stage's dependency set from
//! `depends_on`, implicit sequencing, and gather sources, then validates it
//! as an acyclic graph with [`petgraph`].

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::definition::{ExecutorConfig, PipelineDefinition, StageMode};
use crate::error::{OrchestratorError, Result};

/// The stage dependency graph for one pipeline definition.
#[derive(Debug, Clone)]
pub struct StageGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    /// Topological order, entries first.
    order: Vec<String>,
}

impl StageGraph {
    /// Builds and validates the dependency graph for a pipeline definition.
    ///
    /// Dependencies for each stage are, in order: its explicit `depends_on`
    /// list; the gather source stages if it is a gather stage; and, when
    /// neither of those name anything, the immediately preceding stage in
    /// definition order (so an author can write a simple linear pipeline
    /// without spelling out `depends_on` for every stage).
    pub fn build(definition: &PipelineDefinition) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        let mut seen = HashSet::new();
        for stage in &definition.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(OrchestratorError::configuration(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            node_map.insert(stage.name.clone(), graph.add_node(stage.name.clone()));
        }

        if definition.stages.is_empty() {
            return Err(OrchestratorError::configuration(
                "a pipeline must declare at least one stage",
            ));
        }

        for (index, stage) in definition.stages.iter().enumerate() {
            let dependencies = Self::derive_dependencies(definition, stage, index);
            let to = *node_map.get(&stage.name).ok_or_else(|| {
                OrchestratorError::configuration(format!("stage '{}' is not registered", stage.name))
            })?;
            for dependency in dependencies {
                let from = node_map.get(&dependency).copied().ok_or_else(|| {
                    OrchestratorError::configuration(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dependency
                    ))
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let name = graph
                .node_weight(cycle.node_id())
                .cloned()
                .unwrap_or_else(|| "<unknown>".to_string());
            OrchestratorError::configuration(format!("dependency cycle detected at stage '{name}'"))
        })?;

        let order = sorted
            .into_iter()
            .filter_map(|index| graph.node_weight(index).cloned())
            .collect();

        let entries: Vec<&str> = definition
            .stages
            .iter()
            .filter(|stage| Self::derive_dependencies(definition, stage, Self::index_of(definition, &stage.name)).is_empty())
            .map(|stage| stage.name.as_str())
            .collect();
        if entries.is_empty() {
            return Err(OrchestratorError::configuration(
                "a pipeline must have at least one entry stage with no dependencies",
            ));
        }

        Ok(Self {
            graph,
            node_map,
            order,
        })
    }

    fn index_of(definition: &PipelineDefinition, name: &str) -> usize {
        definition
            .stages
            .iter()
            .position(|stage| stage.name == name)
            .unwrap_or(0)
    }

    fn derive_dependencies(
        definition: &PipelineDefinition,
        stage: &crate::definition::StageDefinition,
        index: usize,
    ) -> Vec<String> {
        if !stage.depends_on.is_empty() {
            return stage.depends_on.clone();
        }
        if stage.mode == StageMode::Gather {
            if let Some(ExecutorConfig::Gather(config)) = &stage.executor_config {
                let sources = config.stages.resolve();
                if !sources.is_empty() {
                    return sources;
                }
            }
        }
        if index == 0 {
            Vec::new()
        } else {
            definition
                .stages
                .get(index - 1)
                .map(|previous| vec![previous.name.clone()])
                .unwrap_or_default()
        }
    }

    /// Stage names in an order consistent with their dependencies.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of a stage.
    pub fn dependencies_of(&self, stage_name: &str) -> Vec<String> {
        let Some(&node) = self.node_map.get(stage_name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .filter_map(|index| self.graph.node_weight(index).cloned())
            .collect()
    }

    /// Direct dependents of a stage: the stages unblocked once it completes.
    pub fn dependents_of(&self, stage_name: &str) -> Vec<String> {
        let Some(&node) = self.node_map.get(stage_name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .filter_map(|index| self.graph.node_weight(index).cloned())
            .collect()
    }

    /// Entry stages: those with no dependencies.
    pub fn entry_stages(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.dependencies_of(name).is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::definition::{ActorRef, InputMap, StageDefinition, StageRuntimeConfig};

    fn stage(name: &str, depends_on: Vec<&str>) -> StageDefinition {
        StageDefinition {
            name: name.into(),
            mode: StageMode::Single,
            actor: ActorRef::Literal("Echo".into()),
            input: InputMap::new(),
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
            retry: None,
            circuit_breaker: None,
            compensation: None,
            human_approval: None,
            config: StageRuntimeConfig::default(),
            executor_config: None,
        }
    }

    #[test]
    fn linear_pipeline_infers_sequential_dependencies() {
        let def = PipelineDefinition::new("p", vec![stage("a", vec![]), stage("b", vec![]), stage("c", vec![])]);
        let graph = StageGraph::build(&def).unwrap();
        assert_eq!(graph.dependencies_of("b"), vec!["a".to_string()]);
        assert_eq!(graph.dependencies_of("c"), vec!["b".to_string()]);
        assert_eq!(graph.entry_stages(), vec!["a".to_string()]);
    }

    #[test]
    fn explicit_depends_on_overrides_sequential_inference() {
        let def = PipelineDefinition::new("p", vec![stage("a", vec![]), stage("b", vec![]), stage("c", vec!["a"])]);
        let graph = StageGraph::build(&def).unwrap();
        assert_eq!(graph.dependencies_of("c"), vec!["a".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let def = PipelineDefinition::new("p", vec![stage("a", vec!["b"]), stage("b", vec!["a"])]);
        assert!(StageGraph::build(&def).is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let def = PipelineDefinition::new("p", vec![stage("a", vec!["ghost"])]);
        assert!(StageGraph::build(&def).is_err());
    }

    #[test]
    fn duplicate_stage_name_is_rejected() {
        let def = PipelineDefinition::new("p", vec![stage("a", vec![]), stage("a", vec![])]);
        assert!(StageGraph::build(&def).is_err());
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let def = PipelineDefinition::new("p", vec![]);
        assert!(StageGraph::build(&def).is_err());
    }
}
