//! Durable, distributed DAG pipeline orchestrator.
//!
//! This crate is the core described by the specification: the DAG
//! scheduler ([`pipeline::PipelineOrchestrator`], C7), the durable state
//! store abstraction (`state`, C2), the expression evaluator (`expr`, C1),
//! the circuit breaker (`circuit_breaker`, C3), the saga coordinator
//! (`saga`, C4), the human-approval executor (`approval`, C5), the stage
//! executors (`executors`, C6), the control-queue worker (`worker`, C8),
//! and the tracer collaborator (`tracer`, C9).
//!
//! The message transport and state backend are external collaborators
//! described only at their interface boundary: [`transport::Transport`]
//! and [`state::StateStore`]. This crate ships an in-memory implementation
//! of each for tests and local use, and a `SurrealDB`-backed state store
//! for durable deployments.

pub mod approval;
pub mod circuit_breaker;
pub mod dag;
pub mod definition;
pub mod error;
pub mod executors;
pub mod expr;
pub mod pipeline;
pub mod records;
pub mod saga;
pub mod state;
pub mod tracer;
pub mod transport;
pub mod worker;

pub use approval::HumanApprovalExecutor;
pub use circuit_breaker::CircuitBreaker;
pub use dag::StageGraph;
pub use definition::{PipelineDefinition, StageDefinition, StageMode};
pub use error::{OrchestratorError, Result};
pub use pipeline::PipelineOrchestrator;
pub use records::{PipelineRecord, PipelineStatus, StageRecord, StageStatus};
pub use saga::SagaCoordinator;
pub use state::StateStore;
pub use transport::Transport;
pub use worker::ControlQueueWorker;
