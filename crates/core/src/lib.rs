//! Shared error and result types for the pipeline orchestrator workspace.

pub mod error;
pub mod result;

pub use error::Error;
pub use result::{GenericResultExt, OptionExt, Result, ResultExt};
