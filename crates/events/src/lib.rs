//! Pub/sub event bus used for pipeline/stage lifecycle notifications and
//! the human-approval notification/decision/escalation channels.

pub mod bus;
pub mod error;
pub mod event;
pub mod types;

pub use bus::{EventBus, EventPattern, EventSubscription};
pub use error::{Error, Result};
pub use event::{EventKind, PipelineEvent};
pub use types::EventId;
