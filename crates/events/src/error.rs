//! Error types for the event bus.

use thiserror::Error;

/// Result type alias for event-bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event-bus error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("event channel closed")]
    ChannelClosed,

    #[error("no event bus configured")]
    NotConfigured,

    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },
}

impl Error {
    /// Create an invalid-event error.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_event_carries_reason() {
        let err = Error::invalid_event("missing pipeline id");
        assert!(err.to_string().contains("missing pipeline id"));
    }

    #[test]
    fn channel_closed_display() {
        assert_eq!(Error::ChannelClosed.to_string(), "event channel closed");
    }
}
