//! Event bus for pub/sub coordination between the orchestrator and anything
//! observing pipeline/stage lifecycle or human-approval decisions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::PipelineEvent;

/// Subscription handle for receiving events.
pub struct EventSubscription {
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl EventSubscription {
    /// Receive the next event, waiting if necessary.
    pub async fn recv(&mut self) -> Result<PipelineEvent> {
        self.receiver.recv().await.map_err(|_| Error::ChannelClosed)
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Result<PipelineEvent> {
        self.receiver.try_recv().map_err(|_| Error::ChannelClosed)
    }
}

/// Pattern for filtering events delivered to a pattern-based subscriber.
#[derive(Debug, Clone)]
pub enum EventPattern {
    /// Match all events.
    All,
    /// Match events by type (see [`PipelineEvent::event_type`]).
    ByType(String),
    /// Match events for one pipeline.
    ByPipeline(String),
    /// Match events by multiple types.
    ByTypes(Vec<String>),
    /// Match decision/escalation events for one approval id — the
    /// `approval:decision:<approvalId>` channel from the external interface.
    ByApproval(String),
}

impl EventPattern {
    /// Check if an event matches this pattern.
    pub fn matches(&self, event: &PipelineEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByType(t) => event.event_type() == t,
            Self::ByPipeline(id) => event.pipeline_id == *id,
            Self::ByTypes(types) => types.iter().any(|t| event.event_type() == t),
            Self::ByApproval(id) => event.approval_id() == Some(id.as_str()),
        }
    }
}

struct Subscriber {
    sender: broadcast::Sender<PipelineEvent>,
    pattern: EventPattern,
}

/// In-process pub/sub bus. Every published event is broadcast to the global
/// subscriber stream and to any pattern-matching subscriber.
pub struct EventBus {
    broadcast: broadcast::Sender<PipelineEvent>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    next_id: RwLock<u64>,
}

impl EventBus {
    /// Create a new event bus with the given broadcast channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(channel_capacity);
        Self {
            broadcast,
            subscribers: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
        }
    }

    /// Publish an event to the global stream and any matching pattern subscribers.
    pub async fn publish(&self, event: PipelineEvent) -> Result<()> {
        debug!(
            event_id = %event.id,
            event_type = event.event_type(),
            pipeline_id = %event.pipeline_id,
            "publishing event"
        );

        // A lagging or absent global receiver is not an error: publication
        // must succeed even if nobody happens to be listening right now.
        let _ = self.broadcast.send(event.clone());

        let subscribers = self.subscribers.read().await;
        subscribers
            .iter()
            .filter(|(_, sub)| sub.pattern.matches(&event))
            .for_each(|(_, sub)| {
                let _ = sub.sender.send(event.clone());
            });

        Ok(())
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.broadcast.subscribe(),
        }
    }

    /// Subscribe to events matching a pattern, returning a subscriber id that
    /// can later be passed to [`EventBus::unsubscribe`].
    pub async fn subscribe_with_pattern(&self, pattern: EventPattern) -> (String, EventSubscription) {
        let (sender, receiver) = broadcast::channel(100);

        let mut next_id = self.next_id.write().await;
        let id = format!("sub_{}", *next_id);
        *next_id += 1;

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id.clone(), Subscriber { sender, pattern });

        (id, EventSubscription { receiver })
    }

    /// Remove a pattern-based subscriber. No-op if the id is unknown.
    pub async fn unsubscribe(&self, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(subscriber_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
