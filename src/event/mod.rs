//! Event pipeline -- events, the producer chain, and the dispatcher.
//!
//! An [`EventProducer`] maps one event to zero or more follow-up events.
//! Producing nothing deliberately ends that branch of the pipeline; a run
//! context drains naturally once every branch has ended.

pub mod dispatcher;
pub mod queue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Well-known event name for cheap event disposal.
pub const TERMINATE_EVENT: &str = "terminate";

/// A unit of simulated work. Value object: no shared mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Routing name; selects the producer.
    pub name: String,
    /// Opaque payload interpreted by the producer.
    pub payload: serde_json::Value,
    /// Target wake time in epoch millis; anything <= now runs immediately.
    pub wake_at: i64,
    /// Session id of the owning run context.
    pub session: Uuid,
}

impl Event {
    pub fn immediate(name: impl Into<String>, payload: serde_json::Value, session: Uuid) -> Self {
        Self {
            name: name.into(),
            payload,
            wake_at: 0,
            session,
        }
    }

    pub fn deferred(
        name: impl Into<String>,
        payload: serde_json::Value,
        wake_at: i64,
        session: Uuid,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            wake_at,
            session,
        }
    }
}

/// Maps one input event to its follow-up events. Returning an empty vec makes
/// this a terminal producer for that branch.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn produce(&self, event: &Event) -> anyhow::Result<Vec<Event>>;
}

/// Registry of `name -> producer`. Routing an event with no registered
/// producer is a processing failure for that event, not a pipeline abort.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    inner: HashMap<String, Arc<dyn EventProducer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, producer: Arc<dyn EventProducer>) {
        self.inner.insert(name.to_string(), producer);
    }

    pub async fn produce(&self, event: &Event) -> anyhow::Result<Vec<Event>> {
        match self.inner.get(&event.name) {
            Some(p) => p.produce(event).await,
            None => anyhow::bail!("no producer registered for event '{}'", event.name),
        }
    }
}

/// Always produces nothing. Useful to cheaply destroy events.
pub struct TerminateProducer;

#[async_trait]
impl EventProducer for TerminateProducer {
    async fn produce(&self, _event: &Event) -> anyhow::Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_producer_ends_the_branch() {
        let p = TerminateProducer;
        let ev = Event::immediate(TERMINATE_EVENT, serde_json::Value::Null, Uuid::new_v4());
        assert!(p.produce(&ev).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_name_is_an_error() {
        let registry = ProducerRegistry::new();
        let ev = Event::immediate("mystery", serde_json::Value::Null, Uuid::new_v4());
        assert!(registry.produce(&ev).await.is_err());
    }
}
