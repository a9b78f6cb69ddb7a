//! Event bus adapter.
//!
//! The control plane publishes and subscribes on a subject hierarchy rooted
//! at `sh.keptn.>`. Subjects equal event types, so one subscription sees
//! every lifecycle event. Subscriptions carry a **group** name: the bus
//! delivers each event to exactly one member per group, which is how
//! horizontally scaled replicas split the inbound stream. The real transport
//! redelivers on nack; downstream deduplicates by event id, so the engine
//! converts at-least-once delivery into exactly-one visible progression.
//!
//! The engine depends only on the [`EventBus`] trait; [`memory::InMemoryBus`]
//! serves tests and single-process deployments.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::Event;

/// A live subscription handed out by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct BusSubscription {
    receiver: mpsc::Receiver<Event>,
}

impl BusSubscription {
    /// Wraps a receiving channel end.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Awaits the next event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

/// Publish/subscribe contract for the delivery bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event under its type as the subject.
    ///
    /// # Errors
    ///
    /// Returns a transient bus error when the transport rejects the publish;
    /// callers leave the event queued and retry on their next tick.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Subscribes to a subject pattern as a member of `group`.
    ///
    /// Each event matching `pattern` is delivered to exactly one member of
    /// each group.
    async fn subscribe(&self, pattern: &str, group: &str) -> Result<BusSubscription>;
}
