//! In-memory bus implementation for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::{BusSubscription, EventBus};
use crate::error::Result;
use crate::event::{subject_matches, Event};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Subscriber {
    pattern: String,
    group: String,
    sender: mpsc::Sender<Event>,
}

/// In-memory [`EventBus`] with queue-group semantics.
///
/// Each published event is delivered to exactly one live member of every
/// matching group, chosen round-robin. Members whose receiver has been
/// dropped are pruned on publish.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    subscribers: RwLock<Vec<Subscriber>>,
    cursor: AtomicUsize,
}

impl InMemoryBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        let subject = event.subject().to_string();
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.sender.is_closed());

        let mut by_group: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        for subscriber in subscribers.iter() {
            if subject_matches(&subscriber.pattern, &subject) {
                by_group
                    .entry(subscriber.group.as_str())
                    .or_default()
                    .push(subscriber);
            }
        }

        let offset = self.cursor.fetch_add(1, Ordering::Relaxed);
        for members in by_group.values() {
            let chosen = &members[offset % members.len()];
            if chosen.sender.send(event.clone()).await.is_err() {
                tracing::warn!(
                    subject = %subject,
                    group = %chosen.group,
                    "dropping event for closed subscriber"
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, group: &str) -> Result<BusSubscription> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let mut subscribers = self.subscribers.write().await;
        subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            group: group.to_string(),
            sender,
        });
        Ok(BusSubscription::new(receiver))
    }
}
