//! Publishes time-delayed events when their due time is reached.
//!
//! Delayed task emission (`triggeredAfter`) is an event-queue entry with a
//! due time rather than a sleeping worker, so pending emissions survive
//! restarts. Immediate emissions also route through [`EventDispatcher::add`]:
//! a publish failure leaves the event queued, and the next tick retries it.
//! Exactly-once publication is not guaranteed; downstream deduplicates by
//! event id.
//!
//! The dispatcher doubles as a terminal-state hook: once a sequence
//! finishes, times out or aborts, its still-queued events are dropped.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::dispatch::DispatchMode;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::execution::ExecutionScope;
use crate::hooks::SequenceHook;
use crate::metrics::{time_tick, EngineMetrics};
use crate::store::{EventLog, EventQueue, EventQueueItem};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Periodic task publishing due events from the event queue.
pub struct EventDispatcher {
    event_log: Arc<dyn EventLog>,
    event_queue: Arc<dyn EventQueue>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mode: RwLock<DispatchMode>,
    metrics: EngineMetrics,
}

impl EventDispatcher {
    /// Creates an event dispatcher.
    #[must_use]
    pub fn new(
        event_log: Arc<dyn EventLog>,
        event_queue: Arc<dyn EventQueue>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        mode: DispatchMode,
    ) -> Self {
        Self {
            event_log,
            event_queue,
            bus,
            clock,
            interval,
            mode: RwLock::new(mode),
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the current dispatch mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode lock is poisoned.
    pub fn mode(&self) -> Result<DispatchMode> {
        Ok(*self.mode.read().map_err(poison_err)?)
    }

    /// Switches the dispatch mode; called by the leader-election gate.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode lock is poisoned.
    pub fn set_mode(&self, mode: DispatchMode) -> Result<()> {
        *self.mode.write().map_err(poison_err)? = mode;
        Ok(())
    }

    /// Routes an outgoing event.
    ///
    /// Events due now are recorded to the event log and published directly;
    /// a publish failure queues the event for retry on the next tick. Events
    /// due in the future are queued until the due time is reached.
    ///
    /// # Errors
    ///
    /// Returns an error when both the publish and the fallback enqueue fail.
    pub async fn add(
        &self,
        event: Event,
        scope: ExecutionScope,
        due_time: DateTime<Utc>,
    ) -> Result<()> {
        if due_time > self.clock.now() {
            return self
                .event_queue
                .enqueue(EventQueueItem {
                    event,
                    due_time,
                    scope,
                })
                .await;
        }

        self.event_log.append(&event).await?;
        if let Err(error) = self.bus.publish(&event).await {
            tracing::warn!(%error, event_type = %event.event_type, "publish failed, queueing for retry");
            return self
                .event_queue
                .enqueue(EventQueueItem {
                    event,
                    due_time,
                    scope,
                })
                .await;
        }
        Ok(())
    }

    /// Publishes every due event, removing each on publish success.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue itself is unreachable; individual
    /// publish failures only leave their item queued.
    pub async fn tick(&self) -> Result<()> {
        if !self.mode()?.is_read_write() {
            return Ok(());
        }
        let _timing = time_tick("event");

        let due = self.event_queue.due_before(self.clock.now()).await?;
        if due.is_empty() {
            self.metrics.record_dispatch_tick("event", "idle");
        }
        for item in due {
            self.event_log.append(&item.event).await?;
            match self.bus.publish(&item.event).await {
                Ok(()) => {
                    self.event_queue.remove(item.event.id).await?;
                    self.metrics.record_dispatch_tick("event", "dispatched");
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        event_type = %item.event.event_type,
                        "publish failed, keeping event queued"
                    );
                    self.metrics.record_dispatch_tick("event", "error");
                }
            }
        }
        self.metrics
            .set_event_queue_depth(self.event_queue.depth().await?);
        Ok(())
    }

    /// Runs the periodic loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::warn!(%error, "event dispatcher tick failed");
                    }
                }
            }
        }
        tracing::debug!("event dispatcher stopped");
    }

    async fn drop_queued(&self, event: &Event) -> Result<()> {
        let removed = self
            .event_queue
            .remove_for_context(&event.shkeptncontext, event.data.stage.as_deref())
            .await?;
        if removed > 0 {
            tracing::debug!(
                keptn_context = %event.shkeptncontext,
                removed,
                "dropped queued events for terminal sequence"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceHook for EventDispatcher {
    async fn on_sequence_finished(&self, event: &Event) -> Result<()> {
        self.drop_queued(event).await
    }

    async fn on_sequence_timed_out(&self, event: &Event) -> Result<()> {
        self.drop_queued(event).await
    }

    async fn on_sequence_aborted(&self, scope: &ExecutionScope) -> Result<()> {
        self.event_queue
            .remove_for_context(&scope.keptn_context, Some(&scope.stage))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBus;
    use crate::bus::BusSubscription;
    use crate::clock::SimulatedClock;
    use crate::event::{task_event_type, EventData, EventPhase, ALL_EVENTS_PATTERN};
    use crate::store::memory::{InMemoryEventLog, InMemoryEventQueue};
    use slipway_core::KeptnContext;

    struct Fixture {
        dispatcher: Arc<EventDispatcher>,
        clock: Arc<SimulatedClock>,
        queue: Arc<InMemoryEventQueue>,
        log: Arc<InMemoryEventLog>,
        subscription: BusSubscription,
    }

    async fn fixture(mode: DispatchMode) -> Fixture {
        let clock = Arc::new(SimulatedClock::deterministic());
        let queue = Arc::new(InMemoryEventQueue::new());
        let log = Arc::new(InMemoryEventLog::new());
        let bus = Arc::new(InMemoryBus::new());
        let subscription = bus.subscribe(ALL_EVENTS_PATTERN, "test").await.unwrap();
        let dispatcher = Arc::new(EventDispatcher::new(
            log.clone(),
            queue.clone(),
            bus,
            clock.clone(),
            Duration::from_secs(10),
            mode,
        ));
        Fixture {
            dispatcher,
            clock,
            queue,
            log,
            subscription,
        }
    }

    fn scope(context: &str) -> ExecutionScope {
        ExecutionScope {
            project: "sockshop".into(),
            stage: "dev".into(),
            service: None,
            keptn_context: KeptnContext::new(context),
        }
    }

    fn event(context: &str, clock: &SimulatedClock) -> Event {
        Event::new(
            task_event_type("deploy", EventPhase::Triggered),
            "slipway-controller",
            KeptnContext::new(context),
            clock.now(),
            EventData::new("sockshop").with_stage("dev"),
        )
    }

    #[tokio::test]
    async fn add_publishes_due_events_directly() {
        let mut fx = fixture(DispatchMode::ReadWrite).await;
        let e = event("c1", &fx.clock);

        fx.dispatcher
            .add(e.clone(), scope("c1"), fx.clock.now())
            .await
            .unwrap();

        let received = fx.subscription.next().await.unwrap();
        assert_eq!(received.id, e.id);
        // recorded in the log, nothing queued
        assert!(fx.log.get_by_id("sockshop", e.id).await.unwrap().is_some());
        assert_eq!(fx.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_queues_future_events_until_due() {
        let mut fx = fixture(DispatchMode::ReadWrite).await;
        let e = event("c1", &fx.clock);
        let due = fx.clock.now() + chrono::Duration::minutes(10);

        fx.dispatcher.add(e.clone(), scope("c1"), due).await.unwrap();
        assert_eq!(fx.queue.depth().await.unwrap(), 1);

        // not due yet
        fx.dispatcher.tick().await.unwrap();
        assert_eq!(fx.queue.depth().await.unwrap(), 1);

        fx.clock.advance(Duration::from_secs(600));
        fx.dispatcher.tick().await.unwrap();
        assert_eq!(fx.queue.depth().await.unwrap(), 0);

        let received = fx.subscription.next().await.unwrap();
        assert_eq!(received.id, e.id);
    }

    #[tokio::test]
    async fn read_only_mode_publishes_nothing() {
        let fx = fixture(DispatchMode::ReadOnly).await;
        let e = event("c1", &fx.clock);
        fx.queue
            .enqueue(EventQueueItem {
                event: e,
                due_time: fx.clock.now(),
                scope: scope("c1"),
            })
            .await
            .unwrap();

        fx.dispatcher.tick().await.unwrap();
        assert_eq!(fx.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_hook_drops_queued_events() {
        let fx = fixture(DispatchMode::ReadWrite).await;
        let due = fx.clock.now() + chrono::Duration::minutes(10);
        fx.dispatcher
            .add(event("c1", &fx.clock), scope("c1"), due)
            .await
            .unwrap();

        let finished = Event::new(
            "sh.keptn.event.dev.delivery.finished",
            "slipway-controller",
            KeptnContext::new("c1"),
            fx.clock.now(),
            EventData::new("sockshop").with_stage("dev"),
        );
        fx.dispatcher.on_sequence_finished(&finished).await.unwrap();
        assert_eq!(fx.queue.depth().await.unwrap(), 0);
    }
}
