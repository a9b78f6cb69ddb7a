//! Admits queued sequences into their stage.
//!
//! Each tick loads the sequence queue ordered by trigger time, groups items
//! by `(project, stage)` and considers only the head of each group. A head is
//! admitted when no other sequence occupies the stage; otherwise it is
//! deferred and its execution marked `waiting`. Admission is strict FIFO
//! within a group; across groups every non-blocked head is processed per
//! tick.
//!
//! The dispatcher never drives the state machine itself; it hands admitted
//! items to a [`SequenceStarter`] (implemented by the engine) and interprets
//! the outcome: started and gone items leave the queue, conflicted items stay
//! for the next tick.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchMode;
use crate::error::{Error, Result};
use crate::metrics::{time_tick, EngineMetrics};
use crate::store::{SequenceExecutionStore, SequenceQueue, SequenceQueueItem};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Outcome of asking the state machine to start a queued sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The sequence was admitted and its first task emitted.
    Started,
    /// The execution no longer accepts a start (missing, terminal, or
    /// already dispatched); the queue item is stale.
    Gone,
    /// Concurrent writers kept pre-empting the start; retry next tick.
    Conflict,
}

/// The state-machine entry points the dispatcher drives.
#[async_trait]
pub trait SequenceStarter: Send + Sync {
    /// Starts a queued sequence: transitions it out of the queue states and
    /// emits its first task.
    async fn start_sequence(&self, item: &SequenceQueueItem) -> Result<StartOutcome>;

    /// Marks a queued sequence as waiting behind another one.
    async fn defer_sequence(&self, item: &SequenceQueueItem) -> Result<()>;
}

/// Periodic task admitting queued sequences.
pub struct SequenceDispatcher {
    sequence_queue: Arc<dyn SequenceQueue>,
    execution_store: Arc<dyn SequenceExecutionStore>,
    starter: Arc<dyn SequenceStarter>,
    interval: Duration,
    mode: RwLock<DispatchMode>,
    metrics: EngineMetrics,
}

impl SequenceDispatcher {
    /// Creates a sequence dispatcher.
    #[must_use]
    pub fn new(
        sequence_queue: Arc<dyn SequenceQueue>,
        execution_store: Arc<dyn SequenceExecutionStore>,
        starter: Arc<dyn SequenceStarter>,
        interval: Duration,
        mode: DispatchMode,
    ) -> Self {
        Self {
            sequence_queue,
            execution_store,
            starter,
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

    /// Considers the head of every `(project, stage)` group for admission.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue or execution store is unreachable.
    pub async fn tick(&self) -> Result<()> {
        if !self.mode()?.is_read_write() {
            return Ok(());
        }
        let _timing = time_tick("sequence");

        let items = self.sequence_queue.all().await?;
        let mut seen_groups: HashSet<(String, String)> = HashSet::new();

        for item in items {
            let group = (item.scope.project.clone(), item.scope.stage.clone());
            if !seen_groups.insert(group) {
                // head-of-line: only the oldest item per group is considered
                continue;
            }
            self.dispatch_head(&item).await?;
        }
        Ok(())
    }

    async fn dispatch_head(&self, item: &SequenceQueueItem) -> Result<()> {
        let executions = self
            .execution_store
            .find_by_stage(&item.scope.project, &item.scope.stage)
            .await?;
        let blocked = executions.iter().any(|e| {
            !e.is_terminal() && e.is_dispatched() && e.triggered_id != item.event_id
        });

        if blocked {
            tracing::debug!(
                project = %item.scope.project,
                stage = %item.scope.stage,
                keptn_context = %item.scope.keptn_context,
                "stage occupied, sequence stays queued"
            );
            self.starter.defer_sequence(item).await?;
            self.metrics.record_dispatch_tick("sequence", "deferred");
            return Ok(());
        }

        match self.starter.start_sequence(item).await? {
            StartOutcome::Started => {
                self.sequence_queue.remove(item.event_id).await?;
                self.metrics.record_dispatch_tick("sequence", "dispatched");
            }
            StartOutcome::Gone => {
                tracing::warn!(
                    project = %item.scope.project,
                    keptn_context = %item.scope.keptn_context,
                    "removing stale sequence queue item"
                );
                self.sequence_queue.remove(item.event_id).await?;
                self.metrics.record_dispatch_tick("sequence", "stale");
            }
            StartOutcome::Conflict => {
                self.metrics.record_dispatch_tick("sequence", "conflict");
            }
        }
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
                        tracing::warn!(%error, "sequence dispatcher tick failed");
                    }
                }
            }
        }
        tracing::debug!("sequence dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemorySequenceExecutionStore, InMemorySequenceQueue};
    use chrono::Utc;
    use slipway_core::{EventId, KeptnContext};
    use std::sync::Mutex;

    use crate::execution::ExecutionScope;

    struct RecordingStarter {
        started: Mutex<Vec<EventId>>,
        deferred: Mutex<Vec<EventId>>,
        outcome: Mutex<StartOutcome>,
    }

    impl Default for RecordingStarter {
        fn default() -> Self {
            Self::with_outcome(StartOutcome::Started)
        }
    }

    impl RecordingStarter {
        fn with_outcome(outcome: StartOutcome) -> Self {
            Self {
                started: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
                outcome: Mutex::new(outcome),
            }
        }
    }

    #[async_trait]
    impl SequenceStarter for RecordingStarter {
        async fn start_sequence(&self, item: &SequenceQueueItem) -> Result<StartOutcome> {
            self.started.lock().unwrap().push(item.event_id);
            Ok(*self.outcome.lock().unwrap())
        }

        async fn defer_sequence(&self, item: &SequenceQueueItem) -> Result<()> {
            self.deferred.lock().unwrap().push(item.event_id);
            Ok(())
        }
    }

    fn item(context: &str, stage: &str, offset_secs: i64) -> SequenceQueueItem {
        SequenceQueueItem {
            event_id: EventId::generate(),
            scope: ExecutionScope {
                project: "sockshop".into(),
                stage: stage.into(),
                service: None,
                keptn_context: KeptnContext::new(context),
            },
            sequence_name: "delivery".into(),
            triggered_at: Utc::now() + chrono::Duration::seconds(offset_secs),
        }
    }

    fn dispatcher(
        queue: Arc<InMemorySequenceQueue>,
        store: Arc<InMemorySequenceExecutionStore>,
        starter: Arc<RecordingStarter>,
        mode: DispatchMode,
    ) -> SequenceDispatcher {
        SequenceDispatcher::new(queue, store, starter, Duration::from_secs(10), mode)
    }

    #[tokio::test]
    async fn head_of_line_per_group() {
        let queue = Arc::new(InMemorySequenceQueue::new());
        let store = Arc::new(InMemorySequenceExecutionStore::new());
        let starter = Arc::new(RecordingStarter::default());

        let a = item("c1", "dev", 0);
        let b = item("c2", "dev", 1);
        let other_stage = item("c3", "prod", 2);
        queue.enqueue(b.clone()).await.unwrap();
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(other_stage.clone()).await.unwrap();

        dispatcher(queue.clone(), store, starter.clone(), DispatchMode::ReadWrite)
            .tick()
            .await
            .unwrap();

        // one head per group, FIFO within the dev group
        let started = starter.started.lock().unwrap().clone();
        assert_eq!(started, vec![a.event_id, other_stage.event_id]);

        // started heads left the queue, the deferred-behind item did not
        let remaining = queue.all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_id, b.event_id);
    }

    #[tokio::test]
    async fn conflict_keeps_item_queued() {
        let queue = Arc::new(InMemorySequenceQueue::new());
        let store = Arc::new(InMemorySequenceExecutionStore::new());
        let starter = Arc::new(RecordingStarter::with_outcome(StartOutcome::Conflict));

        queue.enqueue(item("c1", "dev", 0)).await.unwrap();
        dispatcher(queue.clone(), store, starter, DispatchMode::ReadWrite)
            .tick()
            .await
            .unwrap();

        assert_eq!(queue.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_item_is_removed() {
        let queue = Arc::new(InMemorySequenceQueue::new());
        let store = Arc::new(InMemorySequenceExecutionStore::new());
        let starter = Arc::new(RecordingStarter::with_outcome(StartOutcome::Gone));

        queue.enqueue(item("c1", "dev", 0)).await.unwrap();
        dispatcher(queue.clone(), store, starter, DispatchMode::ReadWrite)
            .tick()
            .await
            .unwrap();

        assert!(queue.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_mode_is_a_noop() {
        let queue = Arc::new(InMemorySequenceQueue::new());
        let store = Arc::new(InMemorySequenceExecutionStore::new());
        let starter = Arc::new(RecordingStarter::default());

        queue.enqueue(item("c1", "dev", 0)).await.unwrap();
        let dispatcher = dispatcher(queue.clone(), store, starter.clone(), DispatchMode::ReadOnly);
        dispatcher.tick().await.unwrap();

        assert!(starter.started.lock().unwrap().is_empty());
        assert_eq!(queue.all().await.unwrap().len(), 1);

        // promotion to leader enables dispatch
        dispatcher.set_mode(DispatchMode::ReadWrite).unwrap();
        dispatcher.tick().await.unwrap();
        assert_eq!(starter.started.lock().unwrap().len(), 1);
    }
}
