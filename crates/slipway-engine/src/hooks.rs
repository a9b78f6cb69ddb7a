//! Hook fan-out for sequence state transitions.
//!
//! After every committed state transition the engine invokes an ordered list
//! of observers. Hooks are best-effort: they run after the compare-and-set
//! commit (never inside it, which keeps them out of the retry loop), their
//! failures are logged and never propagated, and they must not assume any
//! delivery guarantee beyond "after commit, in registration order".
//!
//! The registry maps a [`TransitionKind`] to its ordered observer list, so a
//! hook can subscribe to exactly the transitions it cares about. The two
//! built-in observers are the sequence-state materialized view and the
//! event-queue cleanup performed by the event dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::execution::{ExecutionScope, SequenceState};
use crate::store::{SequenceStateOverview, SequenceStateStore, StageOverview};

/// The state transitions observable through hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// A sequence `.triggered` event was accepted.
    SequenceTriggered,
    /// A queued sequence was admitted by the dispatcher.
    SequenceStarted,
    /// A queued sequence was deferred behind another one.
    SequenceWaiting,
    /// A task `.triggered` event was emitted.
    TaskTriggered,
    /// A task `.started` response was recorded.
    TaskStarted,
    /// A task `.finished` response was recorded.
    TaskFinished,
    /// A sequence reached `finished`.
    SequenceFinished,
    /// A sequence reached `timedOut`.
    SequenceTimedOut,
    /// A sequence was paused.
    SequencePaused,
    /// A sequence was resumed.
    SequenceResumed,
    /// A sequence was aborted.
    SequenceAborted,
}

impl TransitionKind {
    /// Every transition kind, in a stable order.
    pub const ALL: [Self; 11] = [
        Self::SequenceTriggered,
        Self::SequenceStarted,
        Self::SequenceWaiting,
        Self::TaskTriggered,
        Self::TaskStarted,
        Self::TaskFinished,
        Self::SequenceFinished,
        Self::SequenceTimedOut,
        Self::SequencePaused,
        Self::SequenceResumed,
        Self::SequenceAborted,
    ];
}

/// Payload of a hook invocation.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// A sequence `.triggered` event was accepted.
    SequenceTriggered(Event),
    /// A queued sequence was admitted by the dispatcher.
    SequenceStarted(Event),
    /// A queued sequence was deferred behind another one.
    SequenceWaiting(Event),
    /// A task `.triggered` event was emitted.
    TaskTriggered(Event),
    /// A task `.started` response was recorded.
    TaskStarted(Event),
    /// A task `.finished` response was recorded.
    TaskFinished(Event),
    /// A sequence reached `finished` (its `.finished` event attached).
    SequenceFinished(Event),
    /// A sequence reached `timedOut` (its `.finished` event attached).
    SequenceTimedOut(Event),
    /// A sequence was paused.
    SequencePaused(ExecutionScope),
    /// A sequence was resumed.
    SequenceResumed(ExecutionScope),
    /// A sequence was aborted.
    SequenceAborted(ExecutionScope),
}

impl HookEvent {
    /// The transition kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> TransitionKind {
        match self {
            Self::SequenceTriggered(_) => TransitionKind::SequenceTriggered,
            Self::SequenceStarted(_) => TransitionKind::SequenceStarted,
            Self::SequenceWaiting(_) => TransitionKind::SequenceWaiting,
            Self::TaskTriggered(_) => TransitionKind::TaskTriggered,
            Self::TaskStarted(_) => TransitionKind::TaskStarted,
            Self::TaskFinished(_) => TransitionKind::TaskFinished,
            Self::SequenceFinished(_) => TransitionKind::SequenceFinished,
            Self::SequenceTimedOut(_) => TransitionKind::SequenceTimedOut,
            Self::SequencePaused(_) => TransitionKind::SequencePaused,
            Self::SequenceResumed(_) => TransitionKind::SequenceResumed,
            Self::SequenceAborted(_) => TransitionKind::SequenceAborted,
        }
    }
}

/// An observer of sequence state transitions.
///
/// Every method has a no-op default so implementations override only the
/// transitions they are registered for.
#[async_trait]
pub trait SequenceHook: Send + Sync {
    /// Called after a sequence `.triggered` event is accepted.
    async fn on_sequence_triggered(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a queued sequence is admitted.
    async fn on_sequence_started(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a queued sequence is deferred.
    async fn on_sequence_waiting(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a task `.triggered` event is emitted.
    async fn on_task_triggered(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a task `.started` response is recorded.
    async fn on_task_started(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a task `.finished` response is recorded.
    async fn on_task_finished(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a sequence reaches `finished`.
    async fn on_sequence_finished(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a sequence reaches `timedOut`.
    async fn on_sequence_timed_out(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called after a sequence is paused.
    async fn on_sequence_paused(&self, _scope: &ExecutionScope) -> Result<()> {
        Ok(())
    }

    /// Called after a sequence is resumed.
    async fn on_sequence_resumed(&self, _scope: &ExecutionScope) -> Result<()> {
        Ok(())
    }

    /// Called after a sequence is aborted.
    async fn on_sequence_aborted(&self, _scope: &ExecutionScope) -> Result<()> {
        Ok(())
    }
}

/// Ordered observer lists per transition kind.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<TransitionKind, Vec<Arc<dyn SequenceHook>>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook for one transition kind. Invocation order equals
    /// registration order.
    pub fn register(&mut self, kind: TransitionKind, hook: Arc<dyn SequenceHook>) {
        self.hooks.entry(kind).or_default().push(hook);
    }

    /// Registers a hook for every transition kind.
    pub fn register_all(&mut self, hook: Arc<dyn SequenceHook>) {
        for kind in TransitionKind::ALL {
            self.register(kind, Arc::clone(&hook));
        }
    }

    /// Invokes every hook registered for the payload's transition kind.
    ///
    /// Hook failures are logged at warn and swallowed.
    pub async fn fan_out(&self, payload: &HookEvent) {
        let Some(hooks) = self.hooks.get(&payload.kind()) else {
            return;
        };
        for hook in hooks {
            let result = match payload {
                HookEvent::SequenceTriggered(e) => hook.on_sequence_triggered(e).await,
                HookEvent::SequenceStarted(e) => hook.on_sequence_started(e).await,
                HookEvent::SequenceWaiting(e) => hook.on_sequence_waiting(e).await,
                HookEvent::TaskTriggered(e) => hook.on_task_triggered(e).await,
                HookEvent::TaskStarted(e) => hook.on_task_started(e).await,
                HookEvent::TaskFinished(e) => hook.on_task_finished(e).await,
                HookEvent::SequenceFinished(e) => hook.on_sequence_finished(e).await,
                HookEvent::SequenceTimedOut(e) => hook.on_sequence_timed_out(e).await,
                HookEvent::SequencePaused(s) => hook.on_sequence_paused(s).await,
                HookEvent::SequenceResumed(s) => hook.on_sequence_resumed(s).await,
                HookEvent::SequenceAborted(s) => hook.on_sequence_aborted(s).await,
            };
            if let Err(error) = result {
                tracing::warn!(%error, kind = ?payload.kind(), "sequence hook failed");
            }
        }
    }
}

/// Maintains the denormalized per-flow overview consumed by the inspection
/// surface.
pub struct SequenceStateMaterializedView {
    store: Arc<dyn SequenceStateStore>,
    clock: Arc<dyn Clock>,
}

impl SequenceStateMaterializedView {
    /// Creates the view over its backing store.
    #[must_use]
    pub fn new(store: Arc<dyn SequenceStateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn update_from_event(&self, event: &Event, state: Option<SequenceState>) -> Result<()> {
        let project = event.data.project.clone();
        let context = event.shkeptncontext.clone();

        let mut overview = match self.store.get(&project, &context).await? {
            Some(overview) => overview,
            None => {
                let name = match event.kind() {
                    Ok(EventKind::Sequence { sequence, .. }) => sequence,
                    _ => String::new(),
                };
                SequenceStateOverview {
                    project,
                    keptn_context: context,
                    name,
                    state: SequenceState::Triggered.as_str().to_string(),
                    time: self.clock.now(),
                    stages: Vec::new(),
                }
            }
        };

        if let Some(state) = state {
            overview.state = state.as_str().to_string();
        }
        overview.time = self.clock.now();

        if let Some(stage) = event.data.stage.clone() {
            let entry = match overview.stages.iter_mut().find(|s| s.name == stage) {
                Some(entry) => entry,
                None => {
                    overview.stages.push(StageOverview {
                        name: stage,
                        last_event_type: None,
                        result: None,
                    });
                    overview.stages.last_mut().expect("just pushed")
                }
            };
            entry.last_event_type = Some(event.event_type.clone());
            if let Some(result) = event.data.result {
                entry.result = Some(result);
            }
        }

        self.store.upsert(&overview).await
    }

    async fn update_state(&self, scope: &ExecutionScope, state: SequenceState) -> Result<()> {
        let Some(mut overview) = self
            .store
            .get(&scope.project, &scope.keptn_context)
            .await?
        else {
            return Ok(());
        };
        overview.state = state.as_str().to_string();
        overview.time = self.clock.now();
        self.store.upsert(&overview).await
    }
}

#[async_trait]
impl SequenceHook for SequenceStateMaterializedView {
    async fn on_sequence_triggered(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, Some(SequenceState::Triggered)).await
    }

    async fn on_sequence_started(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, Some(SequenceState::Started)).await
    }

    async fn on_sequence_waiting(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, Some(SequenceState::Waiting)).await
    }

    async fn on_task_triggered(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, None).await
    }

    async fn on_task_started(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, None).await
    }

    async fn on_task_finished(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, None).await
    }

    async fn on_sequence_finished(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, Some(SequenceState::Finished)).await
    }

    async fn on_sequence_timed_out(&self, event: &Event) -> Result<()> {
        self.update_from_event(event, Some(SequenceState::TimedOut)).await
    }

    async fn on_sequence_paused(&self, scope: &ExecutionScope) -> Result<()> {
        self.update_state(scope, SequenceState::Paused).await
    }

    async fn on_sequence_resumed(&self, scope: &ExecutionScope) -> Result<()> {
        self.update_state(scope, SequenceState::Started).await
    }

    async fn on_sequence_aborted(&self, scope: &ExecutionScope) -> Result<()> {
        self.update_state(scope, SequenceState::Aborted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::event::{sequence_event_type, task_event_type, EventData, EventPhase, ResultType};
    use crate::store::memory::InMemorySequenceStateStore;
    use chrono::Utc;
    use slipway_core::KeptnContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SequenceHook for CountingHook {
        async fn on_sequence_triggered(&self, _event: &Event) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::Error::storage("hook backing store down"))
            } else {
                Ok(())
            }
        }
    }

    fn triggered_event() -> Event {
        Event::new(
            sequence_event_type("dev", "delivery", EventPhase::Triggered),
            "slipway-controller",
            KeptnContext::new("c1"),
            Utc::now(),
            EventData::new("sockshop").with_stage("dev"),
        )
    }

    #[tokio::test]
    async fn fan_out_invokes_in_registration_order_and_swallows_failures() {
        let first = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let second = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let mut registry = HookRegistry::new();
        registry.register(TransitionKind::SequenceTriggered, first.clone());
        registry.register(TransitionKind::SequenceTriggered, second.clone());

        registry
            .fan_out(&HookEvent::SequenceTriggered(triggered_event()))
            .await;

        // the failing first hook does not stop the second
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_kinds_are_skipped() {
        let hook = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut registry = HookRegistry::new();
        registry.register(TransitionKind::SequenceFinished, hook.clone());

        registry
            .fan_out(&HookEvent::SequenceTriggered(triggered_event()))
            .await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn materialized_view_tracks_flow() {
        let store = Arc::new(InMemorySequenceStateStore::new());
        let clock = Arc::new(SimulatedClock::deterministic());
        let view = SequenceStateMaterializedView::new(store.clone(), clock);

        view.on_sequence_triggered(&triggered_event()).await.unwrap();

        let mut finished = Event::new(
            task_event_type("deploy", EventPhase::Finished),
            "helm-service",
            KeptnContext::new("c1"),
            Utc::now(),
            EventData::new("sockshop").with_stage("dev"),
        );
        finished.data.result = Some(ResultType::Pass);
        view.on_task_finished(&finished).await.unwrap();

        let overview = store
            .get("sockshop", &KeptnContext::new("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(overview.name, "delivery");
        assert_eq!(overview.state, "triggered");
        assert_eq!(overview.stages.len(), 1);
        assert_eq!(overview.stages[0].result, Some(ResultType::Pass));
    }
}
