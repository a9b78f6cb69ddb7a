//! Observability metrics for the sequence engine.
//!
//! Metrics go through the `metrics` crate facade; the service binary installs
//! a Prometheus recorder. Recording without an installed recorder is a no-op,
//! so library code records unconditionally.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `slipway_sequence_transitions_total` | Counter | `state` | Sequence state transitions committed |
//! | `slipway_task_events_total` | Counter | `phase` | Task lifecycle events processed |
//! | `slipway_late_events_total` | Counter | - | Task responses discarded after timeout |
//! | `slipway_cas_conflicts_total` | Counter | - | Compare-and-set conflicts observed |
//! | `slipway_dispatch_ticks_total` | Counter | `dispatcher`, `outcome` | Dispatcher tick outcomes |
//! | `slipway_tick_duration_seconds` | Histogram | `dispatcher` | Dispatcher tick processing time |
//! | `slipway_event_queue_depth` | Gauge | - | Delayed events awaiting publication |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: sequence state transitions committed.
    pub const SEQUENCE_TRANSITIONS_TOTAL: &str = "slipway_sequence_transitions_total";
    /// Counter: task lifecycle events processed.
    pub const TASK_EVENTS_TOTAL: &str = "slipway_task_events_total";
    /// Counter: task responses discarded after a timeout.
    pub const LATE_EVENTS_TOTAL: &str = "slipway_late_events_total";
    /// Counter: compare-and-set conflicts observed.
    pub const CAS_CONFLICTS_TOTAL: &str = "slipway_cas_conflicts_total";
    /// Counter: dispatcher tick outcomes.
    pub const DISPATCH_TICKS_TOTAL: &str = "slipway_dispatch_ticks_total";
    /// Histogram: dispatcher tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "slipway_tick_duration_seconds";
    /// Gauge: delayed events awaiting publication.
    pub const EVENT_QUEUE_DEPTH: &str = "slipway_event_queue_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Sequence state a transition committed to.
    pub const STATE: &str = "state";
    /// Task lifecycle phase (triggered, started, finished).
    pub const PHASE: &str = "phase";
    /// Dispatcher name (sequence, event).
    pub const DISPATCHER: &str = "dispatcher";
    /// Tick outcome (dispatched, deferred, idle, error).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a committed sequence state transition.
    pub fn record_transition(&self, state: &str) {
        counter!(
            names::SEQUENCE_TRANSITIONS_TOTAL,
            labels::STATE => state.to_string(),
        )
        .increment(1);
    }

    /// Records a processed task lifecycle event.
    pub fn record_task_event(&self, phase: &str) {
        counter!(
            names::TASK_EVENTS_TOTAL,
            labels::PHASE => phase.to_string(),
        )
        .increment(1);
    }

    /// Records a task response discarded after its sequence timed out.
    pub fn record_late_event(&self) {
        counter!(names::LATE_EVENTS_TOTAL).increment(1);
    }

    /// Records a compare-and-set conflict.
    pub fn record_cas_conflict(&self) {
        counter!(names::CAS_CONFLICTS_TOTAL).increment(1);
    }

    /// Records a dispatcher tick outcome.
    pub fn record_dispatch_tick(&self, dispatcher: &str, outcome: &str) {
        counter!(
            names::DISPATCH_TICKS_TOTAL,
            labels::DISPATCHER => dispatcher.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Sets the delayed-event queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_event_queue_depth(&self, depth: usize) {
        gauge!(names::EVENT_QUEUE_DEPTH).set(depth as f64);
    }
}

/// RAII guard for timing operations; records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for a dispatcher tick.
#[must_use]
pub fn time_tick(dispatcher: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        histogram!(
            names::TICK_DURATION_SECONDS,
            labels::DISPATCHER => dispatcher,
        )
        .record(duration.as_secs_f64());
    })
}
