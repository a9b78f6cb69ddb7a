//! Injected wall-clock capability.
//!
//! Every time-based decision in the engine (dispatch due-times, task-started
//! deadlines, queue ordering) reads the clock through the [`Clock`] trait so
//! tests can fast-forward time deterministically. The clock is the only
//! process-wide capability; everything else is constructed and passed through
//! explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Abstract wall-clock.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated clock for deterministic time control in tests.
#[derive(Debug)]
pub struct SimulatedClock {
    /// Base time (start of simulation).
    base: DateTime<Utc>,
    /// Elapsed milliseconds since base.
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a new simulated clock starting at the given time.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Creates a clock anchored at a deterministic epoch (Unix epoch).
    ///
    /// # Panics
    ///
    /// Never panics; the epoch is a valid timestamp.
    #[must_use]
    pub fn deterministic() -> Self {
        let base = Utc
            .timestamp_millis_opt(0)
            .single()
            .expect("valid epoch timestamp");
        Self::new(base)
    }

    /// Advances the clock by the given duration.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Advances the clock to a specific point in time.
    ///
    /// # Panics
    ///
    /// Panics if the target time is before the base or current simulated time.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        assert!(
            target >= self.base,
            "cannot move clock before base: base={:?}, target={target:?}",
            self.base
        );
        let target_ms: u64 = (target - self.base)
            .num_milliseconds()
            .try_into()
            .expect("non-negative target duration");
        let current = self.elapsed_ms.load(Ordering::Relaxed);
        assert!(
            target_ms >= current,
            "cannot move clock backwards: current={current}ms, target={target_ms}ms"
        );
        self.elapsed_ms.store(target_ms, Ordering::Relaxed);
    }

    /// Returns elapsed time since simulation start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for SimulatedClock {
    #[allow(clippy::cast_possible_wrap)]
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.elapsed_ms.load(Ordering::Relaxed);
        self.base + chrono::Duration::milliseconds(elapsed as i64)
    }
}
