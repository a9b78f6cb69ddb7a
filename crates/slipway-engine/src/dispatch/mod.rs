//! The two coupled dispatchers driving sequence progress.
//!
//! - [`sequence::SequenceDispatcher`] admits queued sequences into their
//!   stage, one at a time per `(project, stage)`, FIFO by trigger time
//! - [`event::EventDispatcher`] publishes time-delayed events when their due
//!   time is reached
//!
//! Both are periodic tasks gated by a [`DispatchMode`]: followers run in
//! `ReadOnly` and perform no mutations; the leader-election gate toggles the
//! mode when leadership changes hands.

pub mod event;
pub mod sequence;

use serde::{Deserialize, Serialize};

/// Whether a dispatcher may mutate shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMode {
    /// This replica holds leadership and drives dispatch.
    ReadWrite,
    /// This replica follows; ticks are no-ops.
    ReadOnly,
}

impl DispatchMode {
    /// Returns true if mutations are allowed.
    #[must_use]
    pub const fn is_read_write(&self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}
