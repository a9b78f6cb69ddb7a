//! Pluggable storage for orchestration state.
//!
//! Five logical collections back the control plane: `projects`, `events`,
//! `event-queue`, `sequence-queue` and `sequence-execution`, plus the
//! `sequence-state` materialized view maintained by the hook fan-out. Each is
//! a document collection behind a trait so deployments can plug in a real
//! database while tests use [`memory`] implementations.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: The sequence-execution document is the only one with
//!   multi-writer contention and every mutation goes through
//!   [`SequenceExecutionStore::compare_and_set`] on the document revision
//! - **Idempotent queues**: An item is either present or gone; enqueue and
//!   remove are safe to repeat
//! - **Testability**: In-memory implementations for tests and single-process
//!   deployments

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use slipway_core::{EventId, KeptnContext};

use crate::error::Result;
use crate::event::{Event, ResultType};
use crate::execution::{ExecutionScope, SequenceExecution, SequenceState};

/// Result of a compare-and-set on the sequence-execution document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The document was written; `revision` is the new stored revision.
    Success {
        /// The revision the document was committed at.
        revision: u64,
    },
    /// No document exists for the key.
    NotFound,
    /// Another writer committed first.
    RevisionConflict {
        /// The revision actually stored.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Storage for [`SequenceExecution`] documents.
///
/// Keyed by `(project, keptn context, stage)`. All methods are `Send + Sync`
/// to support concurrent access from dispatcher and bus-handler tasks.
#[async_trait]
pub trait SequenceExecutionStore: Send + Sync {
    /// Gets an execution by key.
    async fn get(
        &self,
        project: &str,
        keptn_context: &KeptnContext,
        stage: &str,
    ) -> Result<Option<SequenceExecution>>;

    /// Inserts a new execution.
    ///
    /// Returns false without writing when a document already exists for the
    /// key, which deduplicates replayed trigger events.
    async fn insert(&self, execution: &SequenceExecution) -> Result<bool>;

    /// Writes `execution` if the stored revision equals
    /// `execution.revision`, bumping the stored revision by one.
    ///
    /// This is the only mutation path for existing documents; it serializes
    /// concurrent writers from multiple replicas.
    async fn compare_and_set(&self, execution: &SequenceExecution) -> Result<CasResult>;

    /// Returns every execution for a `(project, stage)` pair.
    async fn find_by_stage(&self, project: &str, stage: &str) -> Result<Vec<SequenceExecution>>;

    /// Returns every execution in the given state, across projects.
    ///
    /// Used by the sequence watcher to scan for overdue task starts.
    async fn find_by_state(&self, state: SequenceState) -> Result<Vec<SequenceExecution>>;
}

/// Append-only log of every event seen or emitted by the control plane.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an event. Replays of an already-recorded id are no-ops.
    async fn append(&self, event: &Event) -> Result<()>;

    /// Looks an event up by id within a project.
    async fn get_by_id(&self, project: &str, id: EventId) -> Result<Option<Event>>;

    /// Returns all responses chained to a `.triggered` event.
    async fn get_by_triggered_id(
        &self,
        project: &str,
        triggered_id: EventId,
    ) -> Result<Vec<Event>>;
}

/// A queued sequence awaiting admission by the sequence dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceQueueItem {
    /// Id of the sequence `.triggered` event.
    pub event_id: EventId,
    /// Where the sequence will run.
    pub scope: ExecutionScope,
    /// The sequence name.
    pub sequence_name: String,
    /// When the sequence was triggered; admission is FIFO per
    /// `(project, stage)` on this field.
    pub triggered_at: DateTime<Utc>,
}

/// Queue of sequences awaiting admission.
#[async_trait]
pub trait SequenceQueue: Send + Sync {
    /// Enqueues an item. Re-enqueueing the same event id is a no-op.
    async fn enqueue(&self, item: SequenceQueueItem) -> Result<()>;

    /// Returns all queued items ordered by `triggered_at` ascending.
    async fn all(&self) -> Result<Vec<SequenceQueueItem>>;

    /// Removes an item by trigger event id. Returns true if it was present.
    async fn remove(&self, event_id: EventId) -> Result<bool>;

    /// Removes every item for a context, optionally narrowed to one stage.
    /// Returns the number of removed items.
    async fn remove_for_context(
        &self,
        keptn_context: &KeptnContext,
        stage: Option<&str>,
    ) -> Result<usize>;
}

/// A time-delayed event awaiting publication by the event dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQueueItem {
    /// The event to publish.
    pub event: Event,
    /// When the event becomes due.
    pub due_time: DateTime<Utc>,
    /// Where the event belongs, for terminal-state cleanup.
    pub scope: ExecutionScope,
}

/// Queue of time-delayed events.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Enqueues an item. Re-enqueueing the same event id is a no-op.
    async fn enqueue(&self, item: EventQueueItem) -> Result<()>;

    /// Returns all items with `due_time <= now`, ordered by due time.
    async fn due_before(&self, now: DateTime<Utc>) -> Result<Vec<EventQueueItem>>;

    /// Removes an item by event id. Returns true if it was present.
    async fn remove(&self, event_id: EventId) -> Result<bool>;

    /// Removes every item for a context, optionally narrowed to one stage.
    /// Returns the number of removed items.
    async fn remove_for_context(
        &self,
        keptn_context: &KeptnContext,
        stage: Option<&str>,
    ) -> Result<usize>;

    /// Returns the number of queued items.
    async fn depth(&self) -> Result<usize>;
}

/// A registered project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project name; unique.
    pub name: String,
    /// Reference to the git credentials secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_credentials_ref: Option<String>,
    /// Default branch of the configuration repository.
    pub default_branch: String,
    /// Stage names, in shipyard order.
    #[serde(default)]
    pub stages: Vec<String>,
}

/// Storage for registered projects.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Creates or replaces a project.
    async fn upsert(&self, project: &Project) -> Result<()>;

    /// Gets a project by name.
    async fn get(&self, name: &str) -> Result<Option<Project>>;

    /// Returns all registered projects.
    async fn all(&self) -> Result<Vec<Project>>;

    /// Deletes a project. Returns true if it existed.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// Per-stage slice of a sequence-state overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOverview {
    /// Stage name.
    pub name: String,
    /// Type of the most recent event seen in the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    /// Most recent result seen in the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,
}

/// Materialized view of one delivery flow, denormalized for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStateOverview {
    /// The project the flow belongs to.
    pub project: String,
    /// The correlation id of the flow.
    pub keptn_context: KeptnContext,
    /// The root sequence name.
    pub name: String,
    /// Wire representation of the flow state.
    pub state: String,
    /// Last update time.
    pub time: DateTime<Utc>,
    /// Per-stage progress.
    #[serde(default)]
    pub stages: Vec<StageOverview>,
}

/// Storage for the sequence-state materialized view.
#[async_trait]
pub trait SequenceStateStore: Send + Sync {
    /// Creates or replaces an overview document.
    async fn upsert(&self, overview: &SequenceStateOverview) -> Result<()>;

    /// Gets an overview by `(project, keptn context)`.
    async fn get(
        &self,
        project: &str,
        keptn_context: &KeptnContext,
    ) -> Result<Option<SequenceStateOverview>>;

    /// Returns all overviews for a project, most recent first.
    async fn find_by_project(&self, project: &str) -> Result<Vec<SequenceStateOverview>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success { revision: 1 }.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::RevisionConflict { actual: 3 }.is_success());
    }
}
