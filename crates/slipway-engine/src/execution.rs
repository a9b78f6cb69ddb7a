//! The sequence execution record.
//!
//! One [`SequenceExecution`] document exists per
//! `(project, keptn context, stage)` and owns the full lifecycle of a
//! sequence instance: the task list snapshot taken at trigger time, the
//! chronological record of completed tasks, the currently running task with
//! its `started`/`finished` responses, and the sequence state.
//!
//! All mutations go through compare-and-set on the `revision` field (see
//! [`crate::store::SequenceExecutionStore`]), so observers see a monotonic
//! sequence of revisions and concurrent replicas cannot lose updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use slipway_core::{EventId, KeptnContext};

use crate::event::{ResultType, StatusType};
use crate::shipyard::{SequenceSpec, TaskSpec};

/// Current schema of the persisted document.
pub const EXECUTION_SCHEMA_VERSION: u32 = 1;

/// Scope identifying where an execution lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionScope {
    /// The project the sequence belongs to.
    pub project: String,
    /// The stage the sequence runs in.
    pub stage: String,
    /// The service the sequence operates on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// The correlation id of the end-to-end flow.
    pub keptn_context: KeptnContext,
}

/// Lifecycle state of a sequence execution.
///
/// `Finished`, `TimedOut`, `Aborted` and `Errored` are terminal and never
/// transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SequenceState {
    /// A task `.triggered` event is out (or the sequence awaits dispatch).
    Triggered,
    /// Queued behind another sequence in the same stage.
    Waiting,
    /// The current task has been picked up by an executor.
    Started,
    /// Suspended by a control request.
    Paused,
    /// All tasks completed (or the sequence stopped on a failing task).
    Finished,
    /// No executor picked the current task up in time.
    TimedOut,
    /// Terminated by a control request.
    Aborted,
    /// The control plane could not drive the sequence further.
    Errored,
}

impl SequenceState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::TimedOut | Self::Aborted | Self::Errored
        )
    }

    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Waiting => "waiting",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::TimedOut => "timedOut",
            Self::Aborted => "aborted",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `started` response recorded against the current task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedEvent {
    /// Id of the `.started` event.
    pub event_id: EventId,
    /// The executor instance that responded.
    pub source: String,
    /// When the response arrived.
    pub time: DateTime<Utc>,
}

/// A `finished` response recorded against the current task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedEvent {
    /// Id of the `.finished` event.
    pub event_id: EventId,
    /// The executor instance that responded.
    pub source: String,
    /// When the response arrived.
    pub time: DateTime<Utc>,
    /// Result reported by the executor.
    pub result: ResultType,
    /// Status reported by the executor.
    pub status: StatusType,
    /// Payload reported by the executor.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

/// The task currently awaiting or undergoing execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTask {
    /// Task name.
    pub name: String,
    /// Id of the task's `.triggered` event.
    pub triggered_id: EventId,
    /// Logical trigger time (the due time for delayed tasks).
    pub triggered_at: DateTime<Utc>,
    /// `started` responses, one per executor instance.
    #[serde(default)]
    pub started_events: Vec<StartedEvent>,
    /// `finished` responses.
    #[serde(default)]
    pub finished_events: Vec<FinishedEvent>,
    /// The payload the task was triggered with.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl CurrentTask {
    /// A task is started once at least one executor responded.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.started_events.is_empty()
    }

    /// A task is finished once every started executor has responded.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.is_started() && self.finished_events.len() >= self.started_events.len()
    }
}

/// Chronological record of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTask {
    /// Task name.
    pub name: String,
    /// Id of the task's `.triggered` event.
    pub triggered_id: EventId,
    /// When the task was triggered.
    pub start: DateTime<Utc>,
    /// When the last `finished` response arrived.
    pub end: DateTime<Utc>,
    /// Aggregate result (worst of all `finished` responses).
    pub result: ResultType,
    /// Aggregate status.
    pub status: StatusType,
    /// Payload of the last `finished` response.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

/// The mutable status block of a sequence execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStatus {
    /// Lifecycle state.
    pub state: SequenceState,
    /// State to restore on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before_pause: Option<SequenceState>,
    /// Completed tasks, in shipyard order.
    #[serde(default)]
    pub previous_tasks: Vec<CompletedTask>,
    /// The task in flight, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<CurrentTask>,
}

/// The primary state record of one sequence instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceExecution {
    /// Persisted document schema version.
    pub schema_version: u32,

    /// Monotonic revision for compare-and-set.
    pub revision: u64,

    /// Where this execution lives.
    pub scope: ExecutionScope,

    /// The sequence name from the shipyard.
    pub sequence_name: String,

    /// Id of the sequence's `.triggered` event.
    pub triggered_id: EventId,

    /// Commit hash of the shipyard the task list was resolved from.
    pub shipyard_version: String,

    /// Task list snapshot taken at trigger time. Later shipyard edits do not
    /// mutate in-flight sequences.
    pub sequence: SequenceSpec,

    /// Payload seed carried across tasks, updated by the property merge.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input_properties: Map<String, Value>,

    /// Lifecycle status.
    pub status: SequenceStatus,

    /// When the sequence was triggered.
    pub triggered_at: DateTime<Utc>,
}

impl SequenceExecution {
    /// Creates a freshly triggered execution awaiting dispatch.
    #[must_use]
    pub fn new(
        scope: ExecutionScope,
        triggered_id: EventId,
        sequence: SequenceSpec,
        shipyard_version: impl Into<String>,
        input_properties: Map<String, Value>,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: EXECUTION_SCHEMA_VERSION,
            revision: 0,
            sequence_name: sequence.name.clone(),
            scope,
            triggered_id,
            shipyard_version: shipyard_version.into(),
            sequence,
            input_properties,
            status: SequenceStatus {
                state: SequenceState::Triggered,
                state_before_pause: None,
                previous_tasks: Vec::new(),
                current_task: None,
            },
            triggered_at,
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SequenceState {
        self.status.state
    }

    /// Returns true if the execution can never transition again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Returns true if the execution occupies its stage.
    ///
    /// A freshly triggered execution still sitting in the sequence queue does
    /// not block the stage; one that has emitted a task does, as do started
    /// and paused ones.
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        match self.status.state {
            SequenceState::Started | SequenceState::Paused => true,
            SequenceState::Triggered => self.status.current_task.is_some(),
            _ => false,
        }
    }

    /// Records a `started` response against the current task.
    ///
    /// Deduplicates by `(triggered id, source)` and by event id. Returns true
    /// if the response was recorded.
    pub fn record_started(&mut self, event_id: EventId, source: &str, time: DateTime<Utc>) -> bool {
        let Some(task) = self.status.current_task.as_mut() else {
            return false;
        };
        let duplicate = task
            .started_events
            .iter()
            .any(|s| s.source == source || s.event_id == event_id);
        if duplicate {
            return false;
        }
        task.started_events.push(StartedEvent {
            event_id,
            source: source.to_string(),
            time,
        });
        true
    }

    /// Records a `finished` response against the current task.
    ///
    /// A `finished` arriving without a matching `started` first synthesizes
    /// one carrying the finisher's source, which handles executors that skip
    /// emitting `started`. Deduplicates by event id. Returns true if the
    /// response was recorded.
    pub fn record_finished(&mut self, finished: FinishedEvent) -> bool {
        let Some(task) = self.status.current_task.as_mut() else {
            return false;
        };
        if task.finished_events.iter().any(|f| f.event_id == finished.event_id) {
            return false;
        }
        let has_started = task
            .started_events
            .iter()
            .any(|s| s.source == finished.source);
        if !has_started {
            task.started_events.push(StartedEvent {
                event_id: finished.event_id,
                source: finished.source.clone(),
                time: finished.time,
            });
        }
        task.finished_events.push(finished);
        true
    }

    /// Returns the next task to trigger, by position in the snapshot.
    #[must_use]
    pub fn next_task_spec(&self) -> Option<&TaskSpec> {
        if self.status.current_task.is_some() {
            return None;
        }
        self.sequence.tasks.get(self.status.previous_tasks.len())
    }

    /// Returns the shipyard spec of the current task.
    #[must_use]
    pub fn current_task_spec(&self) -> Option<&TaskSpec> {
        let current = self.status.current_task.as_ref()?;
        self.sequence.tasks.iter().find(|t| t.name == current.name)
    }

    /// Completes the current task if every started executor has finished.
    ///
    /// Appends the task to `previous_tasks` with its aggregate result and
    /// status, merges the last `finished` payload into `input_properties`,
    /// and clears the current task. Returns the completed record, or `None`
    /// when the task is absent or still running.
    pub fn complete_current_task(&mut self) -> Option<CompletedTask> {
        let task = self.status.current_task.as_ref()?;
        if !task.is_finished() {
            return None;
        }
        let task = self.status.current_task.take()?;

        let result = task
            .finished_events
            .iter()
            .map(|f| f.result)
            .fold(ResultType::Pass, ResultType::worst);
        let status = if task.finished_events.iter().any(|f| f.status == StatusType::Errored) {
            StatusType::Errored
        } else {
            StatusType::Succeeded
        };
        let end = task
            .finished_events
            .iter()
            .map(|f| f.time)
            .max()
            .unwrap_or(task.triggered_at);
        let properties = task
            .finished_events
            .last()
            .map(|f| f.properties.clone())
            .unwrap_or_default();

        merge_properties(&mut self.input_properties, &properties);

        let completed = CompletedTask {
            name: task.name,
            triggered_id: task.triggered_id,
            start: task.triggered_at,
            end,
            result,
            status,
            properties,
        };
        self.status.previous_tasks.push(completed.clone());
        Some(completed)
    }

    /// Aggregate result over all completed tasks.
    #[must_use]
    pub fn sequence_result(&self) -> ResultType {
        self.status
            .previous_tasks
            .iter()
            .map(|t| t.result)
            .fold(ResultType::Pass, ResultType::worst)
    }

    /// Aggregate status over all completed tasks.
    #[must_use]
    pub fn sequence_status(&self) -> StatusType {
        if self
            .status
            .previous_tasks
            .iter()
            .any(|t| t.status == StatusType::Errored)
        {
            StatusType::Errored
        } else {
            StatusType::Succeeded
        }
    }

    /// Checks the task accounting invariant:
    /// `|previousTasks| + (current ? 1 : 0) + remaining = |sequence.tasks|`.
    #[must_use]
    pub fn task_accounting_holds(&self) -> bool {
        let done = self.status.previous_tasks.len();
        let in_flight = usize::from(self.status.current_task.is_some());
        done + in_flight <= self.sequence.tasks.len()
    }
}

/// Merges `src` into `dest` with last-writer-wins semantics at the top
/// level. Nested maps merge recursively; arrays and scalars replace.
pub fn merge_properties(dest: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_properties(existing, incoming);
            }
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shipyard::OnError;
    use serde_json::json;

    fn two_task_sequence() -> SequenceSpec {
        SequenceSpec {
            name: "delivery".into(),
            triggered_on: Vec::new(),
            tasks: vec![
                TaskSpec {
                    name: "deploy".into(),
                    triggered_after: None,
                    on_error: OnError::Abort,
                    properties: None,
                },
                TaskSpec {
                    name: "test".into(),
                    triggered_after: None,
                    on_error: OnError::Abort,
                    properties: None,
                },
            ],
        }
    }

    fn execution() -> SequenceExecution {
        SequenceExecution::new(
            ExecutionScope {
                project: "sockshop".into(),
                stage: "dev".into(),
                service: Some("carts".into()),
                keptn_context: KeptnContext::new("c1"),
            },
            EventId::generate(),
            two_task_sequence(),
            "abc123",
            Map::new(),
            Utc::now(),
        )
    }

    fn with_current_task(mut exec: SequenceExecution) -> (SequenceExecution, EventId) {
        let triggered_id = EventId::generate();
        exec.status.current_task = Some(CurrentTask {
            name: "deploy".into(),
            triggered_id,
            triggered_at: Utc::now(),
            started_events: Vec::new(),
            finished_events: Vec::new(),
            properties: Map::new(),
        });
        (exec, triggered_id)
    }

    fn finished(result: ResultType, source: &str) -> FinishedEvent {
        FinishedEvent {
            event_id: EventId::generate(),
            source: source.into(),
            time: Utc::now(),
            result,
            status: StatusType::Succeeded,
            properties: Map::new(),
        }
    }

    #[test]
    fn fresh_execution_does_not_occupy_stage() {
        let exec = execution();
        assert_eq!(exec.state(), SequenceState::Triggered);
        assert!(!exec.is_dispatched());
        assert!(exec.task_accounting_holds());
    }

    #[test]
    fn started_dedup_by_source() {
        let (mut exec, _) = with_current_task(execution());
        assert!(exec.record_started(EventId::generate(), "helm-service", Utc::now()));
        assert!(!exec.record_started(EventId::generate(), "helm-service", Utc::now()));
        assert!(exec.record_started(EventId::generate(), "helm-service-2", Utc::now()));

        let task = exec.status.current_task.as_ref().unwrap();
        assert_eq!(task.started_events.len(), 2);
    }

    #[test]
    fn replayed_started_event_is_noop() {
        let (mut exec, _) = with_current_task(execution());
        let event_id = EventId::generate();
        assert!(exec.record_started(event_id, "helm-service", Utc::now()));
        assert!(!exec.record_started(event_id, "helm-service", Utc::now()));
    }

    #[test]
    fn finished_without_started_synthesizes_started() {
        let (mut exec, _) = with_current_task(execution());
        assert!(exec.record_finished(finished(ResultType::Pass, "helm-service")));

        let task = exec.status.current_task.as_ref().unwrap();
        assert_eq!(task.started_events.len(), 1);
        assert_eq!(task.started_events[0].source, "helm-service");
        assert!(task.is_finished());
    }

    #[test]
    fn task_not_finished_until_all_starters_respond() {
        let (mut exec, _) = with_current_task(execution());
        exec.record_started(EventId::generate(), "helm-a", Utc::now());
        exec.record_started(EventId::generate(), "helm-b", Utc::now());
        exec.record_finished(finished(ResultType::Pass, "helm-a"));

        assert!(!exec.status.current_task.as_ref().unwrap().is_finished());
        assert!(exec.complete_current_task().is_none());

        exec.record_finished(finished(ResultType::Warning, "helm-b"));
        let completed = exec.complete_current_task().unwrap();
        assert_eq!(completed.result, ResultType::Warning);
        assert_eq!(completed.status, StatusType::Succeeded);
        assert!(exec.status.current_task.is_none());
        assert_eq!(exec.status.previous_tasks.len(), 1);
    }

    #[test]
    fn completion_merges_last_finished_payload() {
        let (mut exec, _) = with_current_task(execution());
        exec.input_properties = json!({"image": "v1", "config": {"replicas": 1, "zone": "a"}})
            .as_object()
            .cloned()
            .unwrap();

        let mut payload = finished(ResultType::Pass, "helm-service");
        payload.properties = json!({"deployedAt": "now", "config": {"replicas": 3}})
            .as_object()
            .cloned()
            .unwrap();
        exec.record_finished(payload);
        exec.complete_current_task().unwrap();

        assert_eq!(exec.input_properties["image"], json!("v1"));
        assert_eq!(exec.input_properties["deployedAt"], json!("now"));
        // nested maps merge recursively
        assert_eq!(exec.input_properties["config"]["replicas"], json!(3));
        assert_eq!(exec.input_properties["config"]["zone"], json!("a"));
    }

    #[test]
    fn arrays_replace_on_merge() {
        let mut dest = json!({"hosts": ["a", "b"]}).as_object().cloned().unwrap();
        let src = json!({"hosts": ["c"]}).as_object().cloned().unwrap();
        merge_properties(&mut dest, &src);
        assert_eq!(dest["hosts"], json!(["c"]));
    }

    #[test]
    fn next_task_follows_shipyard_order() {
        let mut exec = execution();
        assert_eq!(exec.next_task_spec().unwrap().name, "deploy");

        let (mut exec2, _) = with_current_task(exec.clone());
        assert!(exec2.next_task_spec().is_none());

        exec2.record_finished(finished(ResultType::Pass, "helm"));
        exec2.complete_current_task().unwrap();
        assert_eq!(exec2.next_task_spec().unwrap().name, "test");

        // no next task once all are done
        exec.status.previous_tasks = exec2.status.previous_tasks.clone();
        exec.status.previous_tasks.push(CompletedTask {
            name: "test".into(),
            triggered_id: EventId::generate(),
            start: Utc::now(),
            end: Utc::now(),
            result: ResultType::Pass,
            status: StatusType::Succeeded,
            properties: Map::new(),
        });
        assert!(exec.next_task_spec().is_none());
    }

    #[test]
    fn terminal_states_are_terminal() {
        for state in [
            SequenceState::Finished,
            SequenceState::TimedOut,
            SequenceState::Aborted,
            SequenceState::Errored,
        ] {
            assert!(state.is_terminal());
        }
        for state in [
            SequenceState::Triggered,
            SequenceState::Waiting,
            SequenceState::Started,
            SequenceState::Paused,
        ] {
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn persisted_execution_round_trips() {
        let (mut exec, _) = with_current_task(execution());
        exec.record_started(EventId::generate(), "helm-service", Utc::now());
        exec.record_finished(finished(ResultType::Warning, "helm-service"));

        let json = serde_json::to_string(&exec).unwrap();
        assert!(json.contains("\"schemaVersion\""));
        assert!(json.contains("\"previousTasks\""));

        let parsed: SequenceExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, exec);
    }
}
