//! CloudEvents-compatible envelopes for the delivery bus.
//!
//! Every message on the bus is a structured envelope conforming to the
//! [CloudEvents v1.0 specification](https://cloudevents.io/):
//! - `id`: Unique event identifier (ULID)
//! - `source`: Event origin (service name)
//! - `specversion`: CloudEvents spec version ("1.0")
//! - `type`: Dotted event type under the `sh.keptn.event.` prefix
//! - `time`: Event timestamp
//! - `data`: The actual event payload
//!
//! Two extension attributes carry orchestration identity:
//! - `shkeptncontext`: the correlation id of the end-to-end flow
//! - `triggeredid`: chains `.started`/`.finished` responses back to the
//!   `.triggered` event they answer
//!
//! ## Why ULID for Event Ids
//!
//! ULIDs sort chronologically when compared as strings, so the append-only
//! event log stays in emission order under its primary index without a
//! separate timestamp sort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use slipway_core::{EventId, KeptnContext};

use crate::error::{Error, Result};

/// Prefix shared by every event type on the bus.
pub const EVENT_TYPE_PREFIX: &str = "sh.keptn.event";

/// Subject pattern matching every event on the bus.
pub const ALL_EVENTS_PATTERN: &str = "sh.keptn.>";

/// Outcome reported by a task executor or aggregated over a sequence.
///
/// Ordered by severity: `pass < warning < fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// The task succeeded.
    Pass,
    /// The task succeeded with reservations.
    Warning,
    /// The task failed.
    Fail,
}

impl ResultType {
    /// Returns the worse of two results (`pass < warning < fail`).
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warning => "warning",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status reported by a task executor or the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    /// The work was carried out as instructed.
    Succeeded,
    /// The work could not be carried out.
    Errored,
    /// The outcome is not known.
    Unknown,
    /// The sequence was aborted by a control request.
    Aborted,
}

impl StatusType {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase encoded in an event type suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPhase {
    /// Work has been requested.
    Triggered,
    /// An executor has picked the work up.
    Started,
    /// The work is complete.
    Finished,
    /// The sequence is queued behind another one.
    Waiting,
}

impl EventPhase {
    /// Returns the type-suffix representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Waiting => "waiting",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "triggered" => Some(Self::Triggered),
            "started" => Some(Self::Started),
            "finished" => Some(Self::Finished),
            "waiting" => Some(Self::Waiting),
            _ => None,
        }
    }
}

/// Structural classification of an event type.
///
/// Sequence events carry three segments after the prefix
/// (`<stage>.<sequence>.<phase>`), task events carry two
/// (`<task>.<phase>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A sequence lifecycle event scoped to a stage.
    Sequence {
        /// The stage the sequence runs in.
        stage: String,
        /// The sequence name.
        sequence: String,
        /// The lifecycle phase.
        phase: EventPhase,
    },
    /// A task lifecycle event.
    Task {
        /// The task name.
        task: String,
        /// The lifecycle phase.
        phase: EventPhase,
    },
}

impl EventKind {
    /// Parses a dotted event type string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] when the type does not follow the
    /// `sh.keptn.event.<...>.<phase>` shape.
    pub fn parse(event_type: &str) -> Result<Self> {
        let rest = event_type
            .strip_prefix(EVENT_TYPE_PREFIX)
            .and_then(|r| r.strip_prefix('.'))
            .ok_or_else(|| {
                Error::malformed(format!("event type '{event_type}' lacks the bus prefix"))
            })?;

        let segments: Vec<&str> = rest.split('.').collect();
        match segments.as_slice() {
            [stage, sequence, phase] => {
                let phase = EventPhase::parse(phase).ok_or_else(|| {
                    Error::malformed(format!("unknown phase in event type '{event_type}'"))
                })?;
                Ok(Self::Sequence {
                    stage: (*stage).to_string(),
                    sequence: (*sequence).to_string(),
                    phase,
                })
            }
            [task, phase] => {
                let phase = EventPhase::parse(phase).ok_or_else(|| {
                    Error::malformed(format!("unknown phase in event type '{event_type}'"))
                })?;
                Ok(Self::Task {
                    task: (*task).to_string(),
                    phase,
                })
            }
            _ => Err(Error::malformed(format!(
                "event type '{event_type}' has {} segments, expected 2 or 3",
                segments.len()
            ))),
        }
    }
}

/// Formats a sequence event type: `sh.keptn.event.<stage>.<sequence>.<phase>`.
#[must_use]
pub fn sequence_event_type(stage: &str, sequence: &str, phase: EventPhase) -> String {
    format!("{EVENT_TYPE_PREFIX}.{stage}.{sequence}.{}", phase.as_str())
}

/// Formats a task event type: `sh.keptn.event.<task>.<phase>`.
#[must_use]
pub fn task_event_type(task: &str, phase: EventPhase) -> String {
    format!("{EVENT_TYPE_PREFIX}.{task}.{}", phase.as_str())
}

/// Event payload.
///
/// The well-known fields identify scope and outcome; everything else rides in
/// the flattened property map and is carried across tasks by the engine's
/// property merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// The project the event belongs to.
    pub project: String,

    /// The stage the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// The service the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Task or sequence result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,

    /// Task or sequence status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusType>,

    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Free-form payload carried across tasks.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl EventData {
    /// Creates a payload with scope fields only.
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stage: None,
            service: None,
            result: None,
            status: None,
            message: None,
            properties: Map::new(),
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the result.
    #[must_use]
    pub const fn with_result(mut self, result: ResultType) -> Self {
        self.result = Some(result);
        self
    }

    /// Sets the status.
    #[must_use]
    pub const fn with_status(mut self, status: StatusType) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the free-form property map.
    #[must_use]
    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }
}

/// A structured event envelope on the delivery bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,

    /// CloudEvents specification version.
    pub specversion: String,

    /// Event origin (service name).
    pub source: String,

    /// Dotted event type.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event timestamp.
    pub time: DateTime<Utc>,

    /// Correlation id of the end-to-end flow.
    pub shkeptncontext: KeptnContext,

    /// Id of the `.triggered` event this one responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggeredid: Option<EventId>,

    /// Event payload.
    pub data: EventData,
}

impl Event {
    /// Creates a new event with a generated id.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        shkeptncontext: KeptnContext,
        time: DateTime<Utc>,
        data: EventData,
    ) -> Self {
        Self {
            id: EventId::generate(),
            specversion: "1.0".into(),
            source: source.into(),
            event_type: event_type.into(),
            time,
            shkeptncontext,
            triggeredid: None,
            data,
        }
    }

    /// Chains this event to the `.triggered` event it responds to.
    #[must_use]
    pub const fn with_triggered_id(mut self, triggered_id: EventId) -> Self {
        self.triggeredid = Some(triggered_id);
        self
    }

    /// Classifies the event type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] for unknown type shapes.
    pub fn kind(&self) -> Result<EventKind> {
        EventKind::parse(&self.event_type)
    }

    /// Returns the subject under which this event is published.
    ///
    /// Subjects equal the event type, so a `sh.keptn.>` subscription sees
    /// every lifecycle event.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.event_type
    }

    /// Validates the envelope fields the engine depends on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] when the context or project is
    /// missing.
    pub fn validate(&self) -> Result<()> {
        if self.shkeptncontext.is_empty() {
            return Err(Error::malformed("missing shkeptncontext"));
        }
        if self.data.project.is_empty() {
            return Err(Error::malformed("missing data.project"));
        }
        Ok(())
    }
}

/// Returns true if a NATS-style subject pattern matches a subject.
///
/// `*` matches exactly one dot-separated token, `>` matches the remainder.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
