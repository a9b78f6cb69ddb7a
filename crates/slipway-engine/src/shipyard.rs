//! The declarative pipeline specification ("shipyard").
//!
//! A shipyard declares stages, each containing sequences of tasks. It is
//! committed to the project's configuration repository and immutable per
//! commit hash; the engine snapshots the task list of a sequence when the
//! sequence is triggered, so later shipyard edits never mutate in-flight
//! sequences.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::event::ResultType;

/// A parsed pipeline specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipyard {
    /// Specification version, e.g. `spec.keptn.sh/0.2.3`.
    pub api_version: String,

    /// Document kind; always `Shipyard`.
    pub kind: String,

    /// Document metadata.
    pub metadata: ShipyardMetadata,

    /// The pipeline itself.
    pub spec: ShipyardSpec,
}

/// Shipyard document metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipyardMetadata {
    /// Name of the shipyard document.
    pub name: String,
}

/// The stages of a shipyard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipyardSpec {
    /// Ordered list of stages.
    pub stages: Vec<StageSpec>,
}

/// A logical deployment environment isolating its sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, e.g. `dev` or `prod`.
    pub name: String,

    /// Sequences available in this stage.
    #[serde(default)]
    pub sequences: Vec<SequenceSpec>,
}

/// An ordered list of tasks executed as a unit within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSpec {
    /// Sequence name, e.g. `delivery`.
    pub name: String,

    /// Upstream sequence completions that trigger this sequence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_on: Vec<TriggeredOn>,

    /// The tasks of this sequence, in execution order.
    pub tasks: Vec<TaskSpec>,
}

/// Declares that a sequence is triggered by an upstream sequence finishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredOn {
    /// The upstream completion, as `<stage>.<sequence>.finished`.
    pub event: String,

    /// Optional result filter; absent means "trigger on pass only".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}

impl TriggeredOn {
    /// Returns true if this declaration matches the given upstream
    /// completion and result.
    ///
    /// Without a selector, only a passing upstream promotes. An explicit
    /// selector matches its `match.result` value exactly, with `*` accepting
    /// any result.
    #[must_use]
    pub fn matches(&self, finished_event_type: &str, result: ResultType) -> bool {
        if self.event != finished_event_type {
            return false;
        }
        match &self.selector {
            None => result == ResultType::Pass,
            Some(selector) => selector.matches(result),
        }
    }
}

/// Equality filter over the upstream result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    /// Field-value pairs; only `result` is interpreted.
    #[serde(rename = "match")]
    pub matches: Map<String, Value>,
}

impl Selector {
    /// Returns true if the selector accepts the given result.
    #[must_use]
    pub fn matches(&self, result: ResultType) -> bool {
        match self.matches.get("result").and_then(Value::as_str) {
            None | Some("*") => true,
            Some(wanted) => wanted == result.as_str(),
        }
    }
}

/// Failure policy for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// A failing task completes the sequence with `result=fail`.
    #[default]
    Abort,
    /// A failing task does not stop the sequence.
    Continue,
}

/// One unit of work emitted as a `.triggered` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Task name, e.g. `deploy`.
    pub name: String,

    /// Delay between the previous task finishing and this task triggering.
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub triggered_after: Option<Duration>,

    /// Failure policy when the task result is `fail`.
    #[serde(default, skip_serializing_if = "is_default_on_error")]
    pub on_error: OnError,

    /// Task configuration forwarded to executors under the task's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_default_on_error(value: &OnError) -> bool {
    *value == OnError::Abort
}

impl Shipyard {
    /// Parses a shipyard from its YAML representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShipyardInvalid`] when the document does not parse or
    /// fails validation.
    pub fn from_yaml(project: &str, yaml: &str) -> Result<Self> {
        let shipyard: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::ShipyardInvalid {
                project: project.to_string(),
                message: e.to_string(),
            })?;
        shipyard.validate(project)?;
        Ok(shipyard)
    }

    /// Validates structural requirements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShipyardInvalid`] on duplicate stage or sequence
    /// names, empty stages, or sequences without tasks.
    pub fn validate(&self, project: &str) -> Result<()> {
        let invalid = |message: String| Error::ShipyardInvalid {
            project: project.to_string(),
            message,
        };

        if self.spec.stages.is_empty() {
            return Err(invalid("shipyard declares no stages".into()));
        }

        let mut stage_names = std::collections::HashSet::new();
        for stage in &self.spec.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.name)));
            }
            let mut sequence_names = std::collections::HashSet::new();
            for sequence in &stage.sequences {
                if !sequence_names.insert(sequence.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate sequence '{}' in stage '{}'",
                        sequence.name, stage.name
                    )));
                }
                if sequence.tasks.is_empty() {
                    return Err(invalid(format!(
                        "sequence '{}.{}' declares no tasks",
                        stage.name, sequence.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Looks up a sequence definition by stage and name.
    #[must_use]
    pub fn find_sequence(&self, stage: &str, sequence: &str) -> Option<&SequenceSpec> {
        self.spec
            .stages
            .iter()
            .find(|s| s.name == stage)?
            .sequences
            .iter()
            .find(|s| s.name == sequence)
    }

    /// Returns every `(stage, sequence)` whose `triggeredOn` declaration
    /// matches the given upstream completion.
    ///
    /// `finished_event_type` is the short form `<stage>.<sequence>.finished`.
    #[must_use]
    pub fn sequences_triggered_by(
        &self,
        finished_event_type: &str,
        result: ResultType,
    ) -> Vec<(&StageSpec, &SequenceSpec)> {
        let mut matches = Vec::new();
        for stage in &self.spec.stages {
            for sequence in &stage.sequences {
                if sequence
                    .triggered_on
                    .iter()
                    .any(|t| t.matches(finished_event_type, result))
                {
                    matches.push((stage, sequence));
                }
            }
        }
        matches
    }
}
