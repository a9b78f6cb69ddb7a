//! The sequence execution state machine.
//!
//! [`SequenceEngine`] owns the lifecycle of every sequence execution. It
//! classifies incoming bus events, creates and enqueues executions for
//! sequence `.triggered` events, records task `.started`/`.finished`
//! responses, advances to the next task when response counts equalize, and
//! drives terminal transitions (finished, timed out, aborted, errored).
//!
//! ## Commit discipline
//!
//! Every mutation is computed as a pure function over a copy of the
//! execution document and committed with compare-and-set on the document
//! revision. Side effects (event emission, hook fan-out, promotion) are
//! collected while mutating and performed strictly **after** the commit, so
//! a pre-empted writer re-reads and recomputes without ever having published
//! anything. Conflicts retry up to [`DEFAULT_MAX_CAS_RETRIES`] times; a
//! sequence whose writers cannot agree within the budget is failed with
//! `errored`.
//!
//! At-least-once bus delivery becomes exactly-one visible progression here:
//! replayed events are deduplicated against the recorded response lists and
//! the execution key before any effect escapes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use slipway_core::KeptnContext;

use crate::clock::Clock;
use crate::dispatch::event::EventDispatcher;
use crate::dispatch::sequence::{SequenceStarter, StartOutcome};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{
    sequence_event_type, task_event_type, Event, EventData, EventKind, EventPhase, ResultType,
    StatusType,
};
use crate::execution::{
    CurrentTask, ExecutionScope, FinishedEvent, SequenceExecution, SequenceState,
};
use crate::hooks::{HookEvent, HookRegistry};
use crate::metrics::EngineMetrics;
use crate::retriever::ShipyardRetriever;
use crate::shipyard::{OnError, SequenceSpec, TaskSpec};
use crate::store::{EventLog, SequenceExecutionStore, SequenceQueue, SequenceQueueItem};
use crate::watcher::SequenceTimeout;

/// Event source attached to everything the control plane emits.
pub const EVENT_SOURCE: &str = "slipway-controller";

/// Bounded retry budget for compare-and-set conflicts.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 10;

/// Control operations on a sequence execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceControlOp {
    /// Suspend progression; task responses are still recorded.
    Pause,
    /// Restore the pre-pause state and re-run a pending advance.
    Resume,
    /// Terminate the sequence.
    Abort,
}

/// A control request addressed at one execution.
#[derive(Debug, Clone)]
pub struct SequenceControlRequest {
    /// The execution to control.
    pub scope: ExecutionScope,
    /// The operation to apply.
    pub op: SequenceControlOp,
}

/// Side effects collected during a mutation, performed after commit.
enum Effect {
    /// Route an event through the event dispatcher.
    Send {
        event: Event,
        scope: ExecutionScope,
        due: DateTime<Utc>,
    },
    /// Invoke the hooks registered for a transition.
    FanOut(HookEvent),
    /// Drop pending sequence-queue items for a terminal execution.
    ClearSequenceQueue {
        keptn_context: KeptnContext,
        stage: String,
    },
    /// Evaluate cross-stage promotion for a committed `.finished` event.
    Promote { finished: Event },
}

/// Why a mutation closure declined to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    /// The execution is terminal; the input is late.
    Terminal,
    /// The input does not address the current task.
    Mismatch,
    /// The input was already recorded.
    Duplicate,
    /// The execution is not in a state this operation applies to.
    NotApplicable,
}

enum Decision {
    Commit(Vec<Effect>),
    Skip(SkipReason),
}

enum Applied {
    Committed(Vec<Effect>),
    Skipped(SkipReason),
}

/// The sequence execution state machine.
pub struct SequenceEngine {
    execution_store: Arc<dyn SequenceExecutionStore>,
    event_log: Arc<dyn EventLog>,
    sequence_queue: Arc<dyn SequenceQueue>,
    event_dispatcher: Arc<EventDispatcher>,
    retriever: Arc<ShipyardRetriever>,
    hooks: Arc<HookRegistry>,
    clock: Arc<dyn Clock>,
    max_cas_retries: u32,
    metrics: EngineMetrics,
}

impl SequenceEngine {
    /// Creates the engine over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_store: Arc<dyn SequenceExecutionStore>,
        event_log: Arc<dyn EventLog>,
        sequence_queue: Arc<dyn SequenceQueue>,
        event_dispatcher: Arc<EventDispatcher>,
        retriever: Arc<ShipyardRetriever>,
        hooks: Arc<HookRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            execution_store,
            event_log,
            sequence_queue,
            event_dispatcher,
            retriever,
            hooks,
            clock,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
            metrics: EngineMetrics::new(),
        }
    }

    /// Overrides the compare-and-set retry budget.
    #[must_use]
    pub const fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }

    /// Entry point for every event received from the bus.
    ///
    /// Malformed events are dropped with a warning; protocol violations are
    /// tolerated and logged. Transient store failures surface as errors so
    /// the bus redelivers.
    ///
    /// # Errors
    ///
    /// Returns an error only for transient failures worth a redelivery.
    pub async fn handle_event(&self, event: Event) -> Result<()> {
        if let Err(error) = event.validate() {
            tracing::warn!(%error, event_type = %event.event_type, "dropping malformed event");
            return Ok(());
        }
        let kind = match event.kind() {
            Ok(kind) => kind,
            Err(error) => {
                tracing::warn!(%error, event_type = %event.event_type, "dropping malformed event");
                return Ok(());
            }
        };
        self.event_log.append(&event).await?;

        match kind {
            EventKind::Sequence {
                stage,
                sequence,
                phase: EventPhase::Triggered,
            } => self.on_sequence_triggered(&event, &stage, &sequence).await,
            EventKind::Task {
                task,
                phase: EventPhase::Started,
            } => self.on_task_started(&event, &task).await,
            EventKind::Task {
                task,
                phase: EventPhase::Finished,
            } => self.on_task_finished(&event, &task).await,
            // our own emissions echo back through the subscription
            _ => Ok(()),
        }
    }

    /// Drains the timeout channel fed by the sequence watcher.
    pub async fn run_timeout_loop(
        self: Arc<Self>,
        mut timeouts: mpsc::Receiver<SequenceTimeout>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                timeout = timeouts.recv() => {
                    let Some(timeout) = timeout else { break };
                    if let Err(error) = self.handle_timeout(timeout).await {
                        tracing::warn!(%error, "timeout handling failed");
                    }
                }
            }
        }
        tracing::debug!("timeout loop stopped");
    }

    // --- sequence triggered ------------------------------------------------

    async fn on_sequence_triggered(
        &self,
        event: &Event,
        stage: &str,
        sequence: &str,
    ) -> Result<()> {
        let project = event.data.project.clone();

        let (shipyard, version) = match self.retriever.get_shipyard(&project).await {
            Ok(resolved) => resolved,
            Err(error) if error.kind() == ErrorKind::Policy => {
                return self.reject_sequence(event, stage, sequence, &error).await;
            }
            Err(error) => return Err(error),
        };

        let Some(spec) = shipyard.find_sequence(stage, sequence) else {
            let error = Error::ShipyardInvalid {
                project,
                message: format!("shipyard declares no sequence '{sequence}' in stage '{stage}'"),
            };
            return self.reject_sequence(event, stage, sequence, &error).await;
        };

        self.create_and_enqueue(event, stage, spec, &version).await?;
        Ok(())
    }

    /// Creates the execution record and queues it for admission.
    ///
    /// Returns false when an execution already exists for the key (replayed
    /// or duplicate trigger).
    async fn create_and_enqueue(
        &self,
        event: &Event,
        stage: &str,
        spec: &SequenceSpec,
        shipyard_version: &str,
    ) -> Result<bool> {
        let scope = ExecutionScope {
            project: event.data.project.clone(),
            stage: stage.to_string(),
            service: event.data.service.clone(),
            keptn_context: event.shkeptncontext.clone(),
        };
        let execution = SequenceExecution::new(
            scope.clone(),
            event.id,
            spec.clone(),
            shipyard_version,
            event.data.properties.clone(),
            self.clock.now(),
        );

        if !self.execution_store.insert(&execution).await? {
            tracing::debug!(
                keptn_context = %scope.keptn_context,
                stage = %scope.stage,
                "duplicate sequence trigger ignored"
            );
            return Ok(false);
        }

        self.sequence_queue
            .enqueue(SequenceQueueItem {
                event_id: event.id,
                scope,
                sequence_name: spec.name.clone(),
                triggered_at: execution.triggered_at,
            })
            .await?;

        self.metrics.record_transition("triggered");
        self.hooks
            .fan_out(&HookEvent::SequenceTriggered(event.clone()))
            .await;
        Ok(true)
    }

    /// Policy failure at trigger time: record a terminal `errored` execution
    /// and emit `.finished` so downstream logic is not hung.
    async fn reject_sequence(
        &self,
        event: &Event,
        stage: &str,
        sequence: &str,
        cause: &Error,
    ) -> Result<()> {
        tracing::warn!(
            error = %cause,
            project = %event.data.project,
            keptn_context = %event.shkeptncontext,
            "rejecting sequence trigger"
        );

        let scope = ExecutionScope {
            project: event.data.project.clone(),
            stage: stage.to_string(),
            service: event.data.service.clone(),
            keptn_context: event.shkeptncontext.clone(),
        };
        let mut execution = SequenceExecution::new(
            scope.clone(),
            event.id,
            SequenceSpec {
                name: sequence.to_string(),
                triggered_on: Vec::new(),
                tasks: Vec::new(),
            },
            "",
            event.data.properties.clone(),
            self.clock.now(),
        );
        execution.status.state = SequenceState::Errored;

        if !self.execution_store.insert(&execution).await? {
            return Ok(());
        }
        self.metrics.record_transition("errored");

        let finished = self.sequence_finished_event(
            &execution,
            ResultType::Fail,
            StatusType::Errored,
            Some(cause.to_string()),
        );
        self.event_dispatcher
            .add(finished.clone(), scope, self.clock.now())
            .await?;
        self.hooks
            .fan_out(&HookEvent::SequenceFinished(finished))
            .await;
        Ok(())
    }

    // --- task responses ----------------------------------------------------

    async fn on_task_started(&self, event: &Event, task: &str) -> Result<()> {
        let Some(triggered_id) = event.triggeredid else {
            tracing::warn!(event_type = %event.event_type, "started response lacks triggeredid");
            return Ok(());
        };
        let Some(stage) = event.data.stage.clone() else {
            tracing::warn!(event_type = %event.event_type, "started response lacks data.stage");
            return Ok(());
        };

        let applied = self
            .update_execution(&event.data.project, &event.shkeptncontext, &stage, |exec| {
                if exec.is_terminal() {
                    return Ok(Decision::Skip(SkipReason::Terminal));
                }
                let matches_current = exec
                    .status
                    .current_task
                    .as_ref()
                    .is_some_and(|c| c.triggered_id == triggered_id);
                if !matches_current {
                    return Ok(Decision::Skip(SkipReason::Mismatch));
                }
                if !exec.record_started(event.id, &event.source, event.time) {
                    return Ok(Decision::Skip(SkipReason::Duplicate));
                }
                if exec.state() == SequenceState::Paused {
                    exec.status.state_before_pause = Some(SequenceState::Started);
                } else {
                    exec.status.state = SequenceState::Started;
                }
                Ok(Decision::Commit(vec![Effect::FanOut(
                    HookEvent::TaskStarted(event.clone()),
                )]))
            })
            .await;

        self.finish_task_response(applied, event, task, "started").await
    }

    async fn on_task_finished(&self, event: &Event, task: &str) -> Result<()> {
        let Some(triggered_id) = event.triggeredid else {
            tracing::warn!(event_type = %event.event_type, "finished response lacks triggeredid");
            return Ok(());
        };
        let Some(stage) = event.data.stage.clone() else {
            tracing::warn!(event_type = %event.event_type, "finished response lacks data.stage");
            return Ok(());
        };

        let applied = self
            .update_execution(&event.data.project, &event.shkeptncontext, &stage, |exec| {
                if exec.is_terminal() {
                    return Ok(Decision::Skip(SkipReason::Terminal));
                }
                let matches_current = exec
                    .status
                    .current_task
                    .as_ref()
                    .is_some_and(|c| c.triggered_id == triggered_id);
                if !matches_current {
                    return Ok(Decision::Skip(SkipReason::Mismatch));
                }
                let record = FinishedEvent {
                    event_id: event.id,
                    source: event.source.clone(),
                    time: event.time,
                    result: event.data.result.unwrap_or(ResultType::Pass),
                    status: event.data.status.unwrap_or(StatusType::Succeeded),
                    properties: event.data.properties.clone(),
                };
                if !exec.record_finished(record) {
                    return Ok(Decision::Skip(SkipReason::Duplicate));
                }

                let mut effects = vec![Effect::FanOut(HookEvent::TaskFinished(event.clone()))];
                let complete = exec
                    .status
                    .current_task
                    .as_ref()
                    .is_some_and(CurrentTask::is_finished);
                if complete && exec.state() != SequenceState::Paused {
                    effects.extend(self.advance(exec)?);
                }
                Ok(Decision::Commit(effects))
            })
            .await;

        self.finish_task_response(applied, event, task, "finished").await
    }

    /// Common tail of the two task-response handlers: apply effects, count
    /// metrics, map protocol violations to logs.
    async fn finish_task_response(
        &self,
        applied: Result<Applied>,
        event: &Event,
        task: &str,
        phase: &str,
    ) -> Result<()> {
        match applied {
            Ok(Applied::Committed(effects)) => {
                self.metrics.record_task_event(phase);
                self.apply_effects(effects).await;
                Ok(())
            }
            Ok(Applied::Skipped(SkipReason::Terminal)) => {
                self.metrics.record_late_event();
                tracing::warn!(
                    task,
                    keptn_context = %event.shkeptncontext,
                    "discarding {phase} response for terminal sequence"
                );
                Ok(())
            }
            Ok(Applied::Skipped(SkipReason::Mismatch)) => {
                tracing::warn!(
                    task,
                    keptn_context = %event.shkeptncontext,
                    "discarding {phase} response that does not address the current task"
                );
                Ok(())
            }
            Ok(Applied::Skipped(_)) => Ok(()),
            Err(Error::ExecutionNotFound { .. }) => {
                tracing::warn!(
                    task,
                    keptn_context = %event.shkeptncontext,
                    "discarding {phase} response without a matching execution"
                );
                Ok(())
            }
            Err(error @ Error::RevisionConflict { .. }) => {
                tracing::error!(%error, task, "retry budget exhausted, failing sequence");
                self.fail_sequence_errored(
                    &event.data.project,
                    &event.shkeptncontext,
                    event.data.stage.as_deref().unwrap_or_default(),
                    &error.to_string(),
                )
                .await;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    // --- advance -----------------------------------------------------------

    /// Moves past a completed task: aggregate, merge, and either trigger the
    /// next task, or complete the sequence.
    fn advance(&self, exec: &mut SequenceExecution) -> Result<Vec<Effect>> {
        let Some(completed) = exec.complete_current_task() else {
            return Ok(Vec::new());
        };

        let on_error = exec
            .sequence
            .tasks
            .iter()
            .find(|t| t.name == completed.name)
            .map_or(OnError::Abort, |t| t.on_error);
        if completed.result == ResultType::Fail && on_error != OnError::Continue {
            return Ok(self.finish_sequence(exec));
        }

        match exec.next_task_spec().cloned() {
            Some(next) => Ok(self.trigger_task(exec, &next)),
            None => Ok(self.finish_sequence(exec)),
        }
    }

    /// Emits the `.triggered` event for `task` and installs it as the
    /// current task. A `triggeredAfter` delay becomes the event's due time.
    fn trigger_task(&self, exec: &mut SequenceExecution, task: &TaskSpec) -> Vec<Effect> {
        let now = self.clock.now();
        let due = task
            .triggered_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map_or(now, |d| now + d);

        let mut properties = exec.input_properties.clone();
        if let Some(config) = &task.properties {
            properties.insert(task.name.clone(), config.clone());
        }
        let data = EventData {
            project: exec.scope.project.clone(),
            stage: Some(exec.scope.stage.clone()),
            service: exec.scope.service.clone(),
            result: None,
            status: None,
            message: None,
            properties,
        };
        let event = Event::new(
            task_event_type(&task.name, EventPhase::Triggered),
            EVENT_SOURCE,
            exec.scope.keptn_context.clone(),
            now,
            data,
        );

        exec.status.current_task = Some(CurrentTask {
            name: task.name.clone(),
            triggered_id: event.id,
            triggered_at: due,
            started_events: Vec::new(),
            finished_events: Vec::new(),
            properties: event.data.properties.clone(),
        });
        exec.status.state = SequenceState::Triggered;

        vec![
            Effect::Send {
                event: event.clone(),
                scope: exec.scope.clone(),
                due,
            },
            Effect::FanOut(HookEvent::TaskTriggered(event)),
        ]
    }

    /// Completes the sequence with its aggregate result and status.
    fn finish_sequence(&self, exec: &mut SequenceExecution) -> Vec<Effect> {
        exec.status.state = SequenceState::Finished;
        let finished = self.sequence_finished_event(
            exec,
            exec.sequence_result(),
            exec.sequence_status(),
            None,
        );
        vec![
            Effect::Send {
                event: finished.clone(),
                scope: exec.scope.clone(),
                due: self.clock.now(),
            },
            Effect::FanOut(HookEvent::SequenceFinished(finished.clone())),
            Effect::Promote { finished },
            Effect::ClearSequenceQueue {
                keptn_context: exec.scope.keptn_context.clone(),
                stage: exec.scope.stage.clone(),
            },
        ]
    }

    fn sequence_finished_event(
        &self,
        exec: &SequenceExecution,
        result: ResultType,
        status: StatusType,
        message: Option<String>,
    ) -> Event {
        let data = EventData {
            project: exec.scope.project.clone(),
            stage: Some(exec.scope.stage.clone()),
            service: exec.scope.service.clone(),
            result: Some(result),
            status: Some(status),
            message,
            properties: exec.input_properties.clone(),
        };
        Event::new(
            sequence_event_type(&exec.scope.stage, &exec.sequence_name, EventPhase::Finished),
            EVENT_SOURCE,
            exec.scope.keptn_context.clone(),
            self.clock.now(),
            data,
        )
        .with_triggered_id(exec.triggered_id)
    }

    // --- timeout -----------------------------------------------------------

    /// Times a sequence out after the watcher flagged its current task.
    ///
    /// # Errors
    ///
    /// Returns an error for transient store failures.
    pub async fn handle_timeout(&self, timeout: SequenceTimeout) -> Result<()> {
        let scope = timeout.scope.clone();
        let applied = self
            .update_execution(&scope.project, &scope.keptn_context, &scope.stage, |exec| {
                if !matches!(
                    exec.state(),
                    SequenceState::Triggered | SequenceState::Started
                ) {
                    return Ok(Decision::Skip(SkipReason::NotApplicable));
                }
                let matches_current = exec
                    .status
                    .current_task
                    .as_ref()
                    .is_some_and(|c| c.triggered_id == timeout.triggered_id);
                if !matches_current {
                    return Ok(Decision::Skip(SkipReason::Mismatch));
                }

                exec.status.state = SequenceState::TimedOut;
                let finished = self.sequence_finished_event(
                    exec,
                    ResultType::Fail,
                    StatusType::Errored,
                    Some(format!(
                        "task '{}' was not started within the wait duration",
                        timeout.task_name
                    )),
                );
                Ok(Decision::Commit(vec![
                    Effect::Send {
                        event: finished.clone(),
                        scope: exec.scope.clone(),
                        due: self.clock.now(),
                    },
                    Effect::FanOut(HookEvent::SequenceTimedOut(finished.clone())),
                    // a rollback sequence selecting on result=fail still fires
                    Effect::Promote { finished },
                    Effect::ClearSequenceQueue {
                        keptn_context: exec.scope.keptn_context.clone(),
                        stage: exec.scope.stage.clone(),
                    },
                ]))
            })
            .await;

        match applied {
            Ok(Applied::Committed(effects)) => {
                self.metrics.record_transition("timedOut");
                self.apply_effects(effects).await;
                Ok(())
            }
            Ok(Applied::Skipped(_)) | Err(Error::ExecutionNotFound { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    // --- control -----------------------------------------------------------

    /// Applies a pause, resume or abort request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when the execution's state
    /// does not admit the operation, [`Error::ExecutionNotFound`] when the
    /// scope addresses nothing.
    pub async fn control(&self, request: SequenceControlRequest) -> Result<()> {
        let scope = request.scope.clone();
        let applied = match request.op {
            SequenceControlOp::Pause => {
                self.update_execution(
                    &scope.project,
                    &scope.keptn_context,
                    &scope.stage,
                    |exec| {
                        if exec.is_terminal() {
                            return Err(invalid_transition(exec.state(), "paused"));
                        }
                        if exec.state() == SequenceState::Paused {
                            return Ok(Decision::Skip(SkipReason::Duplicate));
                        }
                        exec.status.state_before_pause = Some(exec.state());
                        exec.status.state = SequenceState::Paused;
                        Ok(Decision::Commit(vec![Effect::FanOut(
                            HookEvent::SequencePaused(exec.scope.clone()),
                        )]))
                    },
                )
                .await?
            }
            SequenceControlOp::Resume => {
                self.update_execution(
                    &scope.project,
                    &scope.keptn_context,
                    &scope.stage,
                    |exec| {
                        if exec.state() != SequenceState::Paused {
                            return Err(invalid_transition(exec.state(), "resumed"));
                        }
                        exec.status.state = exec
                            .status
                            .state_before_pause
                            .take()
                            .unwrap_or(SequenceState::Triggered);
                        let mut effects =
                            vec![Effect::FanOut(HookEvent::SequenceResumed(exec.scope.clone()))];
                        // a completed task advance may be pending from the pause window
                        let complete = exec
                            .status
                            .current_task
                            .as_ref()
                            .is_some_and(CurrentTask::is_finished);
                        if complete {
                            effects.extend(self.advance(exec)?);
                        }
                        Ok(Decision::Commit(effects))
                    },
                )
                .await?
            }
            SequenceControlOp::Abort => {
                self.update_execution(
                    &scope.project,
                    &scope.keptn_context,
                    &scope.stage,
                    |exec| {
                        if exec.is_terminal() {
                            return Err(invalid_transition(exec.state(), "aborted"));
                        }
                        exec.status.state = SequenceState::Aborted;
                        exec.status.state_before_pause = None;
                        let finished = self.sequence_finished_event(
                            exec,
                            ResultType::Fail,
                            StatusType::Aborted,
                            Some("sequence aborted".into()),
                        );
                        Ok(Decision::Commit(vec![
                            Effect::Send {
                                event: finished,
                                scope: exec.scope.clone(),
                                due: self.clock.now(),
                            },
                            Effect::FanOut(HookEvent::SequenceAborted(exec.scope.clone())),
                            Effect::ClearSequenceQueue {
                                keptn_context: exec.scope.keptn_context.clone(),
                                stage: exec.scope.stage.clone(),
                            },
                        ]))
                    },
                )
                .await?
            }
        };

        if let Applied::Committed(effects) = applied {
            let state = match request.op {
                SequenceControlOp::Pause => "paused",
                SequenceControlOp::Resume => "resumed",
                SequenceControlOp::Abort => "aborted",
            };
            self.metrics.record_transition(state);
            self.apply_effects(effects).await;
        }
        Ok(())
    }

    // --- CAS loop ----------------------------------------------------------

    /// Reads, mutates and commits an execution with bounded retries.
    ///
    /// `mutate` must be free of side effects; it may run several times.
    async fn update_execution<F>(
        &self,
        project: &str,
        keptn_context: &KeptnContext,
        stage: &str,
        mutate: F,
    ) -> Result<Applied>
    where
        F: Fn(&mut SequenceExecution) -> Result<Decision>,
    {
        for _attempt in 0..self.max_cas_retries {
            let Some(stored) = self
                .execution_store
                .get(project, keptn_context, stage)
                .await?
            else {
                return Err(Error::ExecutionNotFound {
                    project: project.to_string(),
                    keptn_context: keptn_context.to_string(),
                    stage: stage.to_string(),
                });
            };

            let mut candidate = stored;
            match mutate(&mut candidate)? {
                Decision::Skip(reason) => return Ok(Applied::Skipped(reason)),
                Decision::Commit(effects) => {
                    match self.execution_store.compare_and_set(&candidate).await? {
                        crate::store::CasResult::Success { .. } => {
                            return Ok(Applied::Committed(effects));
                        }
                        crate::store::CasResult::NotFound => {
                            return Err(Error::ExecutionNotFound {
                                project: project.to_string(),
                                keptn_context: keptn_context.to_string(),
                                stage: stage.to_string(),
                            });
                        }
                        crate::store::CasResult::RevisionConflict { .. } => {
                            self.metrics.record_cas_conflict();
                        }
                    }
                }
            }
        }
        Err(Error::RevisionConflict {
            retries: self.max_cas_retries,
        })
    }

    /// Last-resort terminal transition after retry exhaustion.
    async fn fail_sequence_errored(
        &self,
        project: &str,
        keptn_context: &KeptnContext,
        stage: &str,
        reason: &str,
    ) {
        let applied = self
            .update_execution(project, keptn_context, stage, |exec| {
                if exec.is_terminal() {
                    return Ok(Decision::Skip(SkipReason::Terminal));
                }
                exec.status.state = SequenceState::Errored;
                let finished = self.sequence_finished_event(
                    exec,
                    ResultType::Fail,
                    StatusType::Errored,
                    Some(reason.to_string()),
                );
                Ok(Decision::Commit(vec![
                    Effect::Send {
                        event: finished.clone(),
                        scope: exec.scope.clone(),
                        due: self.clock.now(),
                    },
                    Effect::FanOut(HookEvent::SequenceFinished(finished)),
                    Effect::ClearSequenceQueue {
                        keptn_context: exec.scope.keptn_context.clone(),
                        stage: exec.scope.stage.clone(),
                    },
                ]))
            })
            .await;

        match applied {
            Ok(Applied::Committed(effects)) => {
                self.metrics.record_transition("errored");
                self.apply_effects(effects).await;
            }
            Ok(Applied::Skipped(_)) => {}
            Err(error) => {
                tracing::error!(%error, project, stage, "could not mark sequence errored");
            }
        }
    }

    // --- effects -----------------------------------------------------------

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { event, scope, due } => {
                    if let Err(error) = self.event_dispatcher.add(event, scope, due).await {
                        tracing::error!(%error, "failed to route outgoing event");
                    }
                }
                Effect::FanOut(hook_event) => self.hooks.fan_out(&hook_event).await,
                Effect::ClearSequenceQueue {
                    keptn_context,
                    stage,
                } => {
                    if let Err(error) = self
                        .sequence_queue
                        .remove_for_context(&keptn_context, Some(&stage))
                        .await
                    {
                        tracing::warn!(%error, "failed to clear sequence queue");
                    }
                }
                Effect::Promote { finished } => self.evaluate_promotion(&finished).await,
            }
        }
    }

    /// Cross-stage promotion: trigger every downstream sequence whose
    /// `triggeredOn` declaration matches the committed `.finished` event.
    ///
    /// The downstream `.triggered` carries the same context and the
    /// upstream's final properties, and is enqueued here, strictly after the
    /// upstream commit.
    async fn evaluate_promotion(&self, finished: &Event) {
        let Ok(EventKind::Sequence {
            stage, sequence, ..
        }) = finished.kind()
        else {
            return;
        };
        let result = finished.data.result.unwrap_or(ResultType::Pass);
        let project = finished.data.project.clone();

        let (shipyard, version) = match self.retriever.get_shipyard(&project).await {
            Ok(resolved) => resolved,
            Err(error) => {
                tracing::warn!(%error, project, "skipping promotion, shipyard unavailable");
                return;
            }
        };

        let suffix = format!("{stage}.{sequence}.finished");
        for (down_stage, down_seq) in shipyard.sequences_triggered_by(&suffix, result) {
            let data = EventData {
                project: project.clone(),
                stage: Some(down_stage.name.clone()),
                service: finished.data.service.clone(),
                result: None,
                status: None,
                message: None,
                properties: finished.data.properties.clone(),
            };
            let derived = Event::new(
                sequence_event_type(&down_stage.name, &down_seq.name, EventPhase::Triggered),
                EVENT_SOURCE,
                finished.shkeptncontext.clone(),
                self.clock.now(),
                data,
            );

            if let Err(error) = self.event_log.append(&derived).await {
                tracing::warn!(%error, "failed to record derived trigger");
                continue;
            }
            match self
                .create_and_enqueue(&derived, &down_stage.name, down_seq, &version)
                .await
            {
                Ok(true) => {
                    let scope = ExecutionScope {
                        project: project.clone(),
                        stage: down_stage.name.clone(),
                        service: derived.data.service.clone(),
                        keptn_context: derived.shkeptncontext.clone(),
                    };
                    // visible to external observers; our own copy dedupes
                    if let Err(error) = self
                        .event_dispatcher
                        .add(derived, scope, self.clock.now())
                        .await
                    {
                        tracing::warn!(%error, "failed to publish derived trigger");
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to enqueue derived sequence");
                }
            }
        }
    }
}

fn invalid_transition(from: SequenceState, to: &str) -> Error {
    Error::InvalidStateTransition {
        from: from.to_string(),
        to: to.to_string(),
        reason: "operation does not apply in this state".to_string(),
    }
}

#[async_trait]
impl SequenceStarter for SequenceEngine {
    async fn start_sequence(&self, item: &SequenceQueueItem) -> Result<StartOutcome> {
        let triggered = self
            .event_log
            .get_by_id(&item.scope.project, item.event_id)
            .await?;
        if triggered.is_none() {
            tracing::warn!(
                keptn_context = %item.scope.keptn_context,
                "queued sequence has no trigger event on record"
            );
        }

        let applied = self
            .update_execution(
                &item.scope.project,
                &item.scope.keptn_context,
                &item.scope.stage,
                |exec| {
                    match exec.state() {
                        SequenceState::Triggered | SequenceState::Waiting
                            if exec.status.current_task.is_none() => {}
                        SequenceState::Paused => {
                            return Ok(Decision::Skip(SkipReason::NotApplicable))
                        }
                        _ => return Ok(Decision::Skip(SkipReason::Terminal)),
                    }

                    let mut effects = Vec::new();
                    if let Some(triggered) = &triggered {
                        effects.push(Effect::FanOut(HookEvent::SequenceStarted(
                            triggered.clone(),
                        )));
                    }
                    match exec.next_task_spec().cloned() {
                        Some(first) => effects.extend(self.trigger_task(exec, &first)),
                        None => effects.extend(self.finish_sequence(exec)),
                    }
                    Ok(Decision::Commit(effects))
                },
            )
            .await;

        match applied {
            Ok(Applied::Committed(effects)) => {
                self.metrics.record_transition("started");
                self.apply_effects(effects).await;
                Ok(StartOutcome::Started)
            }
            // paused sequences stay queued until resumed
            Ok(Applied::Skipped(SkipReason::NotApplicable)) => Ok(StartOutcome::Conflict),
            Ok(Applied::Skipped(_)) => Ok(StartOutcome::Gone),
            Err(Error::ExecutionNotFound { .. }) => Ok(StartOutcome::Gone),
            Err(Error::RevisionConflict { .. }) => Ok(StartOutcome::Conflict),
            Err(error) => Err(error),
        }
    }

    async fn defer_sequence(&self, item: &SequenceQueueItem) -> Result<()> {
        let triggered = self
            .event_log
            .get_by_id(&item.scope.project, item.event_id)
            .await?;

        let applied = self
            .update_execution(
                &item.scope.project,
                &item.scope.keptn_context,
                &item.scope.stage,
                |exec| {
                    if exec.state() == SequenceState::Triggered
                        && exec.status.current_task.is_none()
                    {
                        exec.status.state = SequenceState::Waiting;
                        let effects = triggered
                            .as_ref()
                            .map(|event| {
                                vec![Effect::FanOut(HookEvent::SequenceWaiting(event.clone()))]
                            })
                            .unwrap_or_default();
                        Ok(Decision::Commit(effects))
                    } else {
                        Ok(Decision::Skip(SkipReason::NotApplicable))
                    }
                },
            )
            .await;

        match applied {
            Ok(Applied::Committed(effects)) => {
                self.metrics.record_transition("waiting");
                self.apply_effects(effects).await;
                Ok(())
            }
            Ok(Applied::Skipped(_)) | Err(Error::ExecutionNotFound { .. }) => Ok(()),
            Err(Error::RevisionConflict { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }
}
