//! Detects sequences whose current task was never picked up.
//!
//! Executors answer a task `.triggered` with a `.started` response. When no
//! response arrives within the configured wait duration, the sequence is
//! timed out: the watcher pushes a [`SequenceTimeout`] onto the timeout
//! channel, which the state machine drains (see
//! [`crate::engine::SequenceEngine::run_timeout_loop`]).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use slipway_core::EventId;

use crate::clock::Clock;
use crate::error::Result;
use crate::execution::{ExecutionScope, SequenceState};
use crate::store::{ProjectStore, SequenceExecutionStore};

/// A timeout signal for one sequence execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceTimeout {
    /// The execution that timed out.
    pub scope: ExecutionScope,
    /// The task that was never started.
    pub task_name: String,
    /// The `.triggered` event id the timeout refers to; stale signals are
    /// ignored when the execution moved on in the meantime.
    pub triggered_id: EventId,
}

/// Periodic scan for overdue `started` responses.
pub struct SequenceWatcher {
    execution_store: Arc<dyn SequenceExecutionStore>,
    project_store: Arc<dyn ProjectStore>,
    timeout_tx: mpsc::Sender<SequenceTimeout>,
    task_started_wait: chrono::Duration,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl SequenceWatcher {
    /// Creates a watcher.
    ///
    /// `task_started_wait` is how long a task `.triggered` may stay
    /// unanswered before the sequence times out.
    #[must_use]
    pub fn new(
        execution_store: Arc<dyn SequenceExecutionStore>,
        project_store: Arc<dyn ProjectStore>,
        timeout_tx: mpsc::Sender<SequenceTimeout>,
        task_started_wait: Duration,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            execution_store,
            project_store,
            timeout_tx,
            task_started_wait: chrono::Duration::from_std(task_started_wait)
                .unwrap_or(chrono::Duration::MAX),
            interval,
            clock,
        }
    }

    /// Scans open executions and signals a timeout for every task past its
    /// started deadline.
    ///
    /// Executions whose project has been deleted are orphans and are
    /// skipped rather than timed out.
    ///
    /// # Errors
    ///
    /// Returns an error when a store is unreachable.
    pub async fn tick(&self) -> Result<()> {
        let now = self.clock.now();
        let projects: HashSet<String> = self
            .project_store
            .all()
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();
        let open = self
            .execution_store
            .find_by_state(SequenceState::Triggered)
            .await?;

        for execution in open {
            if !projects.contains(&execution.scope.project) {
                tracing::debug!(
                    project = %execution.scope.project,
                    keptn_context = %execution.scope.keptn_context,
                    "skipping execution of deleted project"
                );
                continue;
            }
            let Some(task) = &execution.status.current_task else {
                continue;
            };
            if !task.started_events.is_empty() {
                continue;
            }
            // overdue once now - triggered_at >= wait
            if task.triggered_at + self.task_started_wait > now {
                continue;
            }
            tracing::warn!(
                project = %execution.scope.project,
                keptn_context = %execution.scope.keptn_context,
                stage = %execution.scope.stage,
                task = %task.name,
                "no started response within deadline, signalling timeout"
            );
            let timeout = SequenceTimeout {
                scope: execution.scope.clone(),
                task_name: task.name.clone(),
                triggered_id: task.triggered_id,
            };
            if self.timeout_tx.send(timeout).await.is_err() {
                tracing::warn!("timeout channel closed, stopping scan");
                break;
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
                        tracing::warn!(%error, "sequence watcher tick failed");
                    }
                }
            }
        }
        tracing::debug!("sequence watcher stopped");
    }
}
