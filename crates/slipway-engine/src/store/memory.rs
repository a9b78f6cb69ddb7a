//! In-memory store implementations for tests and single-process deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! Horizontal deployments plug database-backed implementations into the same
//! traits; the compare-and-set contract is identical.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use slipway_core::{EventId, KeptnContext};

use super::{
    CasResult, EventLog, EventQueue, EventQueueItem, Project, ProjectStore, SequenceExecutionStore,
    SequenceQueue, SequenceQueueItem, SequenceStateOverview, SequenceStateStore,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::execution::{SequenceExecution, SequenceState};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

type ExecutionKey = (String, String, String);

/// In-memory [`SequenceExecutionStore`].
#[derive(Debug, Default)]
pub struct InMemorySequenceExecutionStore {
    executions: RwLock<HashMap<ExecutionKey, SequenceExecution>>,
}

impl InMemorySequenceExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(project: &str, keptn_context: &KeptnContext, stage: &str) -> ExecutionKey {
        (
            project.to_string(),
            keptn_context.as_str().to_string(),
            stage.to_string(),
        )
    }

    fn key_of(execution: &SequenceExecution) -> ExecutionKey {
        Self::key(
            &execution.scope.project,
            &execution.scope.keptn_context,
            &execution.scope.stage,
        )
    }
}

#[async_trait]
impl SequenceExecutionStore for InMemorySequenceExecutionStore {
    async fn get(
        &self,
        project: &str,
        keptn_context: &KeptnContext,
        stage: &str,
    ) -> Result<Option<SequenceExecution>> {
        let result = {
            let executions = self.executions.read().map_err(poison_err)?;
            executions.get(&Self::key(project, keptn_context, stage)).cloned()
        };
        Ok(result)
    }

    async fn insert(&self, execution: &SequenceExecution) -> Result<bool> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        let key = Self::key_of(execution);
        if executions.contains_key(&key) {
            return Ok(false);
        }
        executions.insert(key, execution.clone());
        Ok(true)
    }

    async fn compare_and_set(&self, execution: &SequenceExecution) -> Result<CasResult> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        let key = Self::key_of(execution);
        let Some(stored) = executions.get_mut(&key) else {
            return Ok(CasResult::NotFound);
        };
        if stored.revision != execution.revision {
            return Ok(CasResult::RevisionConflict {
                actual: stored.revision,
            });
        }
        let mut updated = execution.clone();
        updated.revision += 1;
        let revision = updated.revision;
        *stored = updated;
        Ok(CasResult::Success { revision })
    }

    async fn find_by_stage(&self, project: &str, stage: &str) -> Result<Vec<SequenceExecution>> {
        let result = {
            let executions = self.executions.read().map_err(poison_err)?;
            executions
                .values()
                .filter(|e| e.scope.project == project && e.scope.stage == stage)
                .cloned()
                .collect()
        };
        Ok(result)
    }

    async fn find_by_state(&self, state: SequenceState) -> Result<Vec<SequenceExecution>> {
        let result = {
            let executions = self.executions.read().map_err(poison_err)?;
            executions
                .values()
                .filter(|e| e.state() == state)
                .cloned()
                .collect()
        };
        Ok(result)
    }
}

/// In-memory append-only [`EventLog`].
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded event, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn all(&self) -> Result<Vec<Event>> {
        let events = self.events.read().map_err(poison_err)?;
        Ok(events.clone())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: &Event) -> Result<()> {
        let mut events = self.events.write().map_err(poison_err)?;
        if events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        events.push(event.clone());
        Ok(())
    }

    async fn get_by_id(&self, project: &str, id: EventId) -> Result<Option<Event>> {
        let result = {
            let events = self.events.read().map_err(poison_err)?;
            events
                .iter()
                .find(|e| e.id == id && e.data.project == project)
                .cloned()
        };
        Ok(result)
    }

    async fn get_by_triggered_id(
        &self,
        project: &str,
        triggered_id: EventId,
    ) -> Result<Vec<Event>> {
        let result = {
            let events = self.events.read().map_err(poison_err)?;
            events
                .iter()
                .filter(|e| e.triggeredid == Some(triggered_id) && e.data.project == project)
                .cloned()
                .collect()
        };
        Ok(result)
    }
}

/// In-memory [`SequenceQueue`].
#[derive(Debug, Default)]
pub struct InMemorySequenceQueue {
    items: RwLock<Vec<SequenceQueueItem>>,
}

impl InMemorySequenceQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceQueue for InMemorySequenceQueue {
    async fn enqueue(&self, item: SequenceQueueItem) -> Result<()> {
        let mut items = self.items.write().map_err(poison_err)?;
        if items.iter().any(|i| i.event_id == item.event_id) {
            return Ok(());
        }
        items.push(item);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<SequenceQueueItem>> {
        let mut result = {
            let items = self.items.read().map_err(poison_err)?;
            items.clone()
        };
        result.sort_by_key(|i| i.triggered_at);
        Ok(result)
    }

    async fn remove(&self, event_id: EventId) -> Result<bool> {
        let mut items = self.items.write().map_err(poison_err)?;
        let before = items.len();
        items.retain(|i| i.event_id != event_id);
        Ok(items.len() < before)
    }

    async fn remove_for_context(
        &self,
        keptn_context: &KeptnContext,
        stage: Option<&str>,
    ) -> Result<usize> {
        let mut items = self.items.write().map_err(poison_err)?;
        let before = items.len();
        items.retain(|i| {
            i.scope.keptn_context != *keptn_context
                || stage.is_some_and(|s| i.scope.stage != s)
        });
        Ok(before - items.len())
    }
}

/// In-memory [`EventQueue`].
#[derive(Debug, Default)]
pub struct InMemoryEventQueue {
    items: RwLock<Vec<EventQueueItem>>,
}

impl InMemoryEventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn enqueue(&self, item: EventQueueItem) -> Result<()> {
        let mut items = self.items.write().map_err(poison_err)?;
        if items.iter().any(|i| i.event.id == item.event.id) {
            return Ok(());
        }
        items.push(item);
        Ok(())
    }

    async fn due_before(&self, now: DateTime<Utc>) -> Result<Vec<EventQueueItem>> {
        let mut result: Vec<EventQueueItem> = {
            let items = self.items.read().map_err(poison_err)?;
            items.iter().filter(|i| i.due_time <= now).cloned().collect()
        };
        result.sort_by_key(|i| i.due_time);
        Ok(result)
    }

    async fn remove(&self, event_id: EventId) -> Result<bool> {
        let mut items = self.items.write().map_err(poison_err)?;
        let before = items.len();
        items.retain(|i| i.event.id != event_id);
        Ok(items.len() < before)
    }

    async fn remove_for_context(
        &self,
        keptn_context: &KeptnContext,
        stage: Option<&str>,
    ) -> Result<usize> {
        let mut items = self.items.write().map_err(poison_err)?;
        let before = items.len();
        items.retain(|i| {
            i.scope.keptn_context != *keptn_context
                || stage.is_some_and(|s| i.scope.stage != s)
        });
        Ok(before - items.len())
    }

    async fn depth(&self) -> Result<usize> {
        let items = self.items.read().map_err(poison_err)?;
        Ok(items.len())
    }
}

/// In-memory [`ProjectStore`].
#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<String, Project>>,
}

impl InMemoryProjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn upsert(&self, project: &Project) -> Result<()> {
        let mut projects = self.projects.write().map_err(poison_err)?;
        projects.insert(project.name.clone(), project.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Project>> {
        let result = {
            let projects = self.projects.read().map_err(poison_err)?;
            projects.get(name).cloned()
        };
        Ok(result)
    }

    async fn all(&self) -> Result<Vec<Project>> {
        let mut result: Vec<Project> = {
            let projects = self.projects.read().map_err(poison_err)?;
            projects.values().cloned().collect()
        };
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut projects = self.projects.write().map_err(poison_err)?;
        Ok(projects.remove(name).is_some())
    }
}

/// In-memory [`SequenceStateStore`].
#[derive(Debug, Default)]
pub struct InMemorySequenceStateStore {
    overviews: RwLock<HashMap<(String, String), SequenceStateOverview>>,
}

impl InMemorySequenceStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceStateStore for InMemorySequenceStateStore {
    async fn upsert(&self, overview: &SequenceStateOverview) -> Result<()> {
        let mut overviews = self.overviews.write().map_err(poison_err)?;
        overviews.insert(
            (
                overview.project.clone(),
                overview.keptn_context.as_str().to_string(),
            ),
            overview.clone(),
        );
        Ok(())
    }

    async fn get(
        &self,
        project: &str,
        keptn_context: &KeptnContext,
    ) -> Result<Option<SequenceStateOverview>> {
        let result = {
            let overviews = self.overviews.read().map_err(poison_err)?;
            overviews
                .get(&(project.to_string(), keptn_context.as_str().to_string()))
                .cloned()
        };
        Ok(result)
    }

    async fn find_by_project(&self, project: &str) -> Result<Vec<SequenceStateOverview>> {
        let mut result: Vec<SequenceStateOverview> = {
            let overviews = self.overviews.read().map_err(poison_err)?;
            overviews
                .values()
                .filter(|o| o.project == project)
                .cloned()
                .collect()
        };
        result.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{task_event_type, EventData, EventPhase};
    use crate::execution::ExecutionScope;
    use crate::shipyard::{OnError, SequenceSpec, TaskSpec};
    use serde_json::Map;

    fn scope(context: &str) -> ExecutionScope {
        ExecutionScope {
            project: "sockshop".into(),
            stage: "dev".into(),
            service: Some("carts".into()),
            keptn_context: KeptnContext::new(context),
        }
    }

    fn execution(context: &str) -> SequenceExecution {
        SequenceExecution::new(
            scope(context),
            EventId::generate(),
            SequenceSpec {
                name: "delivery".into(),
                triggered_on: Vec::new(),
                tasks: vec![TaskSpec {
                    name: "deploy".into(),
                    triggered_after: None,
                    on_error: OnError::Abort,
                    properties: None,
                }],
            },
            "abc123",
            Map::new(),
            Utc::now(),
        )
    }

    fn task_event(context: &str) -> Event {
        Event::new(
            task_event_type("deploy", EventPhase::Triggered),
            "slipway-controller",
            KeptnContext::new(context),
            Utc::now(),
            EventData::new("sockshop").with_stage("dev"),
        )
    }

    #[tokio::test]
    async fn insert_deduplicates_by_key() {
        let store = InMemorySequenceExecutionStore::new();
        let exec = execution("c1");

        assert!(store.insert(&exec).await.unwrap());
        assert!(!store.insert(&exec).await.unwrap());

        let stored = store
            .get("sockshop", &KeptnContext::new("c1"), "dev")
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn compare_and_set_bumps_revision() {
        let store = InMemorySequenceExecutionStore::new();
        let exec = execution("c1");
        store.insert(&exec).await.unwrap();

        let result = store.compare_and_set(&exec).await.unwrap();
        assert_eq!(result, CasResult::Success { revision: 1 });

        let stored = store
            .get("sockshop", &KeptnContext::new("c1"), "dev")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn compare_and_set_detects_conflict() {
        let store = InMemorySequenceExecutionStore::new();
        let exec = execution("c1");
        store.insert(&exec).await.unwrap();

        // first writer wins
        store.compare_and_set(&exec).await.unwrap();

        // second writer still holds revision 0
        let result = store.compare_and_set(&exec).await.unwrap();
        assert_eq!(result, CasResult::RevisionConflict { actual: 1 });
    }

    #[tokio::test]
    async fn compare_and_set_missing_document() {
        let store = InMemorySequenceExecutionStore::new();
        let result = store.compare_and_set(&execution("ghost")).await.unwrap();
        assert_eq!(result, CasResult::NotFound);
    }

    #[tokio::test]
    async fn event_log_deduplicates_by_id() {
        let log = InMemoryEventLog::new();
        let event = task_event("c1");

        log.append(&event).await.unwrap();
        log.append(&event).await.unwrap();
        assert_eq!(log.all().unwrap().len(), 1);

        let found = log.get_by_id("sockshop", event.id).await.unwrap();
        assert_eq!(found, Some(event));
    }

    #[tokio::test]
    async fn event_log_chains_responses() {
        let log = InMemoryEventLog::new();
        let triggered = task_event("c1");
        log.append(&triggered).await.unwrap();

        let started = Event::new(
            task_event_type("deploy", EventPhase::Started),
            "helm-service",
            KeptnContext::new("c1"),
            Utc::now(),
            EventData::new("sockshop").with_stage("dev"),
        )
        .with_triggered_id(triggered.id);
        log.append(&started).await.unwrap();

        let responses = log
            .get_by_triggered_id("sockshop", triggered.id)
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, started.id);
    }

    #[tokio::test]
    async fn sequence_queue_orders_by_trigger_time() {
        let queue = InMemorySequenceQueue::new();
        let now = Utc::now();

        let late = SequenceQueueItem {
            event_id: EventId::generate(),
            scope: scope("c2"),
            sequence_name: "delivery".into(),
            triggered_at: now + chrono::Duration::seconds(1),
        };
        let early = SequenceQueueItem {
            event_id: EventId::generate(),
            scope: scope("c1"),
            sequence_name: "delivery".into(),
            triggered_at: now,
        };

        queue.enqueue(late.clone()).await.unwrap();
        queue.enqueue(early.clone()).await.unwrap();

        let items = queue.all().await.unwrap();
        assert_eq!(items[0].event_id, early.event_id);
        assert_eq!(items[1].event_id, late.event_id);

        assert!(queue.remove(early.event_id).await.unwrap());
        assert!(!queue.remove(early.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn event_queue_due_filtering() {
        let queue = InMemoryEventQueue::new();
        let now = Utc::now();

        let due = EventQueueItem {
            event: task_event("c1"),
            due_time: now - chrono::Duration::seconds(5),
            scope: scope("c1"),
        };
        let future = EventQueueItem {
            event: task_event("c2"),
            due_time: now + chrono::Duration::minutes(10),
            scope: scope("c2"),
        };

        queue.enqueue(due.clone()).await.unwrap();
        queue.enqueue(future).await.unwrap();

        let ready = queue.due_before(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].event.id, due.event.id);
        assert_eq!(queue.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn event_queue_context_cleanup_scoped_to_stage() {
        let queue = InMemoryEventQueue::new();
        let now = Utc::now();

        let mut prod_scope = scope("c1");
        prod_scope.stage = "prod".into();

        queue
            .enqueue(EventQueueItem {
                event: task_event("c1"),
                due_time: now,
                scope: scope("c1"),
            })
            .await
            .unwrap();
        queue
            .enqueue(EventQueueItem {
                event: task_event("c1"),
                due_time: now,
                scope: prod_scope,
            })
            .await
            .unwrap();

        let removed = queue
            .remove_for_context(&KeptnContext::new("c1"), Some("dev"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn project_store_crud() {
        let store = InMemoryProjectStore::new();
        let project = Project {
            name: "sockshop".into(),
            git_credentials_ref: Some("git-credentials-sockshop".into()),
            default_branch: "main".into(),
            stages: vec!["dev".into(), "prod".into()],
        };

        store.upsert(&project).await.unwrap();
        assert_eq!(store.get("sockshop").await.unwrap(), Some(project));
        assert_eq!(store.all().await.unwrap().len(), 1);
        assert!(store.delete("sockshop").await.unwrap());
        assert!(!store.delete("sockshop").await.unwrap());
    }
}
