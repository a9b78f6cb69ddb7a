//! Cross-stage promotion tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use slipway_core::{EventId, KeptnContext};
use slipway_engine::bus::memory::InMemoryBus;
use slipway_engine::clock::SimulatedClock;
use slipway_engine::dispatch::event::EventDispatcher;
use slipway_engine::dispatch::sequence::SequenceDispatcher;
use slipway_engine::dispatch::DispatchMode;
use slipway_engine::store::{SequenceExecutionStore, SequenceQueue};
use slipway_engine::engine::SequenceEngine;
use slipway_engine::event::{
    sequence_event_type, task_event_type, Event, EventData, EventPhase, ResultType, StatusType,
};
use slipway_engine::hooks::HookRegistry;
use slipway_engine::retriever::{InMemoryConfigurationStore, ShipyardRetriever};
use slipway_engine::store::memory::{
    InMemoryEventLog, InMemoryEventQueue, InMemorySequenceExecutionStore, InMemorySequenceQueue,
};

const PROJECT: &str = "sockshop";

/// prod.delivery follows dev.delivery on pass; remediation.rollback picks
/// up dev.delivery failures. One context visits each stage at most once, so
/// the failure path promotes into its own stage.
const SHIPYARD: &str = r"
apiVersion: spec.keptn.sh/0.2.3
kind: Shipyard
metadata:
  name: shipyard-sockshop
spec:
  stages:
    - name: dev
      sequences:
        - name: delivery
          tasks:
            - name: deploy
    - name: remediation
      sequences:
        - name: rollback
          triggeredOn:
            - event: dev.delivery.finished
              selector:
                match:
                  result: fail
          tasks:
            - name: rollback
    - name: prod
      sequences:
        - name: delivery
          triggeredOn:
            - event: dev.delivery.finished
          tasks:
            - name: deploy
";

struct Harness {
    engine: Arc<SequenceEngine>,
    sequence_dispatcher: SequenceDispatcher,
    execution_store: Arc<InMemorySequenceExecutionStore>,
    sequence_queue: Arc<InMemorySequenceQueue>,
    event_log: Arc<InMemoryEventLog>,
}

fn harness() -> Harness {
    let clock = Arc::new(SimulatedClock::deterministic());
    let event_log = Arc::new(InMemoryEventLog::new());
    let sequence_queue = Arc::new(InMemorySequenceQueue::new());
    let execution_store = Arc::new(InMemorySequenceExecutionStore::new());

    let configuration_store = Arc::new(InMemoryConfigurationStore::new());
    configuration_store
        .put_shipyard(PROJECT, SHIPYARD, "abc123")
        .unwrap();

    let event_dispatcher = Arc::new(EventDispatcher::new(
        event_log.clone(),
        Arc::new(InMemoryEventQueue::new()),
        Arc::new(InMemoryBus::new()),
        clock.clone(),
        Duration::from_secs(10),
        DispatchMode::ReadWrite,
    ));

    let engine = Arc::new(SequenceEngine::new(
        execution_store.clone(),
        event_log.clone(),
        sequence_queue.clone(),
        event_dispatcher,
        Arc::new(ShipyardRetriever::new(configuration_store)),
        Arc::new(HookRegistry::new()),
        clock,
    ));

    let sequence_dispatcher = SequenceDispatcher::new(
        sequence_queue.clone(),
        execution_store.clone(),
        engine.clone(),
        Duration::from_secs(10),
        DispatchMode::ReadWrite,
    );

    Harness {
        engine,
        sequence_dispatcher,
        execution_store,
        sequence_queue,
        event_log,
    }
}

fn dev_delivery_triggered(context: &str) -> Event {
    Event::new(
        sequence_event_type("dev", "delivery", EventPhase::Triggered),
        "api-gateway",
        KeptnContext::new(context),
        chrono::Utc::now(),
        EventData::new(PROJECT)
            .with_stage("dev")
            .with_service("carts")
            .with_properties(json!({"image": "v1"}).as_object().cloned().unwrap()),
    )
}

fn deploy_finished(context: &str, triggered_id: EventId, result: ResultType) -> Event {
    Event::new(
        task_event_type("deploy", EventPhase::Finished),
        "helm-service",
        KeptnContext::new(context),
        chrono::Utc::now(),
        EventData::new(PROJECT)
            .with_stage("dev")
            .with_result(result)
            .with_status(StatusType::Succeeded),
    )
    .with_triggered_id(triggered_id)
}

async fn run_dev_delivery(h: &Harness, context: &str, result: ResultType) {
    h.engine
        .handle_event(dev_delivery_triggered(context))
        .await
        .unwrap();
    h.sequence_dispatcher.tick().await.unwrap();

    let triggered_id = h
        .execution_store
        .get(PROJECT, &KeptnContext::new(context), "dev")
        .await
        .unwrap()
        .unwrap()
        .status
        .current_task
        .unwrap()
        .triggered_id;
    h.engine
        .handle_event(deploy_finished(context, triggered_id, result))
        .await
        .unwrap();
}

/// S3: after dev.delivery passes, prod.delivery is triggered with the same
/// context and the upstream's final properties.
#[tokio::test]
async fn pass_promotes_to_prod() {
    let h = harness();
    run_dev_delivery(&h, "c1", ResultType::Pass).await;

    // the derived trigger entered the sequence queue after the upstream
    // finished committed
    let queued = h.sequence_queue.all().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].scope.stage, "prod");
    assert_eq!(queued[0].scope.keptn_context, KeptnContext::new("c1"));

    let prod = h
        .execution_store
        .get(PROJECT, &KeptnContext::new("c1"), "prod")
        .await
        .unwrap()
        .expect("prod execution created");
    assert_eq!(prod.sequence_name, "delivery");
    assert_eq!(prod.input_properties["image"], json!("v1"));

    // the derived event is on record and carries the context forward
    let derived = h
        .event_log
        .all()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "sh.keptn.event.prod.delivery.triggered")
        .expect("derived trigger recorded");
    assert_eq!(derived.shkeptncontext, KeptnContext::new("c1"));
    assert_eq!(derived.data.properties["image"], json!("v1"));

    // no rollback on pass
    assert!(h
        .execution_store
        .get(PROJECT, &KeptnContext::new("c1"), "dev")
        .await
        .unwrap()
        .is_some());
    assert!(!h
        .event_log
        .all()
        .unwrap()
        .iter()
        .any(|e| e.event_type.contains("rollback")));
}

/// The fail selector routes failures to the rollback sequence instead of
/// promoting them.
#[tokio::test]
async fn fail_triggers_rollback_not_promotion() {
    let h = harness();
    run_dev_delivery(&h, "c1", ResultType::Fail).await;

    let queued = h.sequence_queue.all().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].sequence_name, "rollback");
    assert_eq!(queued[0].scope.stage, "remediation");

    assert!(h
        .execution_store
        .get(PROJECT, &KeptnContext::new("c1"), "prod")
        .await
        .unwrap()
        .is_none());
}

/// The downstream sequence is admitted like any other and runs in its own
/// stage while the upstream stays terminal.
#[tokio::test]
async fn promoted_sequence_is_dispatchable() {
    let h = harness();
    run_dev_delivery(&h, "c1", ResultType::Pass).await;

    h.sequence_dispatcher.tick().await.unwrap();

    let prod = h
        .execution_store
        .get(PROJECT, &KeptnContext::new("c1"), "prod")
        .await
        .unwrap()
        .unwrap();
    let task = prod.status.current_task.expect("prod deploy in flight");
    assert_eq!(task.name, "deploy");

    // the prod deploy trigger carries the promoted payload
    let trigger = h
        .event_log
        .all()
        .unwrap()
        .into_iter()
        .find(|e| e.id == task.triggered_id)
        .unwrap();
    assert_eq!(trigger.data.stage.as_deref(), Some("prod"));
    assert_eq!(trigger.data.properties["image"], json!("v1"));
}

/// A replayed derived trigger does not create a second prod execution.
#[tokio::test]
async fn promotion_is_idempotent_under_replay() {
    let h = harness();
    run_dev_delivery(&h, "c1", ResultType::Pass).await;

    let derived = h
        .event_log
        .all()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "sh.keptn.event.prod.delivery.triggered")
        .unwrap();
    // the bus redelivers our own emission
    h.engine.handle_event(derived).await.unwrap();

    assert_eq!(h.sequence_queue.all().await.unwrap().len(), 1);
}
