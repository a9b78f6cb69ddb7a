//! Slipway control-plane service.
//!
//! Wires the sequence engine, dispatchers, watcher and hook fan-out over the
//! in-process implementations of the store and bus seams, subscribes to the
//! delivery bus, and serves the operations endpoints. Database- and
//! NATS-backed implementations of the same seams plug in for horizontally
//! scaled deployments; a Kubernetes lease elector feeds the leadership
//! channel there.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

use slipway_core::{init_logging, LogFormat};
use slipway_engine::bus::memory::InMemoryBus;
use slipway_engine::bus::EventBus;
use slipway_engine::clock::SystemClock;
use slipway_engine::config::EnvConfig;
use slipway_engine::dispatch::event::EventDispatcher;
use slipway_engine::dispatch::sequence::SequenceDispatcher;
use slipway_engine::dispatch::DispatchMode;
use slipway_engine::engine::SequenceEngine;
use slipway_engine::hooks::{HookRegistry, SequenceStateMaterializedView, TransitionKind};
use slipway_engine::leader::{standalone_leadership, LeaderGate};
use slipway_engine::retriever::{InMemoryConfigurationStore, ShipyardRetriever};
use slipway_engine::store::memory::{
    InMemoryEventLog, InMemoryEventQueue, InMemoryProjectStore, InMemorySequenceExecutionStore,
    InMemorySequenceQueue, InMemorySequenceStateStore,
};
use slipway_engine::watcher::SequenceWatcher;
use slipway_engine::event::ALL_EVENTS_PATTERN;

const OPERATIONS_ADDR: &str = "0.0.0.0:8081";
const METRICS_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9090);
const SUBSCRIPTION_GROUP: &str = "slipway-controller";

#[derive(Clone)]
struct OperationsState {
    cancel: CancellationToken,
    pre_stop_hold: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EnvConfig::from_env();
    init_logging(LogFormat::Json, &config.log_level);

    if let Err(error) = PrometheusBuilder::new()
        .with_http_listener(METRICS_ADDR)
        .install()
    {
        tracing::warn!(%error, "metrics exporter unavailable");
    }

    tracing::info!(
        nats_url = %config.nats_url,
        configuration_service = %config.configuration_service,
        "starting slipway controller"
    );

    let cancel = CancellationToken::new();
    let clock = Arc::new(SystemClock);

    let bus = Arc::new(InMemoryBus::new());
    let event_log = Arc::new(InMemoryEventLog::new());
    let event_queue = Arc::new(InMemoryEventQueue::new());
    let sequence_queue = Arc::new(InMemorySequenceQueue::new());
    let execution_store = Arc::new(InMemorySequenceExecutionStore::new());
    let state_store = Arc::new(InMemorySequenceStateStore::new());
    let project_store = Arc::new(InMemoryProjectStore::new());
    let configuration_store = Arc::new(InMemoryConfigurationStore::new());

    let event_dispatcher = Arc::new(EventDispatcher::new(
        event_log.clone(),
        event_queue,
        bus.clone(),
        clock.clone(),
        config.event_dispatch_interval,
        DispatchMode::ReadOnly,
    ));

    let mut hooks = HookRegistry::new();
    let view = Arc::new(SequenceStateMaterializedView::new(
        state_store,
        clock.clone(),
    ));
    hooks.register_all(view);
    for kind in [
        TransitionKind::SequenceFinished,
        TransitionKind::SequenceTimedOut,
        TransitionKind::SequenceAborted,
    ] {
        hooks.register(kind, event_dispatcher.clone());
    }

    let engine = Arc::new(SequenceEngine::new(
        execution_store.clone(),
        event_log,
        sequence_queue.clone(),
        event_dispatcher.clone(),
        Arc::new(ShipyardRetriever::new(configuration_store)),
        Arc::new(hooks),
        clock.clone(),
    ));

    let sequence_dispatcher = Arc::new(SequenceDispatcher::new(
        sequence_queue,
        execution_store.clone(),
        engine.clone(),
        config.sequence_dispatch_interval,
        DispatchMode::ReadOnly,
    ));

    let (timeout_tx, timeout_rx) = tokio::sync::mpsc::channel(64);
    let watcher = Arc::new(SequenceWatcher::new(
        execution_store,
        project_store,
        timeout_tx,
        config.task_started_wait_duration,
        config.sequence_watcher_interval,
        clock,
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        engine.clone().run_timeout_loop(timeout_rx, cancel.clone()),
    ));
    tasks.push(tokio::spawn(watcher.run(cancel.clone())));
    tasks.push(tokio::spawn(
        sequence_dispatcher.clone().run(cancel.clone()),
    ));
    tasks.push(tokio::spawn(event_dispatcher.clone().run(cancel.clone())));

    // A Kubernetes lease elector feeds this channel in multi-replica
    // deployments; the single-process deployment holds leadership from the
    // start.
    if !config.disable_leader_election {
        tracing::info!("no election backend configured, holding leadership as a single replica");
    }
    let (_leadership_tx, leadership_rx) = standalone_leadership();
    let gate = LeaderGate::new(sequence_dispatcher, event_dispatcher);
    tasks.push(tokio::spawn(gate.run(leadership_rx, cancel.clone())));

    let mut subscription = bus.subscribe(ALL_EVENTS_PATTERN, SUBSCRIPTION_GROUP).await?;
    {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.next() => {
                        let Some(event) = event else { break };
                        if let Err(error) = engine.handle_event(event).await {
                            tracing::warn!(%error, "event handling failed");
                        }
                    }
                }
            }
        }));
    }

    serve_operations(cancel.clone(), config.pre_stop_hook_time).await?;

    tracing::info!("shutting down");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("controller exited");
    Ok(())
}

/// Serves `/health` and the pre-stop hook until interrupted.
///
/// The pre-stop endpoint cancels every periodic task, holds the request for
/// the configured time so no iteration starts right before pod termination,
/// and then answers 200.
async fn serve_operations(cancel: CancellationToken, pre_stop_hold: Duration) -> anyhow::Result<()> {
    let state = OperationsState {
        cancel: cancel.clone(),
        pre_stop_hold,
    };
    let router = Router::new()
        .route("/health", get(health))
        .route("/operations/v1/pre-stop", get(pre_stop))
        .with_state(state);

    let addr: SocketAddr = OPERATIONS_ADDR.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "operations endpoints up");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        () = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
            cancel.cancel();
        }
    }
    // bounded drain for in-flight requests
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn pre_stop(State(state): State<OperationsState>) -> StatusCode {
    tracing::debug!("pre-stop hook called, cancelling periodic tasks");
    state.cancel.cancel();
    tokio::time::sleep(state.pre_stop_hold).await;
    tracing::debug!("pre-stop hook finished");
    StatusCode::OK
}
