//! # slipway-engine
//!
//! Sequence execution engine for the Slipway delivery-pipeline control
//! plane.
//!
//! Users declare pipelines ("shipyards") of stages, each containing task
//! sequences; external executors perform the tasks and report progress as
//! events on a message bus. This crate is the control plane core that turns
//! incoming trigger events into a deterministic stream of task `.triggered`
//! events, tracks their lifecycles, enforces ordering and concurrency
//! invariants across stages, times tasks out, and keeps a materialized view
//! for inspection.
//!
//! ## Components
//!
//! - [`engine::SequenceEngine`]: the state machine owning every sequence
//!   execution
//! - [`dispatch::sequence::SequenceDispatcher`]: admits queued sequences,
//!   one per `(project, stage)` at a time
//! - [`dispatch::event::EventDispatcher`]: publishes time-delayed events
//! - [`watcher::SequenceWatcher`]: times out tasks no executor picked up
//! - [`hooks::HookRegistry`]: post-commit observer fan-out
//! - [`leader::LeaderGate`]: toggles dispatchers on leadership changes
//!
//! ## Guarantees
//!
//! - Per `(project, context, stage)`: state transitions serialize through
//!   compare-and-set on the execution document
//! - Per `(project, stage)`: at most one sequence occupies the stage;
//!   admission is FIFO by trigger time
//! - Across stages of one context: a downstream sequence is enqueued only
//!   after the upstream `.finished` commits
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use slipway_engine::bus::memory::InMemoryBus;
//! use slipway_engine::clock::SystemClock;
//! use slipway_engine::dispatch::event::EventDispatcher;
//! use slipway_engine::dispatch::DispatchMode;
//! use slipway_engine::engine::SequenceEngine;
//! use slipway_engine::hooks::HookRegistry;
//! use slipway_engine::retriever::{InMemoryConfigurationStore, ShipyardRetriever};
//! use slipway_engine::store::memory::{
//!     InMemoryEventLog, InMemoryEventQueue, InMemorySequenceExecutionStore,
//!     InMemorySequenceQueue,
//! };
//!
//! let clock = Arc::new(SystemClock);
//! let event_log = Arc::new(InMemoryEventLog::new());
//! let event_dispatcher = Arc::new(EventDispatcher::new(
//!     event_log.clone(),
//!     Arc::new(InMemoryEventQueue::new()),
//!     Arc::new(InMemoryBus::new()),
//!     clock.clone(),
//!     Duration::from_secs(10),
//!     DispatchMode::ReadWrite,
//! ));
//! let engine = SequenceEngine::new(
//!     Arc::new(InMemorySequenceExecutionStore::new()),
//!     event_log,
//!     Arc::new(InMemorySequenceQueue::new()),
//!     event_dispatcher,
//!     Arc::new(ShipyardRetriever::new(Arc::new(InMemoryConfigurationStore::new()))),
//!     Arc::new(HookRegistry::new()),
//!     clock,
//! );
//! # let _ = engine;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod execution;
pub mod hooks;
pub mod leader;
pub mod metrics;
pub mod retriever;
pub mod shipyard;
pub mod store;
pub mod watcher;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{BusSubscription, EventBus};
    pub use crate::clock::{Clock, SimulatedClock, SystemClock};
    pub use crate::config::EnvConfig;
    pub use crate::dispatch::event::EventDispatcher;
    pub use crate::dispatch::sequence::{SequenceDispatcher, SequenceStarter, StartOutcome};
    pub use crate::dispatch::DispatchMode;
    pub use crate::engine::{
        SequenceControlOp, SequenceControlRequest, SequenceEngine, EVENT_SOURCE,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::event::{
        sequence_event_type, task_event_type, Event, EventData, EventKind, EventPhase, ResultType,
        StatusType, ALL_EVENTS_PATTERN,
    };
    pub use crate::execution::{ExecutionScope, SequenceExecution, SequenceState};
    pub use crate::hooks::{HookRegistry, SequenceHook, TransitionKind};
    pub use crate::leader::{standalone_leadership, LeaderGate, LeadershipSignal};
    pub use crate::retriever::{ConfigurationStore, ShipyardRetriever};
    pub use crate::shipyard::Shipyard;
    pub use crate::store::{CasResult, SequenceExecutionStore};
    pub use crate::watcher::{SequenceTimeout, SequenceWatcher};
}
