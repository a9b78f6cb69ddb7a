//! Leader-election gate for the dispatchers.
//!
//! Leader election itself is an external primitive (Kubernetes leases in the
//! reference deployment); the engine only consumes a stream of
//! [`LeadershipSignal`]s. On `Acquired` the gate switches both dispatchers to
//! `ReadWrite`; on `Lost` it switches them to `ReadOnly`. Only one replica
//! dispatches at a time; followers keep serving reads and recording task
//! responses.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::event::EventDispatcher;
use crate::dispatch::sequence::SequenceDispatcher;
use crate::dispatch::DispatchMode;
use crate::error::Result;

/// A leadership change observed by this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipSignal {
    /// This replica now holds leadership.
    Acquired,
    /// This replica lost leadership.
    Lost,
}

/// Toggles the dispatchers between leader and follower mode.
pub struct LeaderGate {
    sequence_dispatcher: Arc<SequenceDispatcher>,
    event_dispatcher: Arc<EventDispatcher>,
}

impl LeaderGate {
    /// Creates the gate over the two dispatchers.
    #[must_use]
    pub fn new(
        sequence_dispatcher: Arc<SequenceDispatcher>,
        event_dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            sequence_dispatcher,
            event_dispatcher,
        }
    }

    /// Switches both dispatchers to `ReadWrite`.
    ///
    /// # Errors
    ///
    /// Returns an error if a dispatcher mode lock is poisoned.
    pub fn start_dispatchers(&self) -> Result<()> {
        tracing::info!("leadership acquired, dispatchers read-write");
        self.sequence_dispatcher.set_mode(DispatchMode::ReadWrite)?;
        self.event_dispatcher.set_mode(DispatchMode::ReadWrite)?;
        Ok(())
    }

    /// Switches both dispatchers to `ReadOnly`.
    ///
    /// # Errors
    ///
    /// Returns an error if a dispatcher mode lock is poisoned.
    pub fn stop_dispatchers(&self) -> Result<()> {
        tracing::info!("leadership lost, dispatchers read-only");
        self.sequence_dispatcher.set_mode(DispatchMode::ReadOnly)?;
        self.event_dispatcher.set_mode(DispatchMode::ReadOnly)?;
        Ok(())
    }

    /// Consumes leadership signals until the stream closes or the gate is
    /// cancelled.
    pub async fn run(
        self,
        mut signals: mpsc::Receiver<LeadershipSignal>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    let result = match signal {
                        LeadershipSignal::Acquired => self.start_dispatchers(),
                        LeadershipSignal::Lost => self.stop_dispatchers(),
                    };
                    if let Err(error) = result {
                        tracing::error!(%error, "failed to apply leadership change");
                    }
                }
            }
        }
        tracing::debug!("leader gate stopped");
    }
}

/// Signal source for deployments with leader election disabled: leadership
/// is held immediately and never lost. The sender must be kept alive for the
/// lifetime of the process.
///
/// # Panics
///
/// Never panics; the channel has capacity for the initial signal.
#[must_use]
pub fn standalone_leadership() -> (
    mpsc::Sender<LeadershipSignal>,
    mpsc::Receiver<LeadershipSignal>,
) {
    let (tx, rx) = mpsc::channel(4);
    tx.try_send(LeadershipSignal::Acquired)
        .expect("fresh channel has capacity");
    (tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBus;
    use crate::clock::SimulatedClock;
    use crate::store::memory::{
        InMemoryEventLog, InMemoryEventQueue, InMemorySequenceExecutionStore,
        InMemorySequenceQueue,
    };
    use crate::store::SequenceQueueItem;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopStarter;

    #[async_trait]
    impl crate::dispatch::sequence::SequenceStarter for NoopStarter {
        async fn start_sequence(
            &self,
            _item: &SequenceQueueItem,
        ) -> Result<crate::dispatch::sequence::StartOutcome> {
            Ok(crate::dispatch::sequence::StartOutcome::Started)
        }

        async fn defer_sequence(&self, _item: &SequenceQueueItem) -> Result<()> {
            Ok(())
        }
    }

    fn gate() -> (LeaderGate, Arc<SequenceDispatcher>, Arc<EventDispatcher>) {
        let clock = Arc::new(SimulatedClock::deterministic());
        let sequence_dispatcher = Arc::new(SequenceDispatcher::new(
            Arc::new(InMemorySequenceQueue::new()),
            Arc::new(InMemorySequenceExecutionStore::new()),
            Arc::new(NoopStarter),
            Duration::from_secs(10),
            DispatchMode::ReadOnly,
        ));
        let event_dispatcher = Arc::new(EventDispatcher::new(
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryEventQueue::new()),
            Arc::new(InMemoryBus::new()),
            clock,
            Duration::from_secs(10),
            DispatchMode::ReadOnly,
        ));
        (
            LeaderGate::new(sequence_dispatcher.clone(), event_dispatcher.clone()),
            sequence_dispatcher,
            event_dispatcher,
        )
    }

    #[tokio::test]
    async fn gate_toggles_both_dispatchers() {
        let (gate, sequence_dispatcher, event_dispatcher) = gate();

        gate.start_dispatchers().unwrap();
        assert_eq!(sequence_dispatcher.mode().unwrap(), DispatchMode::ReadWrite);
        assert_eq!(event_dispatcher.mode().unwrap(), DispatchMode::ReadWrite);

        gate.stop_dispatchers().unwrap();
        assert_eq!(sequence_dispatcher.mode().unwrap(), DispatchMode::ReadOnly);
        assert_eq!(event_dispatcher.mode().unwrap(), DispatchMode::ReadOnly);
    }

    #[tokio::test]
    async fn run_consumes_signals() {
        let (gate, sequence_dispatcher, _event_dispatcher) = gate();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(gate.run(rx, cancel.clone()));
        tx.send(LeadershipSignal::Acquired).await.unwrap();
        tokio::task::yield_now().await;

        // poll until the gate has applied the signal
        for _ in 0..50 {
            if sequence_dispatcher.mode().unwrap() == DispatchMode::ReadWrite {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(sequence_dispatcher.mode().unwrap(), DispatchMode::ReadWrite);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn standalone_leadership_is_immediately_acquired() {
        let (_tx, mut rx) = standalone_leadership();
        assert_eq!(rx.recv().await, Some(LeadershipSignal::Acquired));
    }
}
