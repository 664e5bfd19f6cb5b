//! Fan-out of engine progress events to any number of watchers.
//!
//! A host hands the engine an [`EventBus`] as its [`ProgressEmitter`] and
//! gives each UI stream or audit sink its own receiver. The engine never
//! waits on watchers: a slow receiver lags and loses the oldest events, and a
//! run with nobody watching emits into the void.

use opsflow_types::event::EngineEvent;
use tokio::sync::broadcast;

use crate::workflow::handler::ProgressEmitter;

/// Broadcast channel of [`EngineEvent`]s. Clones publish into the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// `capacity` is how many events a watcher may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Watch every event published from now on, across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Deliver `event` to current watchers and return how many received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        match self.tx.send(event) {
            Ok(watchers) => watchers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(run_id = %event.run_id(), "no progress watchers, event dropped");
                0
            }
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

impl ProgressEmitter for EventBus {
    fn emit(&self, event: EngineEvent) {
        self.publish(event);
    }
}
