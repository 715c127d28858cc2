//! Datasource write notifications
//!
//! The datasource repository publishes one [`WriteEvent`] per write attempt on
//! a [`WriteEventBus`]. Subscribers (the registry cache) react to the outcome
//! without reaching into the repository.

use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

/// Outcome of a write attempt against a datasource record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    Failure,
}

/// A write attempt against a datasource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    /// Create or update; `body` is the serialized record that was written
    Indexed {
        outcome: WriteOutcome,
        id: String,
        body: String,
    },
    /// Deletion of the record keyed by `id`
    Deleted { outcome: WriteOutcome, id: String },
}

impl WriteEvent {
    pub fn indexed(outcome: WriteOutcome, id: impl Into<String>, body: impl Into<String>) -> Self {
        WriteEvent::Indexed {
            outcome,
            id: id.into(),
            body: body.into(),
        }
    }

    pub fn deleted(outcome: WriteOutcome, id: impl Into<String>) -> Self {
        WriteEvent::Deleted {
            outcome,
            id: id.into(),
        }
    }

    /// Record key (datasource name)
    pub fn id(&self) -> &str {
        match self {
            WriteEvent::Indexed { id, .. } | WriteEvent::Deleted { id, .. } => id,
        }
    }

    pub fn outcome(&self) -> WriteOutcome {
        match self {
            WriteEvent::Indexed { outcome, .. } | WriteEvent::Deleted { outcome, .. } => *outcome,
        }
    }
}

/// Receiver of datasource write events
///
/// Called on the thread that performed the write, after the write finished.
pub trait WriteListener: Send + Sync {
    fn on_write(&self, event: &WriteEvent);
}

/// Fan-out of write events to weakly-held listeners
///
/// Listeners that have been dropped are pruned on the next publish.
#[derive(Default)]
pub struct WriteEventBus {
    listeners: RwLock<Vec<Weak<dyn WriteListener>>>,
}

impl WriteEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; the bus does not keep it alive
    pub fn subscribe(&self, listener: Arc<dyn WriteListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.push(Arc::downgrade(&listener));
    }

    /// Deliver `event` to every live listener
    pub fn publish(&self, event: &WriteEvent) {
        let live: Vec<Arc<dyn WriteListener>> = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        debug!(
            id = event.id(),
            outcome = ?event.outcome(),
            listeners = live.len(),
            "Publishing datasource write event"
        );

        for listener in &live {
            listener.on_write(event);
        }

        if live.len() < self.subscriber_count() {
            let mut listeners = self
                .listeners
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.retain(|l| l.strong_count() > 0);
        }
    }

    /// Number of registered listeners, including dropped ones not yet pruned
    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
