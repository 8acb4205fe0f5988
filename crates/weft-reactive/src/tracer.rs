//! Diagnostic hook invoked on every pull, receive, and path registration.
//!
//! Tracing is best-effort: the hook runs inline on the unit's turn and must
//! not block.

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use tracing::trace;

use crate::Identifier;

/// Receives dataflow events from a subgraph.
pub trait Tracer: Send + Sync {
    fn pull(&self, subscriber: Identifier, publisher: Identifier);

    fn receive(&self, publisher: Identifier, subscriber: Identifier, packet: &dyn Debug);

    fn register_path(&self, subscriber: Identifier, publisher: Identifier);
}

/// Writes every event as a `trace`-level log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTracer;

impl Tracer for LoggingTracer {
    fn pull(&self, subscriber: Identifier, publisher: Identifier) {
        trace!(%subscriber, %publisher, "pull");
    }

    fn receive(&self, publisher: Identifier, subscriber: Identifier, packet: &dyn Debug) {
        trace!(%publisher, %subscriber, ?packet, "receive");
    }

    fn register_path(&self, subscriber: Identifier, publisher: Identifier) {
        trace!(%subscriber, %publisher, "register path");
    }
}

/// A recorded dataflow event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Pull {
        subscriber: Identifier,
        publisher: Identifier,
    },
    Receive {
        publisher: Identifier,
        subscriber: Identifier,
        packet: String,
    },
    RegisterPath {
        subscriber: Identifier,
        publisher: Identifier,
    },
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl Tracer for RecordingTracer {
    fn pull(&self, subscriber: Identifier, publisher: Identifier) {
        self.record(TraceEvent::Pull {
            subscriber,
            publisher,
        });
    }

    fn receive(&self, publisher: Identifier, subscriber: Identifier, packet: &dyn Debug) {
        self.record(TraceEvent::Receive {
            publisher,
            subscriber,
            packet: format!("{packet:?}"),
        });
    }

    fn register_path(&self, subscriber: Identifier, publisher: Identifier) {
        self.record(TraceEvent::RegisterPath {
            subscriber,
            publisher,
        });
    }
}
