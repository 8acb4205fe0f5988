//! Error types for the engine.

use thiserror::Error;
use weft_monitor::MonitorError;
use weft_reactive::ReactiveError;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A unit of the query failed.
    #[error(transparent)]
    Reactive(#[from] ReactiveError),

    /// The termination monitor rejected a request.
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Query options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// An actor stopped before the request could be delivered.
    #[error("{0} channel closed")]
    ChannelClosed(String),
}
