//! Error types for the termination monitor.

use thiserror::Error;
use weft_reactive::Identifier;

/// Errors raised while applying monitor notifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// A counter message referenced a node no topology message introduced.
    #[error("unknown node: {0}")]
    UnknownNode(Identifier),

    /// The identifier is not a registered root.
    #[error("unknown root: {0}")]
    UnknownRoot(Identifier),

    /// A root was registered twice.
    #[error("root already registered: {0}")]
    DuplicateRoot(Identifier),

    /// A frontier was joined more often than it was forked.
    #[error("unbalanced frontier at {0}")]
    UnbalancedFrontier(Identifier),

    /// The monitor task has stopped.
    #[error("monitor channel closed")]
    Closed,
}
