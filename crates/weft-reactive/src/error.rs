//! Error types for reactive nodes.

use thiserror::Error;

use crate::Identifier;

/// Errors raised while building or driving a subgraph.
///
/// Empty results are never errors; a node that has nothing to emit simply
/// emits nothing. The enum is `Clone` because one fault is forwarded to every
/// unit that depends on the failing one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// The owning transaction or session was closed mid-query.
    #[error("resource closed: {0}")]
    ResourceClosed(String),

    /// A source failed to produce its next packet.
    #[error("source failed: {0}")]
    Source(String),

    /// A message referenced a node this unit does not own.
    #[error("unknown node: {0}")]
    UnknownNode(Identifier),

    /// A node was driven in a way the pull protocol forbids.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No computation is registered under the requested name.
    #[error("unknown computation: {0}")]
    UnknownComputation(String),

    /// A unit could not build its subgraph.
    #[error("set-up failed: {0}")]
    SetUp(String),
}

impl ReactiveError {
    /// Whether this error signals a bug rather than an external fault.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_) | Self::UnknownNode(_))
    }
}
