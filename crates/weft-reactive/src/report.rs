//! Notifications sent from execution units to the termination monitor.

use crate::Identifier;

/// One topology or counter update for the monitor.
///
/// Units must report `RegisterSource`/`RegisterPath` for an edge before any
/// `CreateAnswer`/`ConsumeAnswer` that travels over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// A node with no upstream publisher exists.
    RegisterSource(Identifier),
    /// A source will never produce again.
    SourceFinished(Identifier),
    /// `subscriber` pulls from `publisher`.
    RegisterPath {
        subscriber: Identifier,
        publisher: Identifier,
    },
    /// Like `RegisterPath`, for the first edge of a chain serving a remote
    /// requester. A merge it causes charges no root: the requester's forked
    /// frontier already covers the connection until it is wired.
    RegisterConnection {
        subscriber: Identifier,
        publisher: Identifier,
    },
    /// `publisher` emitted one answer.
    CreateAnswer(Identifier),
    /// `subscriber` finished processing one received answer.
    ConsumeAnswer(Identifier),
    /// A connection was requested on behalf of this node and is not yet wired.
    ForkFrontier(Identifier),
    /// A previously forked connection of this node has been wired.
    JoinFrontier(Identifier),
}

impl Report {
    /// The node this report is about.
    pub fn subject(&self) -> Identifier {
        match *self {
            Self::RegisterSource(id)
            | Self::SourceFinished(id)
            | Self::CreateAnswer(id)
            | Self::ConsumeAnswer(id)
            | Self::ForkFrontier(id)
            | Self::JoinFrontier(id) => id,
            Self::RegisterPath { subscriber, .. } | Self::RegisterConnection { subscriber, .. } => subscriber,
        }
    }
}
