//! Reactive node variants and their per-node state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::iter::Peekable;
use std::sync::Arc;

use crate::subgraph::PacketStream;
use crate::{Identifier, ReactiveError, Request, Transform};

pub(crate) type PacketIter<P> = Box<dyn Iterator<Item = Result<P, ReactiveError>> + Send>;
pub(crate) type FlatMapFn<P> = Arc<dyn Fn(P) -> VecDeque<P> + Send + Sync>;
pub(crate) type ConnectFn<P> = Arc<dyn Fn(&P) -> Vec<Request<P>> + Send + Sync>;

/// The closed set of node behaviours.
pub(crate) enum Kind<P> {
    /// Iterator-backed origin; peeks ahead so exhaustion is known early.
    Source(Peekable<PacketIter<P>>),
    /// Origin fed asynchronously by the host, one item per demand.
    Producer(Producer<P>),
    Map(Transform<P>),
    FlatMap(FlatMap<P>),
    Distinct(HashSet<P>),
    /// Broadcast with an ordered log and one read cursor per subscriber.
    Buffer(ReplayLog<P>),
    /// Many publishers, one subscriber. Holds answers that arrive while the
    /// subscriber is not pulling.
    FanIn(VecDeque<P>),
    /// Turns packets into connection requests whose answers feed `fan_in`.
    Connector { make: ConnectFn<P>, fan_in: Identifier },
    /// Local stand-in for a remote output; `target` is the local subscriber.
    Input { target: Identifier },
    /// Local stand-in for a remote input.
    Output,
    Sink,
}

impl<P> Kind<P> {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Producer(_) => "producer",
            Self::Map(_) => "map",
            Self::FlatMap(_) => "flat_map",
            Self::Distinct(_) => "distinct",
            Self::Buffer(_) => "buffer",
            Self::FanIn(_) => "fan_in",
            Self::Connector { .. } => "connector",
            Self::Input { .. } => "input",
            Self::Output => "output",
            Self::Sink => "sink",
        }
    }
}

pub(crate) struct Producer<P> {
    pub(crate) stream: Option<PacketStream<P>>,
    pub(crate) requested: bool,
}

pub(crate) struct FlatMap<P> {
    pub(crate) f: FlatMapFn<P>,
    /// Elements of the current expansion not yet emitted.
    pub(crate) pending: VecDeque<P>,
    /// Whether the packet that produced `pending` is still unconsumed.
    pub(crate) holding: bool,
}

pub(crate) struct ReplayLog<P> {
    log: Vec<P>,
    cursors: HashMap<Identifier, usize>,
}

impl<P: Clone> ReplayLog<P> {
    pub(crate) fn new() -> Self {
        Self {
            log: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    /// New readers start at the beginning of the log.
    pub(crate) fn add_reader(&mut self, reader: Identifier) {
        self.cursors.entry(reader).or_insert(0);
    }

    pub(crate) fn push(&mut self, packet: P) {
        self.log.push(packet);
    }

    /// Next unread packet for `reader`, advancing its cursor.
    pub(crate) fn next_for(&mut self, reader: Identifier) -> Option<P> {
        let cursor = self.cursors.get_mut(&reader)?;
        let packet = self.log.get(*cursor)?.clone();
        *cursor += 1;
        Some(packet)
    }
}

pub(crate) struct Node<P> {
    pub(crate) id: Identifier,
    pub(crate) kind: Kind<P>,
    pub(crate) publishers: Vec<Identifier>,
    pub(crate) subscribers: Vec<Identifier>,
    /// Publishers this node has an outstanding pull on.
    pub(crate) pulled: HashSet<Identifier>,
    /// Subscribers with an outstanding pull on this node.
    pub(crate) pulling: HashSet<Identifier>,
    /// Sources only: no further packets will be produced.
    pub(crate) finished: bool,
}

impl<P> Node<P> {
    pub(crate) fn new(id: Identifier, kind: Kind<P>) -> Self {
        Self {
            id,
            kind,
            publishers: Vec::new(),
            subscribers: Vec::new(),
            pulled: HashSet::new(),
            pulling: HashSet::new(),
            finished: false,
        }
    }

    /// Only broadcast nodes serve more than one subscriber; sinks serve none.
    pub(crate) fn accepts_subscriber(&self) -> bool {
        match self.kind {
            Kind::Buffer(_) => true,
            Kind::Sink => false,
            _ => self.subscribers.is_empty(),
        }
    }

    pub(crate) fn is_source(&self) -> bool {
        matches!(self.kind, Kind::Source(_) | Kind::Producer(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockId;

    #[test]
    fn test_replay_log_cursors_are_independent() {
        let block = BlockId::next();
        let a = Identifier::new(block, 0);
        let b = Identifier::new(block, 1);
        let mut log = ReplayLog::new();
        log.add_reader(a);
        log.push("x");
        log.push("y");
        log.add_reader(b);

        assert_eq!(log.next_for(a), Some("x"));
        assert_eq!(log.next_for(b), Some("x"));
        assert_eq!(log.next_for(b), Some("y"));
        assert_eq!(log.next_for(b), None);
        assert_eq!(log.next_for(a), Some("y"));
    }

    #[test]
    fn test_replay_log_unknown_reader() {
        let mut log = ReplayLog::new();
        log.push(1);
        assert_eq!(log.next_for(Identifier::new(BlockId::next(), 0)), None);
    }
}
