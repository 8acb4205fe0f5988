//! The private subgraph of one execution unit.
//!
//! A subgraph owns its nodes in an arena and processes pulls and receives
//! through a local work queue until nothing more can happen locally. Anything
//! that must leave the unit (monitor reports, packets and pulls for remote
//! units, connection requests, answers for the external consumer) is collected
//! as an ordered list of [`Effect`]s for the host to apply.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use tracing::{debug, trace};

use crate::node::{ConnectFn, FlatMap, FlatMapFn, Kind, Node, PacketIter, Producer, ReplayLog};
use crate::{BlockId, Identifier, Packet, ReactiveError, Report, Request, Tracer, Transform};

/// Asynchronous sequence of packets backing a producer source.
pub type PacketStream<P> = BoxStream<'static, Result<P, ReactiveError>>;

/// Work the host must carry out on behalf of the subgraph, in order.
pub enum Effect<P> {
    /// Forward to the termination monitor.
    Report(Report),
    /// Ask the unit owning `output` for its next packet.
    RemotePull { input: Identifier, output: Identifier },
    /// Hand `packet` to the unit owning `input`.
    RemoteSend {
        output: Identifier,
        input: Identifier,
        packet: P,
    },
    /// Locate or create the unit answering `request` and wire it to `input`.
    RequestConnection {
        input: Identifier,
        request: Request<P>,
    },
    /// A producer source wants its next item.
    Demand { source: Identifier },
    /// A root sink received an answer for the external consumer.
    Deliver { sink: Identifier, packet: P },
}

impl<P: fmt::Debug> fmt::Debug for Effect<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Report(report) => f.debug_tuple("Report").field(report).finish(),
            Self::RemotePull { input, output } => f
                .debug_struct("RemotePull")
                .field("input", input)
                .field("output", output)
                .finish(),
            Self::RemoteSend {
                output,
                input,
                packet,
            } => f
                .debug_struct("RemoteSend")
                .field("output", output)
                .field("input", input)
                .field("packet", packet)
                .finish(),
            Self::RequestConnection { input, request } => f
                .debug_struct("RequestConnection")
                .field("input", input)
                .field("request", request)
                .finish(),
            Self::Demand { source } => f.debug_struct("Demand").field("source", source).finish(),
            Self::Deliver { sink, packet } => f
                .debug_struct("Deliver")
                .field("sink", sink)
                .field("packet", packet)
                .finish(),
        }
    }
}

enum Event<P> {
    Pull {
        publisher: Identifier,
        subscriber: Identifier,
    },
    Receive {
        subscriber: Identifier,
        publisher: Identifier,
        packet: P,
    },
}

/// Arena of reactive nodes owned by a single execution unit.
pub struct Subgraph<P: Packet> {
    block: BlockId,
    nodes: Vec<Node<P>>,
    edges: HashSet<(Identifier, Identifier)>,
    queue: VecDeque<Event<P>>,
    effects: Vec<Effect<P>>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl<P: Packet> Subgraph<P> {
    pub fn new(block: BlockId) -> Self {
        Self {
            block,
            nodes: Vec::new(),
            edges: HashSet::new(),
            queue: VecDeque::new(),
            effects: Vec::new(),
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Short name of the node's variant, for diagnostics.
    pub fn kind_of(&self, id: Identifier) -> Result<&'static str, ReactiveError> {
        Ok(self.node(id)?.kind.label())
    }

    /// Whether `sink` has an outstanding pull.
    pub fn is_pulling(&self, sink: Identifier) -> Result<bool, ReactiveError> {
        Ok(!self.node(sink)?.pulled.is_empty())
    }

    /// Take every effect produced since the last call.
    pub fn drain_effects(&mut self) -> Vec<Effect<P>> {
        std::mem::take(&mut self.effects)
    }

    // ---- builders ----

    /// A source over a finite sequence of packets.
    pub fn source<I>(&mut self, packets: I) -> Identifier
    where
        I: IntoIterator<Item = P>,
        I::IntoIter: Send + 'static,
    {
        self.try_source(packets.into_iter().map(Ok))
    }

    /// A source whose items may fail, e.g. a storage iterator.
    pub fn try_source<I>(&mut self, packets: I) -> Identifier
    where
        I: IntoIterator<Item = Result<P, ReactiveError>>,
        I::IntoIter: Send + 'static,
    {
        let iter: PacketIter<P> = Box::new(packets.into_iter());
        let mut iter = iter.peekable();
        let exhausted = iter.peek().is_none();
        let id = self.insert(Kind::Source(iter));
        self.report(Report::RegisterSource(id));
        if exhausted {
            self.finish_source(id);
        }
        id
    }

    /// A source fed from an asynchronous stream by the host.
    ///
    /// The host takes the stream with [`Subgraph::take_stream`] on the first
    /// [`Effect::Demand`] and answers each demand through [`Subgraph::produce`].
    pub fn producer(&mut self, stream: PacketStream<P>) -> Identifier {
        let id = self.insert(Kind::Producer(Producer {
            stream: Some(stream),
            requested: false,
        }));
        self.report(Report::RegisterSource(id));
        id
    }

    pub fn map<F>(&mut self, upstream: Identifier, f: F) -> Result<Identifier, ReactiveError>
    where
        F: Fn(P) -> P + Send + Sync + 'static,
    {
        self.transform(upstream, Arc::new(f))
    }

    /// Emit every element of `f(packet)`; an empty expansion re-pulls upstream.
    pub fn flat_map<F, I>(&mut self, upstream: Identifier, f: F) -> Result<Identifier, ReactiveError>
    where
        F: Fn(P) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = P>,
    {
        let f: FlatMapFn<P> = Arc::new(move |packet: P| f(packet).into_iter().collect::<VecDeque<P>>());
        self.chain(
            upstream,
            Kind::FlatMap(FlatMap {
                f,
                pending: VecDeque::new(),
                holding: false,
            }),
        )
    }

    /// Suppress packets equal to one this node already emitted.
    pub fn distinct(&mut self, upstream: Identifier) -> Result<Identifier, ReactiveError> {
        self.chain(upstream, Kind::Distinct(HashSet::new()))
    }

    /// Decouple `upstream` from any number of subscribers, each reading the
    /// full log at its own pace.
    pub fn buffer(&mut self, upstream: Identifier) -> Result<Identifier, ReactiveError> {
        self.chain(upstream, Kind::Buffer(ReplayLog::new()))
    }

    /// Broadcast `upstream` to many subscribers; identical to [`Subgraph::buffer`].
    pub fn fan_out(&mut self, upstream: Identifier) -> Result<Identifier, ReactiveError> {
        self.buffer(upstream)
    }

    /// A junction accepting publishers at any time, including mid-flight.
    pub fn fan_in(&mut self) -> Identifier {
        self.insert(Kind::FanIn(VecDeque::new()))
    }

    /// Add a local publisher to `fan_in`.
    pub fn attach(&mut self, fan_in: Identifier, publisher: Identifier) -> Result<(), ReactiveError> {
        self.expect_fan_in(fan_in)?;
        self.link(fan_in, publisher)?;
        let idx = self.index(fan_in)?;
        if !self.nodes[idx].pulling.is_empty() {
            self.pull_upstream(idx, publisher);
            self.run()?;
        }
        Ok(())
    }

    /// Request a connection for every request `make` derives from a packet
    /// of `upstream`; the answers flow into `fan_in`.
    pub fn connector<F>(
        &mut self,
        upstream: Identifier,
        fan_in: Identifier,
        make: F,
    ) -> Result<Identifier, ReactiveError>
    where
        F: Fn(&P) -> Vec<Request<P>> + Send + Sync + 'static,
    {
        self.expect_fan_in(fan_in)?;
        let make: ConnectFn<P> = Arc::new(make);
        let id = self.chain(upstream, Kind::Connector { make, fan_in })?;
        self.attach(fan_in, id)?;
        Ok(id)
    }

    /// Request a connection whose answers flow into `fan_in`.
    ///
    /// Returns the input that will receive them once the connection is wired.
    pub fn request(&mut self, fan_in: Identifier, request: Request<P>) -> Result<Identifier, ReactiveError> {
        self.expect_fan_in(fan_in)?;
        self.report(Report::ForkFrontier(fan_in));
        let input = self.create_input(fan_in)?;
        debug!(%input, computation = %request.computation, "requesting connection");
        self.effects
            .push(Effect::RequestConnection { input, request });
        Ok(input)
    }

    /// The terminal consumer of a root query.
    pub fn sink(&mut self, upstream: Identifier) -> Result<Identifier, ReactiveError> {
        self.chain(upstream, Kind::Sink)
    }

    /// Allocate an unconnected input port feeding `fan_in`.
    pub fn create_input(&mut self, fan_in: Identifier) -> Result<Identifier, ReactiveError> {
        self.expect_fan_in(fan_in)?;
        Ok(self.insert(Kind::Input { target: fan_in }))
    }

    /// Allocate an output port forwarding `publisher`'s answers to the remote
    /// `input`, applying `transforms` in order on the way out.
    ///
    /// The edge to the remote input is reported by the requesting unit. The
    /// first edge of the new chain is reported as a connection: until it is
    /// wired, the requester's own forked frontier covers it.
    pub fn create_output(
        &mut self,
        publisher: Identifier,
        input: Identifier,
        transforms: &[Transform<P>],
    ) -> Result<Identifier, ReactiveError> {
        if self.is_local(input) {
            return Err(ReactiveError::ProtocolViolation(format!(
                "output for {input} would not cross a unit boundary"
            )));
        }
        let mut upstream = publisher;
        let mut connection = true;
        for transform in transforms {
            upstream = self.chain_with(upstream, Kind::Map(Arc::clone(transform)), connection)?;
            connection = false;
        }
        let output = self.chain_with(upstream, Kind::Output, connection)?;
        let idx = self.index(output)?;
        self.nodes[idx].subscribers.push(input);
        Ok(output)
    }

    /// Wrap `id` in a buffer unless it already broadcasts.
    pub fn ensure_broadcast(&mut self, id: Identifier) -> Result<Identifier, ReactiveError> {
        match self.node(id)?.kind {
            Kind::Buffer(_) => Ok(id),
            _ => self.buffer(id),
        }
    }

    // ---- drivers ----

    /// Record the remote `output` behind `input`, register the new edges and
    /// issue the first pull.
    pub fn connect_input(&mut self, input: Identifier, output: Identifier) -> Result<(), ReactiveError> {
        let idx = self.index(input)?;
        let target = match self.nodes[idx].kind {
            Kind::Input { target } if self.nodes[idx].publishers.is_empty() => target,
            Kind::Input { .. } => {
                return Err(ReactiveError::ProtocolViolation(format!(
                    "input {input} is already connected"
                )));
            }
            _ => {
                return Err(ReactiveError::ProtocolViolation(format!(
                    "{input} is a {}, not an input",
                    self.nodes[idx].kind.label()
                )));
            }
        };
        self.link(input, output)?;
        self.link(target, input)?;
        self.report(Report::JoinFrontier(target));

        let target_idx = self.index(target)?;
        self.pull_upstream(target_idx, input);
        self.run()
    }

    /// A remote subscriber pulls one of this unit's outputs.
    pub fn pull(&mut self, publisher: Identifier, subscriber: Identifier) -> Result<(), ReactiveError> {
        self.queue.push_back(Event::Pull {
            publisher,
            subscriber,
        });
        self.run()
    }

    /// A packet arrives from a remote output at one of this unit's inputs.
    pub fn receive(&mut self, subscriber: Identifier, publisher: Identifier, packet: P) -> Result<(), ReactiveError> {
        self.queue.push_back(Event::Receive {
            subscriber,
            publisher,
            packet,
        });
        self.run()
    }

    /// Pull on behalf of a sink. Returns `false` if the sink is already
    /// pulling, in which case nothing is issued.
    pub fn pull_sink(&mut self, sink: Identifier) -> Result<bool, ReactiveError> {
        let idx = self.index(sink)?;
        if !matches!(self.nodes[idx].kind, Kind::Sink) {
            return Err(ReactiveError::ProtocolViolation(format!("{sink} is not a sink")));
        }
        let Some(&publisher) = self.nodes[idx].publishers.first() else {
            return Err(ReactiveError::ProtocolViolation(format!(
                "sink {sink} has no publisher"
            )));
        };
        if self.nodes[idx].pulled.contains(&publisher) {
            return Ok(false);
        }
        self.pull_upstream(idx, publisher);
        self.run()?;
        Ok(true)
    }

    /// Hand the stream of a producer source to the host.
    pub fn take_stream(&mut self, source: Identifier) -> Result<Option<PacketStream<P>>, ReactiveError> {
        let idx = self.index(source)?;
        match &mut self.nodes[idx].kind {
            Kind::Producer(producer) => Ok(producer.stream.take()),
            other => Err(ReactiveError::ProtocolViolation(format!(
                "{source} is a {}, not a producer",
                other.label()
            ))),
        }
    }

    /// The host's answer to a [`Effect::Demand`]; `None` means exhausted.
    pub fn produce(
        &mut self,
        source: Identifier,
        item: Option<Result<P, ReactiveError>>,
    ) -> Result<(), ReactiveError> {
        let idx = self.index(source)?;
        match &mut self.nodes[idx].kind {
            Kind::Producer(producer) if producer.requested => producer.requested = false,
            _ => {
                return Err(ReactiveError::ProtocolViolation(format!(
                    "{source} produced without demand"
                )));
            }
        }
        match item {
            Some(Ok(packet)) => {
                self.emit_downstream(idx, packet)?;
                self.run()
            }
            Some(Err(e)) => Err(e),
            None => {
                self.finish_source(source);
                Ok(())
            }
        }
    }

    // ---- internals ----

    fn insert(&mut self, kind: Kind<P>) -> Identifier {
        let id = Identifier::new(self.block, self.nodes.len() as u32);
        self.nodes.push(Node::new(id, kind));
        id
    }

    fn is_local(&self, id: Identifier) -> bool {
        id.block() == self.block
    }

    fn index(&self, id: Identifier) -> Result<usize, ReactiveError> {
        let idx = id.node() as usize;
        if self.is_local(id) && idx < self.nodes.len() {
            Ok(idx)
        } else {
            Err(ReactiveError::UnknownNode(id))
        }
    }

    fn node(&self, id: Identifier) -> Result<&Node<P>, ReactiveError> {
        Ok(&self.nodes[self.index(id)?])
    }

    fn expect_fan_in(&self, id: Identifier) -> Result<(), ReactiveError> {
        match self.node(id)?.kind {
            Kind::FanIn(_) => Ok(()),
            ref other => Err(ReactiveError::ProtocolViolation(format!(
                "{id} is a {}, not a fan-in",
                other.label()
            ))),
        }
    }

    fn report(&mut self, report: Report) {
        self.effects.push(Effect::Report(report));
    }

    fn transform(&mut self, upstream: Identifier, f: Transform<P>) -> Result<Identifier, ReactiveError> {
        self.chain(upstream, Kind::Map(f))
    }

    /// Insert a node subscribed to `upstream`.
    fn chain(&mut self, upstream: Identifier, kind: Kind<P>) -> Result<Identifier, ReactiveError> {
        self.chain_with(upstream, kind, false)
    }

    fn chain_with(&mut self, upstream: Identifier, kind: Kind<P>, connection: bool) -> Result<Identifier, ReactiveError> {
        self.check_subscribable(upstream)?;
        let id = self.insert(kind);
        self.link_with(id, upstream, connection)?;
        Ok(id)
    }

    fn check_subscribable(&self, publisher: Identifier) -> Result<(), ReactiveError> {
        if !self.is_local(publisher) {
            return Ok(());
        }
        let node = self.node(publisher)?;
        if node.accepts_subscriber() {
            Ok(())
        } else {
            Err(ReactiveError::ProtocolViolation(format!(
                "{publisher} ({}) cannot take another subscriber; broadcast through a buffer",
                node.kind.label()
            )))
        }
    }

    /// Record the edge `subscriber` ← `publisher` and report it exactly once.
    fn link(&mut self, subscriber: Identifier, publisher: Identifier) -> Result<(), ReactiveError> {
        self.link_with(subscriber, publisher, false)
    }

    fn link_with(&mut self, subscriber: Identifier, publisher: Identifier, connection: bool) -> Result<(), ReactiveError> {
        if self.edges.contains(&(subscriber, publisher)) {
            return Ok(());
        }
        self.check_subscribable(publisher)?;
        if self.is_local(publisher) {
            let idx = self.index(publisher)?;
            let node = &mut self.nodes[idx];
            node.subscribers.push(subscriber);
            if let Kind::Buffer(log) = &mut node.kind {
                log.add_reader(subscriber);
            }
        }
        if self.is_local(subscriber) {
            let idx = self.index(subscriber)?;
            self.nodes[idx].publishers.push(publisher);
        }
        self.edges.insert((subscriber, publisher));
        if let Some(tracer) = &self.tracer {
            tracer.register_path(subscriber, publisher);
        }
        self.report(if connection {
            Report::RegisterConnection {
                subscriber,
                publisher,
            }
        } else {
            Report::RegisterPath {
                subscriber,
                publisher,
            }
        });
        Ok(())
    }

    fn finish_source(&mut self, source: Identifier) {
        let idx = source.node() as usize;
        if !self.nodes[idx].finished {
            self.nodes[idx].finished = true;
            trace!(%source, "source finished");
            self.report(Report::SourceFinished(source));
        }
    }

    fn run(&mut self) -> Result<(), ReactiveError> {
        while let Some(event) = self.queue.pop_front() {
            match event {
                Event::Pull {
                    publisher,
                    subscriber,
                } => self.on_pull(publisher, subscriber)?,
                Event::Receive {
                    subscriber,
                    publisher,
                    packet,
                } => self.on_receive(subscriber, publisher, packet)?,
            }
        }
        Ok(())
    }

    fn on_pull(&mut self, publisher: Identifier, subscriber: Identifier) -> Result<(), ReactiveError> {
        let idx = self.index(publisher)?;
        if !self.nodes[idx].subscribers.contains(&subscriber) {
            return Err(ReactiveError::ProtocolViolation(format!(
                "{subscriber} pulled {publisher} without a registered path"
            )));
        }
        if !self.nodes[idx].pulling.insert(subscriber) {
            return Ok(());
        }

        let node = &mut self.nodes[idx];
        match &mut node.kind {
            Kind::Source(iter) => {
                if node.finished {
                    return Ok(());
                }
                let next = iter.next();
                let exhausted = iter.peek().is_none();
                match next {
                    Some(Ok(packet)) => {
                        self.emit(idx, subscriber, packet)?;
                        if exhausted {
                            self.finish_source(publisher);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => self.finish_source(publisher),
                }
            }
            Kind::Producer(producer) => {
                if !node.finished && !producer.requested {
                    producer.requested = true;
                    self.effects.push(Effect::Demand { source: publisher });
                }
            }
            Kind::FlatMap(flat_map) => match flat_map.pending.pop_front() {
                Some(packet) => {
                    let drained = flat_map.pending.is_empty() && flat_map.holding;
                    if drained {
                        flat_map.holding = false;
                    }
                    self.emit(idx, subscriber, packet)?;
                    if drained {
                        self.report(Report::ConsumeAnswer(publisher));
                    }
                }
                None => self.pull_all_upstream(idx),
            },
            Kind::Buffer(log) => match log.next_for(subscriber) {
                Some(packet) => self.deliver(idx, subscriber, packet),
                None => self.pull_all_upstream(idx),
            },
            Kind::FanIn(held) => match held.pop_front() {
                Some(packet) => {
                    self.emit(idx, subscriber, packet)?;
                    self.report(Report::ConsumeAnswer(publisher));
                }
                None => self.pull_all_upstream(idx),
            },
            Kind::Map(_)
            | Kind::Distinct(_)
            | Kind::Connector { .. }
            | Kind::Input { .. }
            | Kind::Output => self.pull_all_upstream(idx),
            Kind::Sink => {
                return Err(ReactiveError::ProtocolViolation(format!(
                    "sink {publisher} cannot be pulled"
                )));
            }
        }
        Ok(())
    }

    fn on_receive(&mut self, subscriber: Identifier, publisher: Identifier, packet: P) -> Result<(), ReactiveError> {
        let idx = self.index(subscriber)?;
        if !self.nodes[idx].pulled.remove(&publisher) {
            return Err(ReactiveError::ProtocolViolation(format!(
                "{subscriber} received from {publisher} without pulling"
            )));
        }
        if let Some(tracer) = &self.tracer {
            tracer.receive(publisher, subscriber, &packet);
        }

        let node = &mut self.nodes[idx];
        match &mut node.kind {
            Kind::Map(f) => {
                let f = Arc::clone(f);
                self.emit_downstream(idx, f(packet))?;
                self.report(Report::ConsumeAnswer(subscriber));
            }
            Kind::FlatMap(flat_map) => {
                let f = Arc::clone(&flat_map.f);
                let mut expanded = f(packet);
                match expanded.pop_front() {
                    None => {
                        self.report(Report::ConsumeAnswer(subscriber));
                        self.retry(idx, publisher);
                    }
                    Some(first) => {
                        if let Kind::FlatMap(flat_map) = &mut self.nodes[idx].kind {
                            flat_map.holding = !expanded.is_empty();
                            flat_map.pending = expanded;
                        }
                        let holding = matches!(
                            &self.nodes[idx].kind,
                            Kind::FlatMap(flat_map) if flat_map.holding
                        );
                        self.emit_downstream(idx, first)?;
                        if !holding {
                            self.report(Report::ConsumeAnswer(subscriber));
                        }
                    }
                }
            }
            Kind::Distinct(seen) => {
                if seen.insert(packet.clone()) {
                    self.emit_downstream(idx, packet)?;
                    self.report(Report::ConsumeAnswer(subscriber));
                } else {
                    trace!(%subscriber, ?packet, "suppressed duplicate");
                    self.report(Report::ConsumeAnswer(subscriber));
                    self.retry(idx, publisher);
                }
            }
            Kind::Buffer(log) => {
                log.push(packet);
                self.report(Report::CreateAnswer(subscriber));
                let waiting: Vec<Identifier> = self.nodes[idx]
                    .subscribers
                    .iter()
                    .filter(|s| self.nodes[idx].pulling.contains(*s))
                    .copied()
                    .collect();
                for reader in waiting {
                    let next = match &mut self.nodes[idx].kind {
                        Kind::Buffer(log) => log.next_for(reader),
                        _ => None,
                    };
                    if let Some(next) = next {
                        self.deliver(idx, reader, next);
                    }
                }
                self.report(Report::ConsumeAnswer(subscriber));
            }
            Kind::FanIn(held) => {
                if node.pulling.is_empty() {
                    held.push_back(packet);
                } else {
                    self.emit_downstream(idx, packet)?;
                    self.report(Report::ConsumeAnswer(subscriber));
                }
            }
            Kind::Connector { make, fan_in } => {
                let make = Arc::clone(make);
                let fan_in = *fan_in;
                for request in make(&packet) {
                    self.request(fan_in, request)?;
                }
                self.report(Report::ConsumeAnswer(subscriber));
                self.retry(idx, publisher);
            }
            Kind::Input { .. } | Kind::Output => {
                self.emit_downstream(idx, packet)?;
                self.report(Report::ConsumeAnswer(subscriber));
            }
            Kind::Sink => {
                self.report(Report::ConsumeAnswer(subscriber));
                self.effects.push(Effect::Deliver {
                    sink: subscriber,
                    packet,
                });
            }
            Kind::Source(_) | Kind::Producer(_) => {
                return Err(ReactiveError::ProtocolViolation(format!(
                    "source {subscriber} cannot receive"
                )));
            }
        }
        Ok(())
    }

    /// Pull `publisher` again if this node is still being pulled.
    fn retry(&mut self, idx: usize, publisher: Identifier) {
        if !self.nodes[idx].pulling.is_empty() {
            self.pull_upstream(idx, publisher);
        }
    }

    fn pull_all_upstream(&mut self, idx: usize) {
        let publishers = self.nodes[idx].publishers.clone();
        for publisher in publishers {
            self.pull_upstream(idx, publisher);
        }
    }

    /// Issue a pull unless one is already outstanding on `publisher`.
    fn pull_upstream(&mut self, idx: usize, publisher: Identifier) {
        let subscriber = self.nodes[idx].id;
        if !self.nodes[idx].pulled.insert(publisher) {
            return;
        }
        if let Some(tracer) = &self.tracer {
            tracer.pull(subscriber, publisher);
        }
        if self.is_local(publisher) {
            self.queue.push_back(Event::Pull {
                publisher,
                subscriber,
            });
        } else {
            self.effects.push(Effect::RemotePull {
                input: subscriber,
                output: publisher,
            });
        }
    }

    fn emit_downstream(&mut self, idx: usize, packet: P) -> Result<(), ReactiveError> {
        let Some(&to) = self.nodes[idx].subscribers.first() else {
            return Err(ReactiveError::ProtocolViolation(format!(
                "{} has no subscriber to emit to",
                self.nodes[idx].id
            )));
        };
        self.emit(idx, to, packet)
    }

    /// Create one answer and send it to `to`, which must be pulling.
    fn emit(&mut self, idx: usize, to: Identifier, packet: P) -> Result<(), ReactiveError> {
        let from = self.nodes[idx].id;
        if !self.nodes[idx].pulling.remove(&to) {
            return Err(ReactiveError::ProtocolViolation(format!(
                "{from} emitted to {to} without an outstanding pull"
            )));
        }
        self.report(Report::CreateAnswer(from));
        self.send(from, to, packet);
        Ok(())
    }

    /// Send an already-created answer; broadcast replays use this.
    fn deliver(&mut self, idx: usize, to: Identifier, packet: P) {
        let from = self.nodes[idx].id;
        self.nodes[idx].pulling.remove(&to);
        self.send(from, to, packet);
    }

    fn send(&mut self, from: Identifier, to: Identifier, packet: P) {
        if self.is_local(to) {
            self.queue.push_back(Event::Receive {
                subscriber: to,
                publisher: from,
                packet,
            });
        } else {
            self.effects.push(Effect::RemoteSend {
                output: from,
                input: to,
                packet,
            });
        }
    }

    /// Sources registered in this subgraph that have not finished.
    pub fn active_sources(&self) -> Vec<Identifier> {
        self.nodes
            .iter()
            .filter(|node| node.is_source() && !node.finished)
            .map(|node| node.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::{RecordingTracer, TraceEvent};

    fn graph() -> Subgraph<&'static str> {
        Subgraph::new(BlockId::next())
    }

    fn reports<P>(effects: &[Effect<P>]) -> Vec<Report> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Report(report) => Some(*report),
                _ => None,
            })
            .collect()
    }

    fn delivered<P: Clone>(effects: &[Effect<P>], sink: Identifier) -> Vec<P> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Deliver { sink: s, packet } if *s == sink => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    fn pulls_of(events: &[TraceEvent], publisher: Identifier) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, TraceEvent::Pull { publisher: p, .. } if *p == publisher))
            .count()
    }

    #[test]
    fn test_map_chain_delivers_in_order() {
        let mut g = Subgraph::new(BlockId::next());
        let src = g.source(vec![1, 2, 3]);
        let doubled = g.map(src, |x| x * 2).unwrap();
        let sink = g.sink(doubled).unwrap();
        g.drain_effects();

        for _ in 0..3 {
            assert!(g.pull_sink(sink).unwrap());
        }
        let effects = g.drain_effects();
        assert_eq!(delivered(&effects, sink), vec![2, 4, 6]);
    }

    #[test]
    fn test_create_precedes_consume_along_a_chain() {
        let mut g = graph();
        let src = g.source(vec!["a"]);
        let map = g.map(src, |x| x).unwrap();
        let sink = g.sink(map).unwrap();
        g.drain_effects();

        g.pull_sink(sink).unwrap();
        let effects = g.drain_effects();
        assert_eq!(
            reports(&effects),
            vec![
                Report::CreateAnswer(src),
                Report::SourceFinished(src),
                Report::CreateAnswer(map),
                Report::ConsumeAnswer(map),
                Report::ConsumeAnswer(sink),
            ]
        );
    }

    #[test]
    fn test_builders_register_every_edge_once() {
        let mut g = graph();
        let src = g.source(vec!["a", "b"]);
        let buf = g.buffer(src).unwrap();
        let fan = g.fan_in();
        g.attach(fan, buf).unwrap();
        g.attach(fan, buf).unwrap();
        let effects = g.drain_effects();
        assert_eq!(
            reports(&effects),
            vec![
                Report::RegisterSource(src),
                Report::RegisterPath {
                    subscriber: buf,
                    publisher: src
                },
                Report::RegisterPath {
                    subscriber: fan,
                    publisher: buf
                },
            ]
        );
    }

    #[test]
    fn test_empty_source_finishes_at_construction() {
        let mut g = graph();
        let src = g.source(Vec::new());
        assert_eq!(
            reports(&g.drain_effects()),
            vec![Report::RegisterSource(src), Report::SourceFinished(src)]
        );
        assert!(g.active_sources().is_empty());
    }

    #[test]
    fn test_flat_map_empty_expansion_repulls_upstream() {
        let tracer = Arc::new(RecordingTracer::new());
        let mut g = graph().with_tracer(tracer.clone());
        let src = g.source(vec!["x", "y"]);
        let expanded = g
            .flat_map(src, |p| if p == "x" { vec![] } else { vec!["y1", "y2"] })
            .unwrap();
        let sink = g.sink(expanded).unwrap();
        g.drain_effects();

        g.pull_sink(sink).unwrap();
        let effects = g.drain_effects();
        assert_eq!(delivered(&effects, sink), vec!["y1"]);
        assert_eq!(pulls_of(&tracer.events(), src), 2);

        g.pull_sink(sink).unwrap();
        let effects = g.drain_effects();
        assert_eq!(delivered(&effects, sink), vec!["y2"]);
        // "y" is consumed only once its whole expansion has been emitted
        assert_eq!(
            reports(&effects),
            vec![
                Report::CreateAnswer(expanded),
                Report::ConsumeAnswer(expanded),
                Report::ConsumeAnswer(sink),
            ]
        );
    }

    #[test]
    fn test_distinct_suppresses_duplicates() {
        let mut g = graph();
        let src = g.source(vec!["a", "a", "b", "a"]);
        let unique = g.distinct(src).unwrap();
        let sink = g.sink(unique).unwrap();
        g.drain_effects();

        g.pull_sink(sink).unwrap();
        g.pull_sink(sink).unwrap();
        g.pull_sink(sink).unwrap();
        let effects = g.drain_effects();
        assert_eq!(delivered(&effects, sink), vec!["a", "b"]);
        assert!(g.active_sources().is_empty());
    }

    #[test_case(1, 2 ; "slow first subscriber")]
    #[test_case(2, 1 ; "slow second subscriber")]
    #[test_case(3, 3 ; "both drain")]
    fn test_buffer_replays_every_packet_to_every_subscriber(first: usize, second: usize) {
        let mut g = graph();
        let src = g.source(vec!["a", "b", "c"]);
        let buf = g.buffer(src).unwrap();
        let s1 = g.sink(buf).unwrap();
        let s2 = g.sink(buf).unwrap();
        g.drain_effects();

        let mut got1 = Vec::new();
        let mut got2 = Vec::new();
        for round in 0..first.max(second) {
            if round < first {
                g.pull_sink(s1).unwrap();
                got1.extend(delivered(&g.drain_effects(), s1));
            }
            if round < second {
                g.pull_sink(s2).unwrap();
                got2.extend(delivered(&g.drain_effects(), s2));
            }
        }
        let all = ["a", "b", "c"];
        assert_eq!(got1, all[..first].to_vec());
        assert_eq!(got2, all[..second].to_vec());
    }

    #[test]
    fn test_late_subscriber_receives_earlier_packets() {
        let mut g = graph();
        let src = g.source(vec!["a", "b"]);
        let buf = g.buffer(src).unwrap();
        let s1 = g.sink(buf).unwrap();
        g.pull_sink(s1).unwrap();
        g.pull_sink(s1).unwrap();
        g.drain_effects();

        let s2 = g.sink(buf).unwrap();
        g.pull_sink(s2).unwrap();
        g.pull_sink(s2).unwrap();
        assert_eq!(delivered(&g.drain_effects(), s2), vec!["a", "b"]);
    }

    #[test]
    fn test_repeated_pull_is_idempotent() {
        let tracer = Arc::new(RecordingTracer::new());
        let mut g = graph().with_tracer(tracer.clone());
        let fan = g.fan_in();
        let input = g.create_input(fan).unwrap();
        let sink = g.sink(fan).unwrap();

        assert!(g.pull_sink(sink).unwrap());
        assert!(!g.pull_sink(sink).unwrap());
        assert!(g.is_pulling(sink).unwrap());
        assert_eq!(pulls_of(&tracer.events(), fan), 1);
        // the unconnected input is not a publisher of the fan-in yet
        assert_eq!(pulls_of(&tracer.events(), input), 0);
    }

    #[test]
    fn test_second_subscriber_requires_a_buffer() {
        let mut g = graph();
        let src = g.source(vec!["a"]);
        let map = g.map(src, |x| x).unwrap();
        g.sink(map).unwrap();
        let err = g.sink(map).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_fan_in_pulls_publishers_attached_mid_flight() {
        let mut g = graph();
        let fan = g.fan_in();
        let sink = g.sink(fan).unwrap();
        g.pull_sink(sink).unwrap();
        g.drain_effects();

        let late = g.source(vec!["late"]);
        g.attach(fan, late).unwrap();
        let effects = g.drain_effects();
        assert_eq!(delivered(&effects, sink), vec!["late"]);
    }

    #[test]
    fn test_fan_in_holds_answers_until_pulled() {
        let mut g = graph();
        let a = g.source(vec!["a"]);
        let b = g.source(vec!["b"]);
        let fan = g.fan_in();
        g.attach(fan, a).unwrap();
        g.attach(fan, b).unwrap();
        let sink = g.sink(fan).unwrap();
        g.drain_effects();

        g.pull_sink(sink).unwrap();
        let effects = g.drain_effects();
        assert_eq!(delivered(&effects, sink), vec!["a"]);
        // "b" arrived too but stays unconsumed at the fan-in
        let consumed = reports(&effects)
            .into_iter()
            .filter(|r| *r == Report::ConsumeAnswer(fan))
            .count();
        assert_eq!(consumed, 1);

        g.pull_sink(sink).unwrap();
        assert_eq!(delivered(&g.drain_effects(), sink), vec!["b"]);
    }

    #[test]
    fn test_request_and_connect_input() {
        let mut g = graph();
        let fan = g.fan_in();
        let input = g.request(fan, Request::new("reach", "a")).unwrap();
        let sink = g.sink(fan).unwrap();
        let effects = g.drain_effects();
        assert!(matches!(effects[0], Effect::Report(Report::ForkFrontier(f)) if f == fan));
        assert!(matches!(
            &effects[1],
            Effect::RequestConnection { input: i, request } if *i == input && request.bounds == "a"
        ));

        g.pull_sink(sink).unwrap();
        g.drain_effects();

        let remote = Subgraph::<&'static str>::new(BlockId::next());
        let output = Identifier::new(remote.block(), 7);
        g.connect_input(input, output).unwrap();
        let effects = g.drain_effects();
        assert_eq!(
            reports(&effects),
            vec![
                Report::RegisterPath {
                    subscriber: input,
                    publisher: output
                },
                Report::RegisterPath {
                    subscriber: fan,
                    publisher: input
                },
                Report::JoinFrontier(fan),
            ]
        );
        assert!(matches!(
            effects.last(),
            Some(Effect::RemotePull { input: i, output: o }) if *i == input && *o == output
        ));

        g.receive(input, output, "b").unwrap();
        assert_eq!(delivered(&g.drain_effects(), sink), vec!["b"]);

        let err = g.connect_input(input, output).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_output_applies_transforms() {
        let mut g = Subgraph::new(BlockId::next());
        let src = g.source(vec![1, 2]);
        let buf = g.buffer(src).unwrap();
        let remote_input = Identifier::new(BlockId::next(), 0);
        let add: Transform<i32> = Arc::new(|x: i32| x + 10);
        let output = g.create_output(buf, remote_input, &[add]).unwrap();
        g.drain_effects();

        g.pull(output, remote_input).unwrap();
        let sent: Vec<i32> = g
            .drain_effects()
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::RemoteSend { packet, input, .. } if input == remote_input => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![11]);
    }

    #[test]
    fn test_output_reports_its_first_edge_as_a_connection() {
        let mut g = Subgraph::new(BlockId::next());
        let src = g.source(vec![1]);
        let buf = g.buffer(src).unwrap();
        g.drain_effects();

        let plain = g.create_output(buf, Identifier::new(BlockId::next(), 0), &[]).unwrap();
        assert_eq!(
            reports(&g.drain_effects()),
            vec![Report::RegisterConnection {
                subscriber: plain,
                publisher: buf
            }]
        );

        let add: Transform<i32> = Arc::new(|x: i32| x + 1);
        let output = g.create_output(buf, Identifier::new(BlockId::next(), 0), &[add]).unwrap();
        let reported = reports(&g.drain_effects());
        let [Report::RegisterConnection {
            subscriber: map,
            publisher,
        }, Report::RegisterPath {
            subscriber,
            publisher: upstream,
        }] = reported[..]
        else {
            panic!("unexpected reports {reported:?}");
        };
        assert_eq!(publisher, buf);
        assert_eq!(upstream, map);
        assert_eq!(subscriber, output);
    }

    #[test]
    fn test_connector_requests_one_connection_per_packet() {
        let mut g = graph();
        let src = g.source(vec!["b", "c"]);
        let fan = g.fan_in();
        g.connector(src, fan, |p| vec![Request::new("reach", *p)])
            .unwrap();
        let sink = g.sink(fan).unwrap();
        g.drain_effects();

        g.pull_sink(sink).unwrap();
        let effects = g.drain_effects();
        let requested: Vec<&str> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::RequestConnection { request, .. } => Some(request.bounds),
                _ => None,
            })
            .collect();
        assert_eq!(requested, vec!["b", "c"]);
        let forks = reports(&effects)
            .into_iter()
            .filter(|r| *r == Report::ForkFrontier(fan))
            .count();
        assert_eq!(forks, 2);
    }

    #[test]
    fn test_source_error_propagates() {
        let mut g = graph();
        let src = g.try_source(vec![Err(ReactiveError::ResourceClosed("tx".into()))]);
        let sink = g.sink(src).unwrap();
        let err = g.pull_sink(sink).unwrap_err();
        assert_eq!(err, ReactiveError::ResourceClosed("tx".into()));
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let mut g = graph();
        let foreign = Identifier::new(BlockId::next(), 0);
        assert_eq!(g.pull_sink(foreign).unwrap_err(), ReactiveError::UnknownNode(foreign));
    }
}
