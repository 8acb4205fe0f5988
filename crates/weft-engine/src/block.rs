//! Execution unit actor.
//!
//! A block owns one private [`Subgraph`] and processes one message at a time.
//! After every message it drains the subgraph's effects and applies them in
//! order: reports go to the monitor, pulls and packets go to the blocks on the
//! other side of its ports, connection requests go to the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use weft_monitor::{MonitorHandle, RootOutcome};
use weft_reactive::{
    BlockId, ComputationId, Effect, Identifier, Packet, ReactiveError, Request, Subgraph, Tracer,
};

use crate::computation::Computation;
use crate::controller::ControllerHandle;
use crate::registry::RegistryHandle;
use crate::root::RootSink;

/// Messages accepted by a [`Block`].
pub(crate) enum BlockMsg<P> {
    /// A remote input pulls one of this block's outputs.
    Pull { output: Identifier, input: Identifier },
    /// A remote output delivers a packet to one of this block's inputs.
    Receive {
        input: Identifier,
        output: Identifier,
        packet: P,
    },
    /// Wire a new output to the requester described by the connector.
    EstablishConnection(Connector<P>),
    /// The answering block created `output` for our `input`.
    FinishConnection {
        input: Identifier,
        output: Identifier,
        answerer: BlockHandle<P>,
    },
    /// Next item of a producer source; `None` when exhausted.
    Produced {
        source: Identifier,
        item: Option<Result<P, ReactiveError>>,
    },
    /// A block this one depends on failed.
    Failed { error: ReactiveError },
    PullRoot,
    Cancel,
    RootFinished(RootOutcome),
    Shutdown,
}

/// A request for a connection, travelling from the requester through the
/// registry and a controller to the answering block.
pub(crate) struct Connector<P> {
    pub(crate) request: Request<P>,
    pub(crate) input: Identifier,
    pub(crate) requester: BlockHandle<P>,
    pub(crate) tracer: Option<Arc<dyn Tracer>>,
}

/// Cheaply cloneable address of a block.
pub(crate) struct BlockHandle<P> {
    id: BlockId,
    tx: mpsc::UnboundedSender<BlockMsg<P>>,
}

impl<P> Clone for BlockHandle<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<P> BlockHandle<P> {
    pub(crate) fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send without waiting. Returns `false` if the block has stopped.
    pub(crate) fn send(&self, msg: BlockMsg<P>) -> bool {
        if self.tx.send(msg).is_err() {
            trace!(block = %self.id, "block already stopped");
            return false;
        }
        true
    }
}

/// Collaborators shared by every block of an engine.
pub(crate) struct Context<P> {
    pub(crate) registry: RegistryHandle<P>,
    pub(crate) monitor: MonitorHandle,
}

impl<P> Clone for Context<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

pub(crate) enum Role<P: Packet> {
    /// Answers one computation under fixed bounds for any number of requesters.
    Inner {
        computation: ComputationId,
        bounds: P,
        logic: Arc<dyn Computation<P>>,
        controller: ControllerHandle<P>,
    },
    /// Hosts the sink of one external query.
    Root(RootSink<P>),
}

pub(crate) struct Block<P: Packet> {
    pub(crate) graph: Subgraph<P>,
    pub(crate) role: Role<P>,
    pub(crate) ctx: Context<P>,
    tracer: Option<Arc<dyn Tracer>>,
    /// Broadcast node every output reads from; inner blocks only.
    exposed: Option<Identifier>,
    upstream: HashMap<Identifier, BlockHandle<P>>,
    downstream: HashMap<Identifier, BlockHandle<P>>,
    demand: HashMap<Identifier, mpsc::UnboundedSender<()>>,
    failed: Option<ReactiveError>,
    pub(crate) handle: BlockHandle<P>,
    rx: mpsc::UnboundedReceiver<BlockMsg<P>>,
}

impl<P: Packet> Block<P> {
    pub(crate) fn new(graph: Subgraph<P>, role: Role<P>, ctx: Context<P>, tracer: Option<Arc<dyn Tracer>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BlockHandle {
            id: graph.block(),
            tx,
        };
        Self {
            graph,
            role,
            ctx,
            tracer,
            exposed: None,
            upstream: HashMap::new(),
            downstream: HashMap::new(),
            demand: HashMap::new(),
            failed: None,
            handle,
            rx,
        }
    }

    /// Spawn a block answering `computation` under `bounds`.
    pub(crate) fn spawn_inner(
        computation: ComputationId,
        bounds: P,
        logic: Arc<dyn Computation<P>>,
        controller: ControllerHandle<P>,
        ctx: Context<P>,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> BlockHandle<P> {
        let mut graph = Subgraph::new(BlockId::next());
        if let Some(tracer) = &tracer {
            graph = graph.with_tracer(Arc::clone(tracer));
        }
        let role = Role::Inner {
            computation,
            bounds,
            logic,
            controller,
        };
        let block = Self::new(graph, role, ctx, tracer);
        let handle = block.handle.clone();
        tokio::spawn(block.run());
        handle
    }

    fn id(&self) -> BlockId {
        self.handle.id
    }

    /// Run the event loop until a Shutdown message, or until a root block has
    /// reported its outcome.
    pub(crate) async fn run(mut self) {
        debug!(block = %self.id(), "block started");
        self.start();

        while let Some(msg) = self.rx.recv().await {
            match msg {
                BlockMsg::Pull { output, input } => self.step(|graph| graph.pull(output, input)),
                BlockMsg::Receive {
                    input,
                    output,
                    packet,
                } => self.step(|graph| graph.receive(input, output, packet)),
                BlockMsg::EstablishConnection(connector) => self.establish(connector),
                BlockMsg::FinishConnection {
                    input,
                    output,
                    answerer,
                } => {
                    trace!(block = %self.id(), %input, %output, "connection finished");
                    self.upstream.insert(input, answerer);
                    self.step(|graph| graph.connect_input(input, output));
                }
                BlockMsg::Produced { source, item } => self.step(|graph| graph.produce(source, item)),
                BlockMsg::Failed { error } => self.fail(error),
                BlockMsg::PullRoot => self.pull_root(),
                BlockMsg::Cancel => self.cancel_root(),
                BlockMsg::RootFinished(outcome) => self.root_finished(outcome),
                BlockMsg::Shutdown => {
                    debug!(block = %self.id(), "block received shutdown");
                    break;
                }
            }
            if self.root_done() {
                break;
            }
        }

        debug!(block = %self.id(), "block stopped");
    }

    #[tracing::instrument(skip_all, fields(block = %self.id()))]
    fn start(&mut self) {
        match &self.role {
            Role::Inner {
                computation,
                bounds,
                logic,
                ..
            } => {
                debug!(%computation, ?bounds, "setting up");
                let logic = Arc::clone(logic);
                let bounds = bounds.clone();
                let exposed = logic
                    .set_up(&bounds, &mut self.graph)
                    .and_then(|id| self.graph.ensure_broadcast(id));
                match exposed {
                    Ok(id) => self.exposed = Some(id),
                    Err(e) => return self.fail(e),
                }
            }
            Role::Root(_) => {
                if let Err(e) = self.start_root() {
                    return self.fail(e);
                }
            }
        }
        self.apply_effects();
        self.after_start();
    }

    /// Drive the subgraph, then apply whatever it asked for.
    pub(crate) fn step<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Subgraph<P>) -> Result<(), ReactiveError>,
    {
        if self.failed.is_some() {
            return;
        }
        match f(&mut self.graph) {
            Ok(()) => self.apply_effects(),
            Err(e) => self.fail(e),
        }
    }

    pub(crate) fn apply_effects(&mut self) {
        loop {
            let effects = self.graph.drain_effects();
            if effects.is_empty() {
                return;
            }
            for effect in effects {
                if let Err(e) = self.apply(effect) {
                    return self.fail(e);
                }
            }
        }
    }

    fn apply(&mut self, effect: Effect<P>) -> Result<(), ReactiveError> {
        match effect {
            Effect::Report(report) => self
                .ctx
                .monitor
                .report(report)
                .map_err(|e| ReactiveError::ResourceClosed(e.to_string()))?,
            Effect::RemotePull { input, output } => {
                let answerer = self.upstream.get(&input).ok_or(ReactiveError::UnknownNode(input))?;
                answerer.send(BlockMsg::Pull { output, input });
            }
            Effect::RemoteSend {
                output,
                input,
                packet,
            } => {
                let requester = self
                    .downstream
                    .get(&output)
                    .ok_or(ReactiveError::UnknownNode(output))?;
                requester.send(BlockMsg::Receive {
                    input,
                    output,
                    packet,
                });
            }
            Effect::RequestConnection { input, request } => {
                self.ctx.registry.connect(Connector {
                    request,
                    input,
                    requester: self.handle.clone(),
                    tracer: self.tracer.clone(),
                })?;
            }
            Effect::Demand { source } => self.demand(source)?,
            Effect::Deliver { sink, packet } => self.deliver(sink, packet)?,
        }
        Ok(())
    }

    /// Ask a producer source for one more item. The stream is polled on its
    /// own task and every item comes back as a `Produced` message.
    fn demand(&mut self, source: Identifier) -> Result<(), ReactiveError> {
        if let Some(tx) = self.demand.get(&source) {
            let _ = tx.send(());
            return Ok(());
        }
        let Some(mut stream) = self.graph.take_stream(source)? else {
            return Err(ReactiveError::ProtocolViolation(format!(
                "producer {source} has no stream"
            )));
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let block = self.handle.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let item = stream.next().await;
                let last = !matches!(item, Some(Ok(_)));
                if !block.send(BlockMsg::Produced { source, item }) || last {
                    break;
                }
            }
        });
        let _ = tx.send(());
        self.demand.insert(source, tx);
        Ok(())
    }

    fn establish(&mut self, connector: Connector<P>) {
        let Connector {
            request,
            input,
            requester,
            ..
        } = connector;
        if let Some(error) = &self.failed {
            requester.send(BlockMsg::Failed {
                error: error.clone(),
            });
            return;
        }
        let Some(exposed) = self.exposed else {
            requester.send(BlockMsg::Failed {
                error: ReactiveError::ProtocolViolation(format!("block {} answers no requests", self.id())),
            });
            return;
        };

        match self.graph.create_output(exposed, input, &request.transforms) {
            Ok(output) => {
                debug!(block = %self.id(), %input, %output, "connection established");
                self.downstream.insert(output, requester.clone());
                // The monitor must learn this side's paths before the requester
                // reports the edge into its input.
                self.apply_effects();
                if self.failed.is_none() {
                    requester.send(BlockMsg::FinishConnection {
                        input,
                        output,
                        answerer: self.handle.clone(),
                    });
                }
            }
            Err(e) => {
                requester.send(BlockMsg::Failed { error: e.clone() });
                self.fail(e);
            }
        }
    }

    /// Enter the failed state and forward the error one hop toward every
    /// root depending on this block.
    pub(crate) fn fail(&mut self, error: ReactiveError) {
        if self.failed.is_some() {
            return;
        }
        if error.is_protocol_violation() {
            error!(block = %self.id(), %error, "protocol violation");
        } else {
            warn!(block = %self.id(), %error, "block failed");
        }
        self.graph.drain_effects();
        self.failed = Some(error.clone());

        let mut notified = HashSet::new();
        for requester in self.downstream.values() {
            if notified.insert(requester.id()) {
                requester.send(BlockMsg::Failed {
                    error: error.clone(),
                });
            }
        }

        match &mut self.role {
            Role::Inner {
                bounds, controller, ..
            } => controller.evict(bounds.clone(), self.handle.id),
            Role::Root(root) => root.fail(error, &self.ctx.monitor),
        }
    }
}
