//! Root blocks: the sink side of one external query.

use std::sync::Arc;

use tracing::{debug, info};
use weft_monitor::{MonitorHandle, RootOutcome};
use weft_reactive::{BlockId, Identifier, Packet, ReactiveError, Request, Subgraph, Tracer};

use crate::block::{Block, BlockHandle, BlockMsg, Context, Role};
use crate::{EngineError, Mode, ReasonerConsumer};

pub(crate) struct RootSink<P> {
    sink: Identifier,
    consumer: Box<dyn ReasonerConsumer<P>>,
    mode: Mode,
    delivered: usize,
    /// A forced finish was requested; answers still in flight are dropped.
    cancelled: bool,
    /// The consumer has been told `finished` or `exception`.
    done: bool,
}

impl<P: Packet> RootSink<P> {
    /// Report a failure to the consumer, at most once.
    pub(crate) fn fail(&mut self, error: ReactiveError, monitor: &MonitorHandle) {
        if self.done {
            return;
        }
        self.done = true;
        let _ = monitor.fail_root(self.sink, error.to_string());
        self.consumer.exception(error);
    }

    fn finish(&mut self, outcome: RootOutcome) {
        if self.done {
            return;
        }
        self.done = true;
        match outcome {
            RootOutcome::Finished => {
                info!(root = %self.sink, answers = self.delivered, "query finished");
                self.consumer.finished();
            }
            RootOutcome::Failed(reason) => {
                self.consumer.exception(ReactiveError::ProtocolViolation(reason));
            }
        }
    }
}

impl<P: Packet> Block<P> {
    /// Build the root block for `request`; the caller spawns it.
    ///
    /// The subgraph is a fan-in fed by one connection, drained by the sink.
    /// The connection is forked before the sink's path exists so the root can
    /// never look quiescent while it is pending.
    pub(crate) fn root(
        request: Request<P>,
        consumer: Box<dyn ReasonerConsumer<P>>,
        mode: Mode,
        ctx: Context<P>,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> Result<(Self, RootHandle<P>), ReactiveError> {
        let mut graph = Subgraph::new(BlockId::next());
        if let Some(tracer) = &tracer {
            graph = graph.with_tracer(Arc::clone(tracer));
        }
        let fan_in = graph.fan_in();
        graph.request(fan_in, request)?;
        let sink = graph.sink(fan_in)?;

        let root = RootSink {
            sink,
            consumer,
            mode,
            delivered: 0,
            cancelled: false,
            done: false,
        };
        let block = Self::new(graph, Role::Root(root), ctx, tracer);
        let handle = RootHandle {
            root: sink,
            block: block.handle.clone(),
        };
        Ok((block, handle))
    }

    /// Register with the monitor before any buffered report leaves the block.
    pub(crate) fn start_root(&mut self) -> Result<(), ReactiveError> {
        let Role::Root(root) = &self.role else {
            return Ok(());
        };
        let block = self.handle.clone();
        self.ctx
            .monitor
            .register_root(root.sink, move |outcome| {
                block.send(BlockMsg::RootFinished(outcome));
            })
            .map_err(|e| ReactiveError::ResourceClosed(e.to_string()))
    }

    pub(crate) fn after_start(&mut self) {
        let Role::Root(root) = &mut self.role else {
            return;
        };
        debug!(root = %root.sink, mode = ?root.mode, "root started");
        let (sink, mode) = (root.sink, root.mode.clone());
        match mode {
            Mode::Bounded { limit: 0 } => {
                root.cancelled = true;
                if let Err(e) = self.ctx.monitor.force_finish(sink) {
                    self.fail(ReactiveError::ResourceClosed(e.to_string()));
                }
            }
            Mode::Exhaustive | Mode::Bounded { .. } => self.pull_root(),
            Mode::Incremental => {}
        }
    }

    pub(crate) fn pull_root(&mut self) {
        let Role::Root(root) = &self.role else {
            debug!("pull ignored by a non-root block");
            return;
        };
        if root.done || root.cancelled {
            return;
        }
        let sink = root.sink;
        self.step(|graph| graph.pull_sink(sink).map(drop));
    }

    pub(crate) fn cancel_root(&mut self) {
        let Role::Root(root) = &mut self.role else {
            return;
        };
        if root.done || root.cancelled {
            return;
        }
        debug!(root = %root.sink, "cancelling root");
        root.cancelled = true;
        if let Err(e) = self.ctx.monitor.force_finish(root.sink) {
            self.fail(ReactiveError::ResourceClosed(e.to_string()));
        }
    }

    pub(crate) fn root_finished(&mut self, outcome: RootOutcome) {
        if let Role::Root(root) = &mut self.role {
            root.finish(outcome);
        }
    }

    pub(crate) fn root_done(&self) -> bool {
        matches!(&self.role, Role::Root(root) if root.done)
    }

    /// Hand one answer to the consumer. The sink already reported its
    /// consumption, so the monitor is consistent if the consumer pulls again.
    pub(crate) fn deliver(&mut self, sink: Identifier, packet: P) -> Result<(), ReactiveError> {
        let Role::Root(root) = &mut self.role else {
            return Err(ReactiveError::ProtocolViolation(format!(
                "answer delivered to {sink} outside a root"
            )));
        };
        if root.done || root.cancelled {
            return Ok(());
        }
        root.consumer.receive_answer(packet);
        root.delivered += 1;
        match root.mode {
            Mode::Bounded { limit } if root.delivered >= limit => {
                debug!(root = %sink, limit, "answer limit reached");
                root.cancelled = true;
                self.ctx
                    .monitor
                    .force_finish(sink)
                    .map_err(|e| ReactiveError::ResourceClosed(e.to_string()))?;
            }
            Mode::Exhaustive | Mode::Bounded { .. } => {
                self.graph.pull_sink(sink)?;
            }
            Mode::Incremental => {}
        }
        Ok(())
    }
}

/// Caller-side handle of one root query.
pub struct RootHandle<P> {
    root: Identifier,
    block: BlockHandle<P>,
}

impl<P> RootHandle<P> {
    /// The root's sink, as known to the monitor.
    pub fn id(&self) -> Identifier {
        self.root
    }

    /// Ask for the next answer. A no-op while a pull is outstanding.
    pub fn pull(&self) -> Result<(), EngineError> {
        self.send(BlockMsg::PullRoot)
    }

    /// Stop the query; the consumer sees `finished`.
    pub fn cancel(&self) -> Result<(), EngineError> {
        self.send(BlockMsg::Cancel)
    }

    /// Whether the root block has stopped.
    pub fn is_done(&self) -> bool {
        self.block.is_closed()
    }

    fn send(&self, msg: BlockMsg<P>) -> Result<(), EngineError> {
        if self.block.send(msg) {
            Ok(())
        } else {
            Err(EngineError::ChannelClosed(format!("root {}", self.root)))
        }
    }
}
