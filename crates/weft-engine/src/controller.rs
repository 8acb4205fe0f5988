//! Controller actor: one per computation, caching one block per bounds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use weft_reactive::{BlockId, ComputationId, Packet};

use crate::block::{Block, BlockHandle, BlockMsg, Connector, Context};
use crate::computation::Computation;

pub(crate) enum ControllerMsg<P> {
    /// Route a connection request to the block answering its bounds.
    Connect(Connector<P>),
    /// Forget a failed block so the next request for `bounds` starts over.
    Evict { bounds: P, block: BlockId },
    Shutdown,
}

/// Lazily creates and caches the blocks answering one computation, so every
/// requester asking for the same bounds shares one block.
pub(crate) struct Controller<P: Packet> {
    computation: ComputationId,
    logic: Arc<dyn Computation<P>>,
    blocks: HashMap<P, BlockHandle<P>>,
    ctx: Context<P>,
    handle: ControllerHandle<P>,
    rx: mpsc::UnboundedReceiver<ControllerMsg<P>>,
}

impl<P: Packet> Controller<P> {
    pub(crate) fn spawn(computation: ComputationId, logic: Arc<dyn Computation<P>>, ctx: Context<P>) -> ControllerHandle<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ControllerHandle { tx };
        let controller = Self {
            computation,
            logic,
            blocks: HashMap::new(),
            ctx,
            handle: handle.clone(),
            rx,
        };
        tokio::spawn(controller.run());
        handle
    }

    async fn run(mut self) {
        debug!(computation = %self.computation, "controller started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ControllerMsg::Connect(connector) => self.connect(connector),
                ControllerMsg::Evict { bounds, block } => {
                    if self.blocks.get(&bounds).is_some_and(|cached| cached.id() == block) {
                        debug!(computation = %self.computation, ?bounds, %block, "evicting failed block");
                        self.blocks.remove(&bounds);
                    }
                }
                ControllerMsg::Shutdown => {
                    debug!(computation = %self.computation, "controller received shutdown");
                    for block in self.blocks.values() {
                        block.send(BlockMsg::Shutdown);
                    }
                    break;
                }
            }
        }

        debug!(computation = %self.computation, "controller stopped");
    }

    fn connect(&mut self, connector: Connector<P>) {
        let bounds = &connector.request.bounds;
        let block = match self.blocks.get(bounds) {
            Some(block) => {
                trace!(computation = %self.computation, ?bounds, "cache hit");
                block.clone()
            }
            None => {
                debug!(computation = %self.computation, ?bounds, "spawning block");
                let block = Block::spawn_inner(
                    self.computation.clone(),
                    bounds.clone(),
                    Arc::clone(&self.logic),
                    self.handle.clone(),
                    self.ctx.clone(),
                    connector.tracer.clone(),
                );
                self.blocks.insert(bounds.clone(), block.clone());
                block
            }
        };
        if !block.send(BlockMsg::EstablishConnection(connector)) {
            warn!(computation = %self.computation, block = %block.id(), "cached block stopped");
        }
    }
}

/// Handle for sending messages to a [`Controller`].
pub(crate) struct ControllerHandle<P> {
    tx: mpsc::UnboundedSender<ControllerMsg<P>>,
}

impl<P> Clone for ControllerHandle<P> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<P> ControllerHandle<P> {
    /// Returns `false` if the controller has stopped.
    pub(crate) fn connect(&self, connector: Connector<P>) -> bool {
        self.tx.send(ControllerMsg::Connect(connector)).is_ok()
    }

    pub(crate) fn evict(&self, bounds: P, block: BlockId) {
        let _ = self.tx.send(ControllerMsg::Evict { bounds, block });
    }

    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.tx.send(ControllerMsg::Shutdown) {
            warn!(error = %e, "failed to send shutdown to controller");
        }
    }
}
