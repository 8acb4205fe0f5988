//! Registry actor: routes connection requests to per-computation controllers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use weft_monitor::MonitorHandle;
use weft_reactive::{ComputationId, Packet, ReactiveError};

use crate::block::{BlockMsg, Connector, Context};
use crate::computation::Computation;
use crate::controller::{Controller, ControllerHandle};

pub(crate) enum RegistryMsg<P> {
    Connect(Connector<P>),
    Shutdown,
}

/// Owns the computation table and one controller per computation in use.
pub(crate) struct Registry<P: Packet> {
    computations: HashMap<ComputationId, Arc<dyn Computation<P>>>,
    controllers: HashMap<ComputationId, ControllerHandle<P>>,
    ctx: Context<P>,
    rx: mpsc::UnboundedReceiver<RegistryMsg<P>>,
}

impl<P: Packet> Registry<P> {
    pub(crate) fn spawn(
        computations: HashMap<ComputationId, Arc<dyn Computation<P>>>,
        monitor: MonitorHandle,
    ) -> RegistryHandle<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RegistryHandle { tx };
        let registry = Self {
            computations,
            controllers: HashMap::new(),
            ctx: Context {
                registry: handle.clone(),
                monitor,
            },
            rx,
        };
        tokio::spawn(registry.run());
        handle
    }

    async fn run(mut self) {
        debug!(computations = self.computations.len(), "registry started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                RegistryMsg::Connect(connector) => self.connect(connector),
                RegistryMsg::Shutdown => {
                    debug!("registry received shutdown");
                    for controller in self.controllers.values() {
                        controller.shutdown();
                    }
                    break;
                }
            }
        }

        debug!("registry stopped");
    }

    fn connect(&mut self, connector: Connector<P>) {
        let name = connector.request.computation.clone();
        if !self.controllers.contains_key(&name) {
            let Some(logic) = self.computations.get(&name) else {
                warn!(computation = %name, "no such computation");
                connector.requester.send(BlockMsg::Failed {
                    error: ReactiveError::UnknownComputation(name.to_string()),
                });
                return;
            };
            debug!(computation = %name, "spawning controller");
            let controller = Controller::spawn(name.clone(), Arc::clone(logic), self.ctx.clone());
            self.controllers.insert(name.clone(), controller);
        }
        let Some(controller) = self.controllers.get(&name) else {
            return;
        };
        let requester = connector.requester.clone();
        if !controller.connect(connector) {
            requester.send(BlockMsg::Failed {
                error: ReactiveError::ResourceClosed(format!("controller for {name}")),
            });
        }
    }
}

/// Handle for sending messages to the [`Registry`].
pub(crate) struct RegistryHandle<P> {
    tx: mpsc::UnboundedSender<RegistryMsg<P>>,
}

impl<P> Clone for RegistryHandle<P> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<P> RegistryHandle<P> {
    pub(crate) fn connect(&self, connector: Connector<P>) -> Result<(), ReactiveError> {
        self.tx
            .send(RegistryMsg::Connect(connector))
            .map_err(|_| ReactiveError::ResourceClosed("registry".into()))
    }

    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.tx.send(RegistryMsg::Shutdown) {
            warn!(error = %e, "failed to send shutdown to registry");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
