//! Engine entry point: computation table, shared actors and root queries.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use weft_monitor::{Monitor, MonitorHandle};
use weft_reactive::{ComputationId, LoggingTracer, Packet, Request, Tracer};

use crate::block::{Block, Context};
use crate::computation::Computation;
use crate::consumer::{ChannelConsumer, QueryEvent, ReasonerConsumer};
use crate::registry::{Registry, RegistryHandle};
use crate::root::RootHandle;
use crate::{EngineError, Mode, Options};

/// Collects computations before the engine's actors are started.
pub struct EngineBuilder<P: Packet> {
    computations: HashMap<ComputationId, Arc<dyn Computation<P>>>,
}

impl<P: Packet> Default for EngineBuilder<P> {
    fn default() -> Self {
        Self {
            computations: HashMap::new(),
        }
    }
}

impl<P: Packet> EngineBuilder<P> {
    /// Register `computation` under `id`, replacing any earlier registration.
    pub fn computation<C>(mut self, id: impl Into<ComputationId>, computation: C) -> Self
    where
        C: Computation<P>,
    {
        self.computations.insert(id.into(), Arc::new(computation));
        self
    }

    /// Spawn the monitor and the registry. Must run inside a tokio runtime.
    pub fn build(self) -> Engine<P> {
        let monitor = Monitor::spawn();
        let registry = Registry::spawn(self.computations, monitor.clone());
        Engine { registry, monitor }
    }
}

/// A running engine. Execution units are shared between all its queries.
pub struct Engine<P: Packet> {
    registry: RegistryHandle<P>,
    monitor: MonitorHandle,
}

impl<P: Packet> Engine<P> {
    pub fn builder() -> EngineBuilder<P> {
        EngineBuilder::default()
    }

    /// Start a root query; answers and the outcome go to `consumer`.
    pub fn query<C>(&self, request: Request<P>, consumer: C, options: &Options) -> Result<RootHandle<P>, EngineError>
    where
        C: ReasonerConsumer<P>,
    {
        options.validate()?;
        if self.registry.is_closed() {
            return Err(EngineError::ChannelClosed("registry".into()));
        }
        let tracer: Option<Arc<dyn Tracer>> = if options.trace {
            Some(Arc::new(LoggingTracer))
        } else {
            None
        };
        let computation = request.computation.clone();
        let ctx = Context {
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
        };
        let (block, handle) = Block::root(request, Box::new(consumer), options.mode.clone(), ctx, tracer)?;
        info!(root = %handle.id(), %computation, mode = ?options.mode, "query started");
        tokio::spawn(block.run());
        Ok(handle)
    }

    /// Run a query to completion and return its answers in delivery order.
    ///
    /// In incremental mode every answer is pulled as soon as the previous
    /// one arrives.
    pub async fn collect(&self, request: Request<P>, options: &Options) -> Result<Vec<P>, EngineError> {
        let (consumer, mut events) = ChannelConsumer::new();
        let handle = self.query(request, consumer, options)?;
        let incremental = options.mode == Mode::Incremental;
        if incremental {
            handle.pull()?;
        }

        let mut answers = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                QueryEvent::Answer(answer) => {
                    answers.push(answer);
                    if incremental {
                        // The root may already have finished.
                        let _ = handle.pull();
                    }
                }
                QueryEvent::Finished => {
                    debug!(root = %handle.id(), answers = answers.len(), "collected");
                    return Ok(answers);
                }
                QueryEvent::Exception(error) => return Err(error.into()),
            }
        }
        Err(EngineError::ChannelClosed(format!("root {}", handle.id())))
    }

    pub fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    /// Stop the registry, every controller and block, and the monitor.
    /// Queries still running never complete.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.monitor.shutdown();
    }
}
