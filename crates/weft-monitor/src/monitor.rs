//! Monitor actor owning the termination state.
//!
//! Every execution unit reports through a [`MonitorHandle`]. All notifications
//! share one unbounded FIFO mailbox, so a report sent after another (by any
//! sender) is applied after it.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use weft_reactive::{Identifier, Report};

use crate::error::MonitorError;
use crate::state::{Completion, MonitorState, NodeStats, RootOutcome, RootStats};

/// Called exactly once when a root ends, unless the root is failed through
/// [`MonitorHandle::fail_root`].
pub type FinishHook = Box<dyn FnOnce(RootOutcome) + Send>;

/// Messages accepted by the [`Monitor`].
pub enum MonitorMsg {
    /// Track a new root; `on_finish` receives its outcome.
    RegisterRoot {
        root: Identifier,
        on_finish: FinishHook,
    },
    /// A topology or counter update from an execution unit.
    Report(Report),
    /// Hard cancel: finish the root without checking its counters.
    ForceFinish(Identifier),
    /// The unit owning the root failed; drop the root silently.
    FailRoot { root: Identifier, reason: String },
    RootStats {
        root: Identifier,
        response: oneshot::Sender<Option<RootStats>>,
    },
    NodeStats {
        node: Identifier,
        response: oneshot::Sender<Option<NodeStats>>,
    },
    Shutdown,
}

/// The single actor deciding when roots are finished.
pub struct Monitor {
    state: MonitorState,
    hooks: HashMap<Identifier, FinishHook>,
    rx: mpsc::UnboundedReceiver<MonitorMsg>,
}

impl Monitor {
    /// Create a monitor and a handle for sending it messages.
    pub fn new() -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            state: MonitorState::new(),
            hooks: HashMap::new(),
            rx,
        };
        (monitor, MonitorHandle { tx })
    }

    /// Run the event loop until a Shutdown message or until every handle is
    /// dropped.
    pub async fn run(mut self) {
        debug!("monitor started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                MonitorMsg::RegisterRoot { root, on_finish } => {
                    match self.state.register_root(root) {
                        Ok(()) => {
                            self.hooks.insert(root, on_finish);
                        }
                        Err(e) => error!(%root, error = %e, "failed to register root"),
                    }
                }
                MonitorMsg::Report(report) => match self.state.apply(report) {
                    Ok(completions) => self.complete(completions),
                    Err(e) => error!(?report, error = %e, "rejected report"),
                },
                MonitorMsg::ForceFinish(root) => match self.state.force_finish(root) {
                    Ok(completion) => self.complete(completion),
                    Err(e) => warn!(%root, error = %e, "cannot force finish"),
                },
                MonitorMsg::FailRoot { root, reason } => {
                    match self.state.fail_root(root, reason) {
                        Ok(_) => {
                            self.hooks.remove(&root);
                        }
                        Err(e) => warn!(%root, error = %e, "cannot fail root"),
                    }
                }
                MonitorMsg::RootStats { root, response } => {
                    let _ = response.send(self.state.root_stats(root));
                }
                MonitorMsg::NodeStats { node, response } => {
                    let _ = response.send(self.state.node_stats(node));
                }
                MonitorMsg::Shutdown => {
                    debug!("monitor received shutdown");
                    break;
                }
            }
        }

        debug!("monitor stopped");
    }

    /// Spawn the monitor as a background task.
    pub fn spawn() -> MonitorHandle {
        let (monitor, handle) = Self::new();
        tokio::spawn(async move {
            monitor.run().await;
        });
        handle
    }

    fn complete(&mut self, completions: impl IntoIterator<Item = Completion>) {
        for Completion { root, outcome } in completions {
            debug!(%root, ?outcome, "root completed");
            match self.hooks.remove(&root) {
                Some(hook) => hook(outcome),
                None => warn!(%root, "completed root has no finish hook"),
            }
        }
    }
}

/// Handle for sending messages to the [`Monitor`].
///
/// Cheap to clone; every execution unit holds one. Notifications never block.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<MonitorMsg>,
}

impl MonitorHandle {
    pub fn register_root<F>(&self, root: Identifier, on_finish: F) -> Result<(), MonitorError>
    where
        F: FnOnce(RootOutcome) + Send + 'static,
    {
        self.send(MonitorMsg::RegisterRoot {
            root,
            on_finish: Box::new(on_finish),
        })
    }

    pub fn report(&self, report: Report) -> Result<(), MonitorError> {
        self.send(MonitorMsg::Report(report))
    }

    pub fn force_finish(&self, root: Identifier) -> Result<(), MonitorError> {
        self.send(MonitorMsg::ForceFinish(root))
    }

    pub fn fail_root(&self, root: Identifier, reason: impl Into<String>) -> Result<(), MonitorError> {
        self.send(MonitorMsg::FailRoot {
            root,
            reason: reason.into(),
        })
    }

    pub async fn root_stats(&self, root: Identifier) -> Result<Option<RootStats>, MonitorError> {
        let (response, rx) = oneshot::channel();
        self.send(MonitorMsg::RootStats { root, response })?;
        rx.await.map_err(|_| MonitorError::Closed)
    }

    pub async fn node_stats(&self, node: Identifier) -> Result<Option<NodeStats>, MonitorError> {
        let (response, rx) = oneshot::channel();
        self.send(MonitorMsg::NodeStats { node, response })?;
        rx.await.map_err(|_| MonitorError::Closed)
    }

    /// Stop the monitor. Roots still active never complete.
    pub fn shutdown(&self) {
        if let Err(e) = self.tx.send(MonitorMsg::Shutdown) {
            warn!(error = %e, "failed to send shutdown to monitor");
        }
    }

    /// Check if the monitor channel is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, msg: MonitorMsg) -> Result<(), MonitorError> {
        self.tx.send(msg).map_err(|_| MonitorError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use weft_reactive::BlockId;

    use super::*;

    fn outcome_channel() -> (
        impl FnOnce(RootOutcome) + Send + 'static,
        oneshot::Receiver<RootOutcome>,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            move |outcome| {
                let _ = tx.send(outcome);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_monitor_spawn_and_shutdown() {
        let handle = Monitor::spawn();
        assert!(!handle.is_closed());

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_closed());
        assert_eq!(
            handle.report(Report::RegisterSource(Identifier::new(BlockId::next(), 0))),
            Err(MonitorError::Closed)
        );
    }

    #[tokio::test]
    async fn test_hook_fires_once_on_finish() {
        let handle = Monitor::spawn();
        let block = BlockId::next();
        let root = Identifier::new(block, 0);
        let src = Identifier::new(block, 1);
        let (hook, rx) = outcome_channel();

        handle.register_root(root, hook).unwrap();
        for report in [
            Report::RegisterSource(src),
            Report::RegisterPath {
                subscriber: root,
                publisher: src,
            },
            Report::CreateAnswer(src),
            Report::SourceFinished(src),
            Report::ConsumeAnswer(root),
        ] {
            handle.report(report).unwrap();
        }

        assert_eq!(rx.await.unwrap(), RootOutcome::Finished);
        let stats = handle.root_stats(root).await.unwrap().unwrap();
        assert_eq!(stats.outcome, Some(RootOutcome::Finished));
        assert_eq!(stats.members, 0);

        // a late duplicate consume no longer reaches the ended root
        handle.report(Report::ConsumeAnswer(root)).unwrap();
        let node = handle.node_stats(root).await.unwrap().unwrap();
        assert_eq!(node.answers_consumed, 2);
        assert!(node.roots.is_empty());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_force_finish_skips_balance() {
        let handle = Monitor::spawn();
        let block = BlockId::next();
        let root = Identifier::new(block, 0);
        let src = Identifier::new(block, 1);
        let (hook, rx) = outcome_channel();

        handle.register_root(root, hook).unwrap();
        handle.report(Report::RegisterSource(src)).unwrap();
        handle
            .report(Report::RegisterPath {
                subscriber: root,
                publisher: src,
            })
            .unwrap();
        handle.force_finish(root).unwrap();

        assert_eq!(rx.await.unwrap(), RootOutcome::Finished);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_fail_root_drops_hook() {
        let handle = Monitor::spawn();
        let root = Identifier::new(BlockId::next(), 0);
        let (hook, rx) = outcome_channel();

        handle.register_root(root, hook).unwrap();
        handle.fail_root(root, "storage closed").unwrap();

        assert!(rx.await.is_err());
        let stats = handle.root_stats(root).await.unwrap().unwrap();
        assert_eq!(stats.outcome, Some(RootOutcome::Failed("storage closed".into())));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_node_is_logged_not_fatal() {
        let handle = Monitor::spawn();
        let stray = Identifier::new(BlockId::next(), 0);
        handle.report(Report::CreateAnswer(stray)).unwrap();
        assert_eq!(handle.node_stats(stray).await.unwrap(), None);
        handle.shutdown();
    }
}
