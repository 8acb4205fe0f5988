//! Synchronous termination bookkeeping.
//!
//! For every root `R` the state maintains
//!
//! - `active_answers(R)`: for every edge `N -> S` that `R` reaches, the
//!   answers `N` created, minus the answers consumed by every node `R` reaches;
//! - `active_frontiers(R)`: the pending frontiers of every node `R` reaches;
//! - `active_sources(R)`: the unfinished sources `R` reaches.
//!
//! Roots can reach a node after answers already flowed through it, so joining
//! a node counts its history retroactively. A root finishes the first time all
//! three are zero after a message that touched it.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, trace, warn};
use weft_reactive::{Identifier, Report};

use crate::MonitorError;

/// How a root ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootOutcome {
    Finished,
    Failed(String),
}

/// A root that ended as a result of the last message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub root: Identifier,
    pub outcome: RootOutcome,
}

/// Snapshot of one root's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootStats {
    pub active_sources: usize,
    pub active_frontiers: i64,
    pub active_answers: i64,
    pub members: usize,
    pub outcome: Option<RootOutcome>,
}

/// Snapshot of one node's shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub publishers: usize,
    pub subscribers: usize,
    pub answers_created: u64,
    pub answers_consumed: u64,
    pub frontiers: i64,
    pub merges: u64,
    /// Active roots reaching this node, sorted.
    pub roots: Vec<Identifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Active,
    Finished,
}

#[derive(Debug, Default)]
struct NodeShadow {
    publishers: BTreeSet<Identifier>,
    subscribers: HashSet<Identifier>,
    /// Root -> subscribers through which that root reaches this node.
    downstream_roots: HashMap<Identifier, HashSet<Identifier>>,
    created: u64,
    consumed: u64,
    frontiers: i64,
    /// Subscribers added at a merge that no root reached this node through
    /// yet, with the roots charged a frontier for each.
    pending_merges: HashMap<Identifier, Vec<Identifier>>,
    merges: u64,
    source: Option<SourceState>,
}

impl NodeShadow {
    fn is_active_source(&self) -> bool {
        self.source == Some(SourceState::Active)
    }
}

#[derive(Debug, Default)]
struct RootShadow {
    members: HashSet<Identifier>,
    active_sources: HashSet<Identifier>,
    frontiers: i64,
    answers: i64,
    outcome: Option<RootOutcome>,
}

impl RootShadow {
    fn is_active(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Topology and counters for every tracked node and root.
#[derive(Debug, Default)]
pub struct MonitorState {
    nodes: HashMap<Identifier, NodeShadow>,
    roots: HashMap<Identifier, RootShadow>,
    touched: BTreeSet<Identifier>,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `root`. Must precede every path message reaching it.
    pub fn register_root(&mut self, root: Identifier) -> Result<(), MonitorError> {
        if self.roots.contains_key(&root) {
            return Err(MonitorError::DuplicateRoot(root));
        }
        debug!(%root, "registering root");
        self.nodes.entry(root).or_default();
        self.roots.insert(root, RootShadow::default());
        self.join(root, root, None);
        // A bare root is not finished until something touches it.
        self.touched.remove(&root);
        Ok(())
    }

    /// Apply one report and return the roots it ended.
    pub fn apply(&mut self, report: Report) -> Result<Vec<Completion>, MonitorError> {
        trace!(?report, "applying report");
        match report {
            Report::RegisterSource(id) => self.register_source(id),
            Report::SourceFinished(id) => {
                if self.roots.get(&id).is_some_and(RootShadow::is_active) {
                    return Ok(self.force_finish(id)?.into_iter().collect());
                }
                self.source_finished(id)?;
            }
            Report::RegisterPath {
                subscriber,
                publisher,
            } => self.register_path(subscriber, publisher, true),
            Report::RegisterConnection {
                subscriber,
                publisher,
            } => self.register_path(subscriber, publisher, false),
            Report::CreateAnswer(id) => self.create_answer(id)?,
            Report::ConsumeAnswer(id) => self.consume_answer(id)?,
            Report::ForkFrontier(id) => self.adjust_frontiers(id, 1),
            Report::JoinFrontier(id) => {
                let node = self.nodes.get(&id).ok_or(MonitorError::UnknownNode(id))?;
                if node.frontiers <= 0 {
                    return Err(MonitorError::UnbalancedFrontier(id));
                }
                self.adjust_frontiers(id, -1);
            }
        }
        Ok(self.settle())
    }

    /// End `root` as finished regardless of its counters.
    ///
    /// Returns `None` if the root already ended.
    pub fn force_finish(&mut self, root: Identifier) -> Result<Option<Completion>, MonitorError> {
        self.end(root, RootOutcome::Finished)
    }

    /// End `root` as failed. Later messages about its nodes no longer reach it.
    pub fn fail_root(&mut self, root: Identifier, reason: impl Into<String>) -> Result<Option<Completion>, MonitorError> {
        self.end(root, RootOutcome::Failed(reason.into()))
    }

    pub fn root_stats(&self, root: Identifier) -> Option<RootStats> {
        let shadow = self.roots.get(&root)?;
        Some(RootStats {
            active_sources: shadow.active_sources.len(),
            active_frontiers: shadow.frontiers,
            active_answers: shadow.answers,
            members: shadow.members.len(),
            outcome: shadow.outcome.clone(),
        })
    }

    pub fn node_stats(&self, node: Identifier) -> Option<NodeStats> {
        let shadow = self.nodes.get(&node)?;
        let mut roots: Vec<Identifier> = shadow.downstream_roots.keys().copied().collect();
        roots.sort();
        Some(NodeStats {
            publishers: shadow.publishers.len(),
            subscribers: shadow.subscribers.len(),
            answers_created: shadow.created,
            answers_consumed: shadow.consumed,
            frontiers: shadow.frontiers,
            merges: shadow.merges,
            roots,
        })
    }

    /// Whether `root` is registered and has not ended.
    pub fn is_active(&self, root: Identifier) -> bool {
        self.roots.get(&root).is_some_and(RootShadow::is_active)
    }

    fn register_source(&mut self, id: Identifier) {
        let node = self.nodes.entry(id).or_default();
        if node.source.is_some() {
            return;
        }
        node.source = Some(SourceState::Active);
        for root in node.downstream_roots.keys() {
            if let Some(shadow) = self.roots.get_mut(root) {
                shadow.active_sources.insert(id);
                self.touched.insert(*root);
            }
        }
    }

    fn source_finished(&mut self, id: Identifier) -> Result<(), MonitorError> {
        let node = self.nodes.get_mut(&id).ok_or(MonitorError::UnknownNode(id))?;
        node.source = Some(SourceState::Finished);
        for root in node.downstream_roots.keys() {
            if let Some(shadow) = self.roots.get_mut(root) {
                shadow.active_sources.remove(&id);
                self.touched.insert(*root);
            }
        }
        Ok(())
    }

    /// A merge opened by an uncharged path only counts: a forked frontier
    /// elsewhere holds the requesting roots open.
    fn register_path(&mut self, subscriber: Identifier, publisher: Identifier, charge: bool) {
        self.nodes.entry(subscriber).or_default();
        let node = self.nodes.entry(publisher).or_default();
        if !node.subscribers.insert(subscriber) {
            return;
        }
        if node.subscribers.len() > 1 {
            node.merges += 1;
        }
        if charge && node.subscribers.len() > 1 {
            node.frontiers += 1;
            trace!(%publisher, %subscriber, "merge opens a frontier");
            let mut charged = Vec::new();
            for root in node.downstream_roots.keys() {
                if let Some(shadow) = self.roots.get_mut(root) {
                    shadow.frontiers += 1;
                    self.touched.insert(*root);
                    charged.push(*root);
                }
            }
            node.pending_merges.insert(subscriber, charged);
        }
        let Some(sub) = self.nodes.get_mut(&subscriber) else {
            return;
        };
        sub.publishers.insert(publisher);
        let roots: Vec<Identifier> = sub.downstream_roots.keys().copied().collect();
        for root in roots {
            self.join(root, publisher, Some(subscriber));
        }
    }

    fn create_answer(&mut self, id: Identifier) -> Result<(), MonitorError> {
        let node = self.nodes.get_mut(&id).ok_or(MonitorError::UnknownNode(id))?;
        node.created += 1;
        for (root, via) in &node.downstream_roots {
            if let Some(shadow) = self.roots.get_mut(root) {
                shadow.answers += via.len() as i64;
                self.touched.insert(*root);
            }
        }
        Ok(())
    }

    fn consume_answer(&mut self, id: Identifier) -> Result<(), MonitorError> {
        let node = self.nodes.get_mut(&id).ok_or(MonitorError::UnknownNode(id))?;
        node.consumed += 1;
        for root in node.downstream_roots.keys() {
            if let Some(shadow) = self.roots.get_mut(root) {
                shadow.answers -= 1;
                self.touched.insert(*root);
            }
        }
        Ok(())
    }

    /// Fork and join frontiers arrive before a node may have any path.
    fn adjust_frontiers(&mut self, id: Identifier, delta: i64) {
        let node = self.nodes.entry(id).or_default();
        node.frontiers += delta;
        for root in node.downstream_roots.keys() {
            if let Some(shadow) = self.roots.get_mut(root) {
                shadow.frontiers += delta;
                self.touched.insert(*root);
            }
        }
    }

    /// Let `root` reach `start` through `via` and, if `start` is new to the
    /// root, everything upstream of it.
    fn join(&mut self, root: Identifier, start: Identifier, via: Option<Identifier>) {
        let Self {
            nodes,
            roots,
            touched,
        } = self;
        touched.insert(root);
        let mut work = vec![(start, via)];
        while let Some((id, via)) = work.pop() {
            let Some(node) = nodes.get_mut(&id) else {
                continue;
            };

            if let Some(via) = via {
                if let Some(charged) = node.pending_merges.remove(&via) {
                    node.frontiers -= 1;
                    for other in charged {
                        if let Some(shadow) = roots.get_mut(&other).filter(|shadow| shadow.is_active()) {
                            shadow.frontiers -= 1;
                            touched.insert(other);
                        }
                    }
                }
            }

            let Some(shadow) = roots.get_mut(&root) else {
                return;
            };
            if let Some(paths) = node.downstream_roots.get_mut(&root) {
                if let Some(via) = via {
                    if paths.insert(via) {
                        shadow.answers += node.created as i64;
                    }
                }
                continue;
            }

            node.downstream_roots.insert(root, via.into_iter().collect());
            let edges = i64::from(via.is_some());
            shadow.answers += edges * node.created as i64 - node.consumed as i64;
            // Pending merges only hold the roots charged when they opened.
            shadow.frontiers += node.frontiers - node.pending_merges.len() as i64;
            if node.is_active_source() {
                shadow.active_sources.insert(id);
            }
            shadow.members.insert(id);
            work.extend(node.publishers.iter().map(|publisher| (*publisher, Some(id))));
        }
    }

    /// Check every root touched since the last call.
    fn settle(&mut self) -> Vec<Completion> {
        let touched = std::mem::take(&mut self.touched);
        let mut completions = Vec::new();
        for root in touched {
            let Some(shadow) = self.roots.get(&root) else {
                continue;
            };
            if !shadow.is_active() {
                continue;
            }
            let outcome = if shadow.answers < 0 || shadow.frontiers < 0 {
                warn!(
                    %root,
                    answers = shadow.answers,
                    frontiers = shadow.frontiers,
                    "negative counter"
                );
                RootOutcome::Failed(format!(
                    "protocol violation: negative counter at root {root} (answers {}, frontiers {})",
                    shadow.answers, shadow.frontiers
                ))
            } else if shadow.active_sources.is_empty() && shadow.frontiers == 0 && shadow.answers == 0 {
                RootOutcome::Finished
            } else {
                continue;
            };
            self.retire(root, outcome.clone());
            completions.push(Completion { root, outcome });
        }
        completions
    }

    fn end(&mut self, root: Identifier, outcome: RootOutcome) -> Result<Option<Completion>, MonitorError> {
        let shadow = self.roots.get(&root).ok_or(MonitorError::UnknownRoot(root))?;
        if !shadow.is_active() {
            return Ok(None);
        }
        self.retire(root, outcome.clone());
        Ok(Some(Completion { root, outcome }))
    }

    fn retire(&mut self, root: Identifier, outcome: RootOutcome) {
        let Some(shadow) = self.roots.get_mut(&root) else {
            return;
        };
        debug!(%root, ?outcome, members = shadow.members.len(), "root ended");
        for member in shadow.members.drain() {
            if let Some(node) = self.nodes.get_mut(&member) {
                node.downstream_roots.remove(&root);
            }
        }
        shadow.active_sources.clear();
        shadow.outcome = Some(outcome);
        self.touched.remove(&root);
    }
}
