//! Subgraph reports driven straight into the monitor state.
//!
//! Each test builds a real subgraph, feeds every report it produces to a
//! `MonitorState` in order, and checks exactly when roots complete.

use pretty_assertions::assert_eq;
use weft_monitor::{Completion, MonitorState, RootOutcome};
use weft_reactive::{BlockId, Effect, Identifier, Report, Subgraph};

struct Harness {
    graph: Subgraph<&'static str>,
    state: MonitorState,
    completions: Vec<Completion>,
}

impl Harness {
    fn new() -> Self {
        Self {
            graph: Subgraph::new(BlockId::next()),
            state: MonitorState::new(),
            completions: Vec::new(),
        }
    }

    /// Apply pending effects; returns the answers delivered to `sink`.
    fn flush(&mut self, sink: Option<Identifier>) -> Vec<&'static str> {
        let mut delivered = Vec::new();
        for effect in self.graph.drain_effects() {
            match effect {
                Effect::Report(report) => {
                    let completions = self.state.apply(report).unwrap();
                    self.completions.extend(completions);
                }
                Effect::Deliver { sink: s, packet } if Some(s) == sink => delivered.push(packet),
                _ => {}
            }
        }
        delivered
    }

    fn pull(&mut self, sink: Identifier) -> Vec<&'static str> {
        self.graph.pull_sink(sink).unwrap();
        self.flush(Some(sink))
    }

    /// A root standing outside the subgraph, subscribed to `sinks`.
    fn root_over(&mut self, sinks: &[Identifier]) -> Identifier {
        let root = Identifier::new(BlockId::next(), 0);
        self.state.register_root(root).unwrap();
        for sink in sinks {
            let completions = self
                .state
                .apply(Report::RegisterPath {
                    subscriber: root,
                    publisher: *sink,
                })
                .unwrap();
            self.completions.extend(completions);
        }
        root
    }

    fn finished(&self, root: Identifier) -> usize {
        self.completions
            .iter()
            .filter(|c| c.root == root && c.outcome == RootOutcome::Finished)
            .count()
    }
}

#[test]
fn test_broadcast_to_two_subscribers_finishes_after_both_drain() {
    let mut h = Harness::new();
    let src = h.graph.source(vec!["A", "B"]);
    let buf = h.graph.fan_out(src).unwrap();
    let s1 = h.graph.sink(buf).unwrap();
    let s2 = h.graph.sink(buf).unwrap();
    h.flush(None);
    let root = h.root_over(&[s1, s2]);

    assert_eq!(h.pull(s1), vec!["A"]);
    assert_eq!(h.pull(s2), vec!["A"]);
    assert_eq!(h.pull(s2), vec!["B"]);
    assert_eq!(h.finished(root), 0);
    let stats = h.state.root_stats(root).unwrap();
    assert_eq!(stats.active_sources, 0);
    assert_eq!(stats.active_answers, 1);

    assert_eq!(h.pull(s1), vec!["B"]);
    assert_eq!(h.finished(root), 1);

    // the finished root is never announced again
    h.graph.pull_sink(s1).unwrap();
    h.flush(Some(s1));
    assert_eq!(h.finished(root), 1);
}

#[test]
fn test_roots_sharing_a_node_finish_independently() {
    let mut h = Harness::new();
    let src = h.graph.source(vec!["A"]);
    let shared = h.graph.buffer(src).unwrap();
    let s1 = h.graph.sink(shared).unwrap();
    let s2 = h.graph.sink(shared).unwrap();
    h.flush(None);

    let merge = h.state.node_stats(shared).unwrap();
    assert_eq!(merge.merges, 1);
    assert_eq!(merge.frontiers, 1);

    let first = h.root_over(&[s1]);
    let second = h.root_over(&[s2]);
    assert_eq!(h.state.node_stats(shared).unwrap().frontiers, 0);

    assert_eq!(h.pull(s1), vec!["A"]);
    assert_eq!(h.finished(first), 1);
    assert_eq!(h.finished(second), 0);

    assert_eq!(h.pull(s2), vec!["A"]);
    assert_eq!(h.finished(second), 1);
}

#[test]
fn test_empty_flat_map_expansion_keeps_root_balanced() {
    let mut h = Harness::new();
    let src = h.graph.source(vec!["X", "Y"]);
    let expanded = h
        .graph
        .flat_map(src, |p| if p == "X" { Vec::new() } else { vec!["Y1"] })
        .unwrap();
    let sink = h.graph.sink(expanded).unwrap();
    h.flush(None);
    let root = h.root_over(&[sink]);

    assert_eq!(h.pull(sink), vec!["Y1"]);
    assert_eq!(h.finished(root), 1);
}

#[test]
fn test_counters_never_go_negative_along_a_chain() {
    let mut h = Harness::new();
    let src = h.graph.source(vec!["a", "b", "a", "c", "b"]);
    let unique = h.graph.distinct(src).unwrap();
    let sink = h.graph.sink(unique).unwrap();
    h.flush(None);
    let root = h.root_over(&[sink]);

    for _ in 0..5 {
        h.graph.pull_sink(sink).unwrap();
        for effect in h.graph.drain_effects() {
            if let Effect::Report(report) = effect {
                h.completions.extend(h.state.apply(report).unwrap());
                if let Some(stats) = h.state.root_stats(root) {
                    assert!(stats.active_answers >= 0);
                    assert!(stats.active_frontiers >= 0);
                }
            }
        }
    }
    assert_eq!(h.finished(root), 1);
}
