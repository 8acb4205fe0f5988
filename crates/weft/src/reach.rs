//! Transitive reachability over a directed edge list.
//!
//! Each execution unit answers "which nodes are reachable from `bounds`": its
//! direct successors, plus the answers of the units for each successor. Cycles
//! are closed by the shared unit cache, and the termination monitor decides
//! when no further answer can arrive.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use miette::{IntoDiagnostic, Result, WrapErr};
use weft_engine::{Engine, EngineBuilder};
use weft_reactive::{Identifier, ReactiveError, Request, Subgraph};

pub const COMPUTATION: &str = "reach";

/// Adjacency lists keyed by source node.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    successors: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in edges {
            successors.entry(from).or_default().push(to);
        }
        Self { successors }
    }

    /// Load a JSON array of `[from, to]` pairs.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let edges: Vec<(String, String)> = serde_json::from_str(&contents)
            .into_diagnostic()
            .wrap_err("edge list must be a JSON array of [from, to] pairs")?;
        Ok(Self::from_edges(edges))
    }

    pub fn successors(&self, node: &str) -> &[String] {
        self.successors.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.values().map(Vec::len).sum()
    }
}

/// An engine with the reachability computation registered.
pub fn engine(graph: Graph) -> Engine<String> {
    register(Engine::builder(), Arc::new(graph)).build()
}

fn register(builder: EngineBuilder<String>, graph: Arc<Graph>) -> EngineBuilder<String> {
    builder.computation(
        COMPUTATION,
        move |node: &String, subgraph: &mut Subgraph<String>| -> Result<Identifier, ReactiveError> {
            let direct = subgraph.source(graph.successors(node).to_vec());
            let direct = subgraph.buffer(direct)?;
            let reachable = subgraph.fan_in();
            subgraph.attach(reachable, direct)?;
            subgraph.connector(direct, reachable, |next: &String| {
                vec![Request::new(COMPUTATION, next.clone())]
            })?;
            subgraph.distinct(reachable)
        },
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use weft_engine::Options;

    use super::*;

    fn write_edges(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_edge_list() {
        let file = write_edges(r#"[["a", "b"], ["a", "c"], ["c", "a"]]"#);
        let graph = Graph::load(file.path()).unwrap();

        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.successors("a"), ["b".to_string(), "c".to_string()]);
        assert!(graph.successors("b").is_empty());
    }

    #[test]
    fn test_load_rejects_malformed_edges() {
        let file = write_edges(r#"{"a": "b"}"#);
        assert!(Graph::load(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_reach_through_cycle() {
        let graph = Graph::from_edges(
            [("a", "b"), ("b", "a"), ("b", "c")]
                .map(|(from, to)| (from.to_string(), to.to_string())),
        );
        let engine = engine(graph);

        let mut answers = engine
            .collect(Request::new(COMPUTATION, "a".to_string()), &Options::default())
            .await
            .unwrap();
        answers.sort();

        assert_eq!(answers, vec!["a", "b", "c"]);
        engine.shutdown();
    }
}
