//! Pull-driven reactive dataflow for Weft.
//!
//! This crate provides the pieces an execution unit is built from:
//! - Stable identifiers for nodes and units
//! - The closed set of reactive node variants (sources, transformers,
//!   fan-in/fan-out junctions, boundary ports, sinks)
//! - A per-unit [`Subgraph`] that runs pulls and receives to quiescence and
//!   hands everything that crosses the unit boundary back to its host as
//!   ordered [`Effect`]s
//! - [`Report`]s, the notifications the termination monitor consumes

mod error;
mod identifier;
mod node;
mod report;
mod request;
mod subgraph;
mod tracer;

use std::fmt::Debug;
use std::hash::Hash;

pub use error::ReactiveError;
pub use identifier::{BlockId, Identifier};
pub use report::Report;
pub use request::{ComputationId, Request, Transform};
pub use subgraph::{Effect, PacketStream, Subgraph};
pub use tracer::{LoggingTracer, RecordingTracer, TraceEvent, Tracer};

/// An immutable answer flowing through the graph.
///
/// Packets are moved between nodes and cloned only where a broadcast node
/// hands the same answer to several subscribers.
pub trait Packet: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Packet for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
