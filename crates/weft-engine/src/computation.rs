//! The pluggable logic behind an execution unit.

use weft_reactive::{Identifier, Packet, ReactiveError, Subgraph};

/// Builds the subgraph of one execution unit for the given bounds.
///
/// Returns the node whose answers the unit exposes to its requesters. Called
/// once per unit, on the unit's own task, before it serves any connection.
pub trait Computation<P: Packet>: Send + Sync + 'static {
    fn set_up(&self, bounds: &P, graph: &mut Subgraph<P>) -> Result<Identifier, ReactiveError>;
}

impl<P, F> Computation<P> for F
where
    P: Packet,
    F: Fn(&P, &mut Subgraph<P>) -> Result<Identifier, ReactiveError> + Send + Sync + 'static,
{
    fn set_up(&self, bounds: &P, graph: &mut Subgraph<P>) -> Result<Identifier, ReactiveError> {
        self(bounds, graph)
    }
}
