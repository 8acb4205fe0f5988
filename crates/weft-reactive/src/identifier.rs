//! Identifiers for execution units and the nodes they own.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BLOCK: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    /// Allocate a fresh id. Ids are never reused within a process.
    pub fn next() -> Self {
        Self(NEXT_BLOCK.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable handle to a reactive node, scoped to the unit that owns it.
///
/// Used as the key for all monitor bookkeeping and for routing messages
/// between units. Nodes refer to each other only through identifiers, so
/// cyclic graphs never form ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    block: BlockId,
    node: u32,
}

impl Identifier {
    /// Identifiers are normally allocated by a [`crate::Subgraph`]; building one
    /// by hand is for hosts and tests addressing nodes by position.
    pub fn new(block: BlockId, node: u32) -> Self {
        Self { block, node }
    }

    /// The unit owning this node.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Arena slot of this node inside its unit.
    pub fn node(&self) -> u32 {
        self.node
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.block, self.node)
    }
}
