//! Termination detection for Weft.
//!
//! This crate provides:
//! - [`MonitorState`], the synchronous bookkeeping that decides when a root
//!   query can produce no further answers
//! - [`Monitor`], the single actor owning that state, and the cloneable
//!   [`MonitorHandle`] execution units report through

mod error;
mod monitor;
mod state;

pub use error::MonitorError;
pub use monitor::{FinishHook, Monitor, MonitorHandle, MonitorMsg};
pub use state::{Completion, MonitorState, NodeStats, RootOutcome, RootStats};
