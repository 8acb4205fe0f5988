//! Actor runtime for Weft queries.
//!
//! This crate hosts reactive subgraphs on tokio tasks:
//! - Execution units ("blocks"), one per computation and bounds, shared
//!   between every requester asking for the same answers
//! - Controllers caching blocks per computation, and a registry routing
//!   connection requests to them
//! - Root queries delivering answers to a [`ReasonerConsumer`] and finishing
//!   when the termination monitor declares them quiescent

mod block;
mod computation;
mod consumer;
mod controller;
mod engine;
mod error;
mod options;
mod registry;
mod root;

pub use computation::Computation;
pub use consumer::{ChannelConsumer, QueryEvent, ReasonerConsumer};
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use options::{Mode, Options};
pub use root::RootHandle;
