//! Per-query options, consumed when the root is constructed.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// How a root drives its sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mode {
    /// Pull again after every answer until the root finishes.
    #[default]
    Exhaustive,
    /// Pull only when the caller asks through [`crate::RootHandle::pull`].
    Incremental,
    /// Pull like `Exhaustive`, then cancel once `limit` answers were delivered.
    Bounded { limit: usize },
}

/// Options for one root query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Worker threads for the runtime hosting execution units. The engine
    /// only validates it; the `weft` binary sizes its tokio runtime with it.
    pub parallelism: usize,
    /// Log every pull, receive and path registration at `trace` level.
    pub trace: bool,
    pub mode: Mode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            trace: false,
            mode: Mode::default(),
        }
    }
}

impl Options {
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.parallelism == 0 {
            return Err(EngineError::InvalidOptions(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
