//! Cross-unit connection requests.

use std::fmt;
use std::sync::Arc;

/// A pure function applied to every packet crossing a connection, e.g. a
/// variable re-binding.
pub type Transform<P> = Arc<dyn Fn(P) -> P + Send + Sync>;

/// Name of a logical computation (a rule body, a conjunction).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputationId(Arc<str>);

impl ComputationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ComputationId {
    fn from(name: &str) -> Self {
        Self(Arc::from(name))
    }
}

impl From<String> for ComputationId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request for the answers of another computation under given bounds.
///
/// The pair `(computation, bounds)` identifies the answering unit; units are
/// shared between every requester asking for the same pair.
pub struct Request<P> {
    pub computation: ComputationId,
    pub bounds: P,
    pub transforms: Vec<Transform<P>>,
}

impl<P> Request<P> {
    pub fn new(computation: impl Into<ComputationId>, bounds: P) -> Self {
        Self {
            computation: computation.into(),
            bounds,
            transforms: Vec::new(),
        }
    }

    /// Apply `transform` to every answer before it leaves the answering unit.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(P) -> P + Send + Sync + 'static,
    {
        self.transforms.push(Arc::new(transform));
        self
    }
}

impl<P: Clone> Clone for Request<P> {
    fn clone(&self) -> Self {
        Self {
            computation: self.computation.clone(),
            bounds: self.bounds.clone(),
            transforms: self.transforms.clone(),
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for Request<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("computation", &self.computation)
            .field("bounds", &self.bounds)
            .field("transforms", &self.transforms.len())
            .finish()
    }
}
