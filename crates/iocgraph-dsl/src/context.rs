//! Source provenance for parsed and interpreted entities.
//!
//! Every record, field, alias, lint message and shell result carries the
//! `(source, line)` pair it came from. When files include other files (or a
//! template expands into records), the full include stack is kept, outermost
//! file first, so a diagnostic can render the whole chain.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `(source, line)` origin marker. Immutable once created.
///
/// The canonical textual rendering is `"<source>:<line>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadContext {
    pub source: String,
    pub line: usize,
}

impl LoadContext {
    pub fn new(source: impl Into<String>, line: usize) -> Self {
        Self {
            source: source.into(),
            line,
        }
    }
}

impl fmt::Display for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

/// The ordered include stack at the point an entity was defined, outermost
/// file first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullLoadContext(pub Vec<LoadContext>);

impl FullLoadContext {
    pub fn single(source: impl Into<String>, line: usize) -> Self {
        Self(vec![LoadContext::new(source, line)])
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// A new chain with `inner` appended as the innermost frame.
    pub fn pushed(&self, inner: LoadContext) -> Self {
        let mut frames = self.0.clone();
        frames.push(inner);
        Self(frames)
    }

    /// The innermost frame, i.e. the exact definition site.
    pub fn innermost(&self) -> Option<&LoadContext> {
        self.0.last()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend with every frame of `other` (used when an entity is redefined
    /// and its provenance grows rather than being replaced).
    pub fn extend_from(&mut self, other: &FullLoadContext) {
        for frame in &other.0 {
            if !self.0.contains(frame) {
                self.0.push(frame.clone());
            }
        }
    }
}

impl fmt::Display for FullLoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for frame in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{frame}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<LoadContext> for FullLoadContext {
    fn from(ctx: LoadContext) -> Self {
        Self(vec![ctx])
    }
}
