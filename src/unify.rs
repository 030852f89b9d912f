//! Merging partial results from parallel operator instances.
//!
//! When an operator runs partitioned, each partition produces a
//! partial result per window; a unifier folds those partials into one
//! value. Combining must be pure and associative so the fold can be
//! applied in any grouping.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::StateError;

/// Fold partial per-window results into one.
///
/// `combine` must be associative and must not depend on anything but
/// its arguments; the engine is free to regroup partials across
/// partitions and replays.
pub trait Unifier {
    type Part;

    fn combine(&self, acc: Self::Part, part: Self::Part) -> Self::Part;
}

/// Fold all of a window's partials. `None` when the window produced
/// no partials at all.
pub fn unify_all<U: Unifier>(unifier: &U, parts: impl IntoIterator<Item = U::Part>) -> Option<U::Part> {
    parts.into_iter().reduce(|acc, part| unifier.combine(acc, part))
}

/// Running sum and count, the partial shape for a distributed mean.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SumCount {
    pub sum: f64,
    pub count: u64,
}

impl SumCount {
    pub fn of(value: f64) -> Self {
        Self { sum: value, count: 1 }
    }

    /// The mean this partial represents; `None` for an empty partial.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

pub struct SumCountUnifier;

impl Unifier for SumCountUnifier {
    type Part = SumCount;

    fn combine(&self, acc: SumCount, part: SumCount) -> SumCount {
        SumCount {
            sum: acc.sum + part.sum,
            count: acc.count + part.count,
        }
    }
}

/// Tagged dispatch from payload type names to decoders, for pipelines
/// that carry more than one partial shape over the same channel.
pub struct HandlerRegistry<T> {
    handlers: HashMap<&'static str, fn(&[u8]) -> Result<T>>,
}

impl<T> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, tag: &'static str, decode: fn(&[u8]) -> Result<T>) {
        self.handlers.insert(tag, decode);
    }

    /// Decode a payload by tag. An unregistered tag is an error; the
    /// caller routed a partial this registry does not know about.
    pub fn decode(&self, tag: &str, payload: &[u8]) -> Result<T> {
        let handler = self
            .handlers
            .get(tag)
            .ok_or_else(|| StateError::NotFound(format!("no handler registered for tag {tag:?}")))?;
        handler(payload)
    }
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
