//! Core identifiers and record types shared across the engine.

use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// A discrete, ordered unit of stream processing.
///
/// Window ids are assigned by the orchestration layer and strictly
/// increase per operator instance. All state and replay bookkeeping is
/// keyed off of these.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct WindowId(pub u64);

impl WindowId {
    /// The window that immediately follows this one.
    pub fn next(&self) -> WindowId {
        WindowId(self.0 + 1)
    }
}

impl Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Unique ID for an operator instance.
///
/// Replay records are keyed off of this to ensure payloads are not
/// mixed between operators.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl From<&str> for OperatorId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A hash-partitioned shard of the state key space.
///
/// The inner value is always below the configured bucket count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId(pub u64);

impl Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Key to route state within the store.
///
/// Keys are opaque byte sequences; the engine never interprets them
/// beyond hashing for bucket routing and equality within a bucket.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey(pub Vec<u8>);

impl StateKey {
    /// Route this key to its bucket.
    ///
    /// Uses seahash so routing is stable across processes and
    /// restarts.
    pub fn bucket(&self, bucket_count: u64) -> BucketId {
        BucketId(seahash::hash(&self.0) % bucket_count)
    }
}

impl From<&str> for StateKey {
    fn from(key: &str) -> Self {
        Self(key.as_bytes().to_vec())
    }
}

impl From<&[u8]> for StateKey {
    fn from(key: &[u8]) -> Self {
        Self(key.to_vec())
    }
}

/// One durable state record: a key, its value, and the window that
/// last mutated it.
///
/// The window is what retention-based purge keys off of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub key: StateKey,
    pub value: Vec<u8>,
    pub window: WindowId,
}

#[test]
fn bucket_routing_is_stable() {
    let key = StateKey::from("age");
    assert_eq!(key.bucket(16), key.bucket(16));
    assert!(key.bucket(16).0 < 16);
}

#[test]
fn window_ordering() {
    assert!(WindowId(3) < WindowId(4));
    assert_eq!(WindowId(3).next(), WindowId(4));
}
