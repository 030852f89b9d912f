//! Spillway: windowed, recoverable operator state.
//!
//! Stream operators that hold per-key state larger than memory need
//! three things from the platform: a place to spill that state, a way
//! to roll it forward and back in lockstep with the window stream,
//! and a record of what each window emitted so restarts do not
//! double-deliver. This crate provides all three as a library, with
//! no opinion about how windows are produced.
//!
//! The pieces, bottom up:
//!
//! - [`segment`]: immutable, checksummed on-disk segment files, the
//!   unit of spilled state.
//! - `bucket` (internal): hash shards of the key space, each a
//!   mutable table plus a segment chain, compacted size-tiered.
//! - [`store`]: [`ManagedStore`], the spillable KV store operators
//!   read and write, with an LRU budget on resident segment data.
//! - [`manifest`]: versioned checkpoint manifests with an atomically
//!   swapped `CURRENT` pointer.
//! - [`coordinator`]: [`CheckpointCoordinator`], which flushes
//!   buckets, publishes manifests, garbage collects, and drives
//!   recovery and one-step rollback at startup.
//! - [`idempotent`]: [`IdempotentStorageManager`], the write-once
//!   per-window replay log.
//! - [`operator`]: [`ReplayableInput`] and the source/sink seams that
//!   tie the replay log into a window loop.
//! - [`unify`]: pure associative merging of partial results from
//!   parallel operator instances.
//!
//! Consistency model: a checkpoint at window `W` captures every
//! mutation committed at windows `<= W` and nothing later. Recovery
//! restores the newest manifest that verifies, falling back one step
//! if the current one is damaged; if no retained manifest verifies,
//! startup fails rather than serve unverified state.

pub(crate) mod bucket;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod idempotent;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod operator;
pub mod segment;
pub mod store;
pub mod unify;

pub use config::EngineConfig;
pub use coordinator::CheckpointCoordinator;
pub use coordinator::CheckpointPhase;
pub use errors::Result;
pub use errors::StateError;
pub use idempotent::IdempotentStorageManager;
pub use manifest::Manifest;
pub use manifest::ManifestStore;
pub use model::BucketId;
pub use model::OperatorId;
pub use model::StateEntry;
pub use model::StateKey;
pub use model::WindowId;
pub use operator::ReplayableInput;
pub use operator::Sink;
pub use operator::Source;
pub use store::ManagedStore;
pub use unify::SumCount;
pub use unify::SumCountUnifier;
pub use unify::Unifier;
