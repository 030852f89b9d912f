//! A hash-partitioned shard of the key space.
//!
//! Each bucket owns exactly one mutable in-memory table (writes since
//! the last checkpoint) and an ordered chain of immutable segments,
//! oldest to newest. Checkpointing flushes the table to a new segment
//! and clears it; once the chain grows past the configured threshold
//! the oldest contiguous run is merged size-tiered into one segment.
//! Superseded files are not deleted here — a prior manifest may still
//! reference them, so the coordinator garbage collects them after the
//! next manifest is published.

use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::model::BucketId;
use crate::model::StateEntry;
use crate::model::StateKey;
use crate::model::WindowId;
use crate::segment::SegmentHandle;
use crate::segment::SegmentStore;

/// Outcome of one bucket checkpoint: the segment chain the manifest
/// should record, plus any handles compaction superseded.
#[derive(Debug)]
pub(crate) struct BucketCheckpoint {
    pub(crate) segments: Vec<SegmentHandle>,
    pub(crate) superseded: Vec<SegmentHandle>,
}

#[derive(Debug)]
pub(crate) struct Bucket {
    id: BucketId,
    /// Uncommitted writes since the last checkpoint. Single-writer:
    /// the owning store serializes mutations through a mutex.
    table: HashMap<StateKey, (Vec<u8>, WindowId)>,
    /// Immutable segment chain, oldest to newest.
    segments: Vec<SegmentHandle>,
}

impl Bucket {
    pub(crate) fn new(id: BucketId) -> Self {
        Self {
            id,
            table: HashMap::new(),
            segments: Vec::new(),
        }
    }

    /// Rebuild a bucket from a manifest fragment. The mutable table
    /// starts empty; anything not in a segment was not checkpointed.
    pub(crate) fn restore(id: BucketId, segments: Vec<SegmentHandle>) -> Self {
        Self {
            id,
            table: HashMap::new(),
            segments,
        }
    }

    pub(crate) fn id(&self) -> BucketId {
        self.id
    }

    /// Insert or overwrite in the mutable table. No disk I/O.
    pub(crate) fn put(&mut self, key: StateKey, value: Vec<u8>, window: WindowId) {
        self.table.insert(key, (value, window));
    }

    /// Look up in the mutable table only. Segment lookups go through
    /// the store's cache.
    pub(crate) fn get_pending(&self, key: &StateKey) -> Option<&Vec<u8>> {
        self.table.get(key).map(|(value, _window)| value)
    }

    /// Segment chain, oldest to newest.
    pub(crate) fn segments(&self) -> &[SegmentHandle] {
        &self.segments
    }

    /// Drop pending entries last written before `horizon`. Segment
    /// entries are dropped lazily at compaction instead.
    pub(crate) fn purge_pending(&mut self, horizon: WindowId) {
        self.table.retain(|_key, (_value, window)| *window >= horizon);
    }

    /// Flush the mutable table (if non-empty) and compact if the
    /// chain has grown past the threshold.
    pub(crate) fn checkpoint(
        &mut self,
        store: &SegmentStore,
        config: &EngineConfig,
        horizon: Option<WindowId>,
    ) -> Result<BucketCheckpoint> {
        if !self.table.is_empty() {
            let mut entries: Vec<StateEntry> = self
                .table
                .drain()
                .map(|(key, (value, window))| StateEntry { key, value, window })
                .collect();
            // Deterministic file contents for a given table.
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            let handle = store.write(self.id, &entries)?;
            self.segments.push(handle);
        }

        let superseded = if self.segments.len() > config.compaction_segment_threshold {
            self.compact(store, config.compaction_target_bytes, horizon)?
        } else {
            Vec::new()
        };

        Ok(BucketCheckpoint {
            segments: self.segments.clone(),
            superseded,
        })
    }

    /// Size-tiered compaction: merge the oldest contiguous run whose
    /// combined size stays under the target. Newest entry per key
    /// wins; entries older than the retention horizon are dropped.
    /// Returns the superseded handles.
    fn compact(
        &mut self,
        store: &SegmentStore,
        target_bytes: u64,
        horizon: Option<WindowId>,
    ) -> Result<Vec<SegmentHandle>> {
        let mut run = 0;
        let mut run_bytes = 0;
        for handle in &self.segments {
            if run_bytes + handle.bytes > target_bytes && run >= 2 {
                break;
            }
            run_bytes += handle.bytes;
            run += 1;
        }
        if run < 2 {
            return Ok(Vec::new());
        }

        // Oldest to newest so later occurrences of a key win.
        let mut merged: HashMap<StateKey, (Vec<u8>, WindowId)> = HashMap::new();
        for handle in &self.segments[..run] {
            for entry in store.read(handle)? {
                merged.insert(entry.key, (entry.value, entry.window));
            }
        }
        if let Some(horizon) = horizon {
            merged.retain(|_key, (_value, window)| *window >= horizon);
        }

        let mut entries: Vec<StateEntry> = merged
            .into_iter()
            .map(|(key, (value, window))| StateEntry { key, value, window })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let superseded: Vec<SegmentHandle> = self.segments.drain(..run).collect();
        let replacement = store.write(self.id, &entries)?;
        tracing::debug!(
            "Compacted bucket {}: {run} segments ({run_bytes} bytes) into {}",
            self.id,
            replacement.file_name
        );
        self.segments.insert(0, replacement);

        Ok(superseded)
    }
}
