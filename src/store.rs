//! The spillable ("managed") state store.
//!
//! Routes gets and puts to hash buckets, keeps recently read segment
//! data resident under an LRU budget, and exposes the checkpoint,
//! restore, and purge entry points the coordinator drives. Mutations
//! to one bucket are serialized through that bucket's mutex (flush
//! must observe a consistent snapshot); reads proceed against the
//! last completed write.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use crate::bucket::Bucket;
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::manifest::BucketManifest;
use crate::manifest::Manifest;
use crate::model::StateKey;
use crate::model::WindowId;
use crate::segment::SegmentHandle;
use crate::segment::SegmentStore;

/// Decoded contents of one segment, resident in memory.
struct CachedSegment {
    by_key: HashMap<StateKey, Vec<u8>>,
    last_used: u64,
}

/// LRU cache of loaded segments, budgeted in segments resident.
///
/// Only already-durable segment data lives here, so eviction can
/// never lose a pending write.
struct SegmentCache {
    budget: usize,
    tick: u64,
    resident: HashMap<String, CachedSegment>,
}

impl SegmentCache {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            tick: 0,
            resident: HashMap::new(),
        }
    }

    fn lookup(
        &mut self,
        segments: &SegmentStore,
        handle: &SegmentHandle,
        key: &StateKey,
    ) -> Result<Option<Vec<u8>>> {
        self.tick += 1;
        let tick = self.tick;

        if let Some(cached) = self.resident.get_mut(&handle.file_name) {
            cached.last_used = tick;
            return Ok(cached.by_key.get(key).cloned());
        }

        let mut by_key = HashMap::with_capacity(handle.entries as usize);
        for entry in segments.read(handle)? {
            by_key.insert(entry.key, entry.value);
        }
        let found = by_key.get(key).cloned();
        self.resident.insert(
            handle.file_name.clone(),
            CachedSegment { by_key, last_used: tick },
        );
        self.evict_to_budget();
        Ok(found)
    }

    fn evict_to_budget(&mut self) {
        while self.resident.len() > self.budget {
            let Some(oldest) = self
                .resident
                .iter()
                .min_by_key(|(_name, cached)| cached.last_used)
                .map(|(name, _cached)| name.clone())
            else {
                return;
            };
            tracing::trace!("Evicting segment {oldest} from cache");
            self.resident.remove(&oldest);
        }
    }

    fn forget(&mut self, file_names: &[String]) {
        for name in file_names {
            self.resident.remove(name);
        }
    }

    fn clear(&mut self) {
        self.resident.clear();
    }

    fn len(&self) -> usize {
        self.resident.len()
    }
}

/// Spillable key-value state for one operator instance.
pub struct ManagedStore {
    config: EngineConfig,
    segments: SegmentStore,
    buckets: Vec<Mutex<Bucket>>,
    cache: Mutex<SegmentCache>,
    retention_horizon: Mutex<Option<WindowId>>,
}

impl ManagedStore {
    /// Open a store rooted at `dir`. Buckets start empty; restoring
    /// from a manifest is the checkpoint coordinator's job.
    pub fn open(config: EngineConfig, dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        config.validate()?;
        let dir = dir.into();
        let segments = SegmentStore::open(dir.join("segments"))?;
        let buckets = (0..config.bucket_count)
            .map(|id| Mutex::new(Bucket::new(crate::model::BucketId(id))))
            .collect();
        let cache = Mutex::new(SegmentCache::new(config.cache_budget_segments));
        tracing::info!("Opened managed store at {dir:?}");
        Ok(Arc::new(Self {
            config,
            segments,
            buckets,
            cache,
            retention_horizon: Mutex::new(None),
        }))
    }

    /// Insert or overwrite a key. Visible to subsequent `get`s in
    /// this process immediately; durable at the next checkpoint. No
    /// disk I/O on this path.
    pub fn put(&self, key: StateKey, value: Vec<u8>, window: WindowId) {
        let bucket = &self.buckets[key.bucket(self.config.bucket_count).0 as usize];
        bucket.lock().unwrap().put(key, value, window);
    }

    /// Look up a key: the bucket's mutable table first, then its
    /// segment chain newest to oldest, loading and caching segments
    /// lazily. Absent keys are `Ok(None)` — not an error.
    pub fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>> {
        let bucket = &self.buckets[key.bucket(self.config.bucket_count).0 as usize];
        let chain: Vec<SegmentHandle> = {
            let bucket = bucket.lock().unwrap();
            if let Some(value) = bucket.get_pending(key) {
                return Ok(Some(value.clone()));
            }
            bucket.segments().to_vec()
        };

        let mut cache = self.cache.lock().unwrap();
        for handle in chain.iter().rev() {
            if let Some(value) = cache.lookup(&self.segments, handle, key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Register a retention horizon. Pending entries last written
    /// before it are dropped now; segment entries at the next
    /// compaction, not eagerly per write.
    pub fn purge(&self, horizon: WindowId) {
        for slot in &self.buckets {
            slot.lock().unwrap().purge_pending(horizon);
        }
        *self.retention_horizon.lock().unwrap() = Some(horizon);
        tracing::debug!("Retention horizon set to window {horizon}");
    }

    /// Drop all cached segment data. Subsequent gets reload (and
    /// re-verify) from disk.
    pub fn drop_caches(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Flush one bucket and return its manifest fragment. Called by
    /// the coordinator, possibly from several worker threads at once;
    /// buckets are independent so there is no cross-bucket ordering.
    pub(crate) fn checkpoint_bucket(&self, index: usize) -> Result<BucketManifest> {
        let horizon = *self.retention_horizon.lock().unwrap();
        let mut bucket = self.buckets[index].lock().unwrap();
        let result = bucket.checkpoint(&self.segments, &self.config, horizon)?;
        if !result.superseded.is_empty() {
            let names: Vec<String> = result
                .superseded
                .iter()
                .map(|handle| handle.file_name.clone())
                .collect();
            self.cache.lock().unwrap().forget(&names);
        }
        Ok(BucketManifest {
            bucket: bucket.id(),
            segments: result.segments,
        })
    }

    /// Replace all bucket chains with the ones a manifest describes.
    pub(crate) fn restore(&self, manifest: &Manifest) -> Result<()> {
        let mut by_bucket: HashMap<u64, Vec<SegmentHandle>> = HashMap::new();
        for fragment in &manifest.buckets {
            by_bucket.insert(fragment.bucket.0, fragment.segments.clone());
        }
        for (index, slot) in self.buckets.iter().enumerate() {
            let id = crate::model::BucketId(index as u64);
            let segments = by_bucket.remove(&(index as u64)).unwrap_or_default();
            *slot.lock().unwrap() = Bucket::restore(id, segments);
        }
        self.drop_caches();
        tracing::info!(
            "Restored store from manifest for window {}",
            manifest.window
        );
        Ok(())
    }

    /// Delete segment files no retained manifest references and no
    /// live bucket chain holds. Runs after a manifest is published,
    /// so a crash mid-GC only strands garbage files.
    pub(crate) fn remove_unreferenced(&self, referenced: &HashSet<String>) -> Result<usize> {
        let mut live = referenced.clone();
        for slot in &self.buckets {
            let bucket = slot.lock().unwrap();
            for handle in bucket.segments() {
                live.insert(handle.file_name.clone());
            }
        }

        let mut removed = 0;
        for name in self.segments.list()? {
            if !live.contains(&name) {
                self.segments.remove_file(&name)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!("Garbage collected {removed} unreferenced segment files");
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn cached_segments(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

/// Convenience for tests and callers that lay the store out under a
/// shared engine root.
pub fn segments_dir(root: &Path) -> PathBuf {
    root.join("segments")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(config: EngineConfig, dir: &Path) -> Arc<ManagedStore> {
        ManagedStore::open(config, dir).unwrap()
    }

    fn checkpoint_all(store: &ManagedStore) {
        for index in 0..store.bucket_count() {
            store.checkpoint_bucket(index).unwrap();
        }
    }

    #[test]
    fn read_your_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(EngineConfig::default(), dir.path());

        store.put(StateKey::from("age"), b"Male".to_vec(), WindowId(1));
        assert_eq!(
            store.get(&StateKey::from("age")).unwrap(),
            Some(b"Male".to_vec())
        );
    }

    #[test]
    fn get_survives_cache_drop_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(EngineConfig::default(), dir.path());

        store.put(StateKey::from("age"), b"Male".to_vec(), WindowId(1));
        checkpoint_all(&store);
        store.drop_caches();

        assert_eq!(
            store.get(&StateKey::from("age")).unwrap(),
            Some(b"Male".to_vec())
        );
    }

    #[test]
    fn newer_segment_shadows_older() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(EngineConfig::default(), dir.path());

        store.put(StateKey::from("k"), b"old".to_vec(), WindowId(1));
        checkpoint_all(&store);
        store.put(StateKey::from("k"), b"new".to_vec(), WindowId(2));
        checkpoint_all(&store);
        store.drop_caches();

        assert_eq!(store.get(&StateKey::from("k")).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn purge_drops_expired_pending_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(EngineConfig::default(), dir.path());

        store.put(StateKey::from("stale"), b"x".to_vec(), WindowId(1));
        store.put(StateKey::from("fresh"), b"y".to_vec(), WindowId(5));
        store.purge(WindowId(5));

        assert_eq!(store.get(&StateKey::from("stale")).unwrap(), None);
        assert_eq!(
            store.get(&StateKey::from("fresh")).unwrap(),
            Some(b"y".to_vec())
        );
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(EngineConfig::default(), dir.path());
        assert_eq!(store.get(&StateKey::from("nope")).unwrap(), None);
    }

    #[test]
    fn cache_stays_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            bucket_count: 1,
            cache_budget_segments: 2,
            // Keep the chain long: no compaction in this test.
            compaction_segment_threshold: 100,
            ..Default::default()
        };
        let store = store_with(config, dir.path());

        for window in 1..=5u64 {
            store.put(
                StateKey::from(format!("k{window}").as_str()),
                b"v".to_vec(),
                WindowId(window),
            );
            checkpoint_all(&store);
        }
        store.drop_caches();

        // Each miss walks the chain until the key is found, loading
        // segments as it goes; the budget still caps residency.
        for window in 1..=5u64 {
            store
                .get(&StateKey::from(format!("k{window}").as_str()))
                .unwrap()
                .unwrap();
            assert!(store.cached_segments() <= 2);
        }
    }
}
