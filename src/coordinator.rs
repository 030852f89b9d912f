//! Checkpoint coordination and restart-time recovery.
//!
//! The coordinator drives the `Idle -> Flushing -> Publishing -> Idle`
//! cycle: flush every bucket (in parallel, buckets are independent),
//! publish a manifest describing the resulting segment sets, then
//! garbage collect manifests and segments nothing retained references.
//! Bucket flushes run on a tokio runtime's blocking pool so segment
//! I/O stays off whatever latency-sensitive thread called in. If
//! anything fails before the `CURRENT` pointer swap, the attempt is
//! abandoned and the prior manifest remains the checkpoint of record.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::runtime::Runtime;

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::errors::StateError;
use crate::manifest::Manifest;
use crate::manifest::ManifestStore;
use crate::model::WindowId;
use crate::store::ManagedStore;

/// Where the coordinator is in its checkpoint cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckpointPhase {
    Idle,
    Flushing,
    Publishing,
}

pub struct CheckpointCoordinator {
    config: EngineConfig,
    manifests: ManifestStore,
    rt: Runtime,
    phase: CheckpointPhase,
    last_published: Option<WindowId>,
    last_published_name: Option<String>,
}

impl CheckpointCoordinator {
    /// Build a coordinator over the manifest directory under `dir`
    /// (the same engine root the store was opened at).
    pub fn new(config: EngineConfig, dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        let manifests = ManifestStore::open(dir.join("manifests"))?;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(StateError::io(&dir))?;
        Ok(Self {
            config,
            manifests,
            rt,
            phase: CheckpointPhase::Idle,
            last_published: None,
            last_published_name: None,
        })
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    /// The window of the last published checkpoint, if any.
    pub fn last_published(&self) -> Option<WindowId> {
        self.last_published
    }

    /// Checkpoint if `window` is due per the configured interval.
    /// Returns the checkpointed window when one was taken.
    pub fn maybe_checkpoint(
        &mut self,
        store: &Arc<ManagedStore>,
        window: WindowId,
    ) -> Result<Option<WindowId>> {
        let due = self
            .last_published
            .map_or(true, |last| window.0 >= last.0 + self.config.checkpoint_interval_windows);
        if due {
            self.checkpoint(store, window)?;
            Ok(Some(window))
        } else {
            Ok(None)
        }
    }

    /// Take a checkpoint covering all windows up to and including
    /// `window`. All mutations committed at windows <= `window` are
    /// reflected; none after (the caller is between windows).
    pub fn checkpoint(&mut self, store: &Arc<ManagedStore>, window: WindowId) -> Result<String> {
        self.phase = CheckpointPhase::Flushing;
        let result = self.run_checkpoint(store, window);
        // Success or failure, the cycle ends Idle; a failed attempt
        // never touched the CURRENT pointer.
        self.phase = CheckpointPhase::Idle;
        if result.is_err() {
            tracing::warn!("Checkpoint for window {window} abandoned");
        }
        result
    }

    fn run_checkpoint(&mut self, store: &Arc<ManagedStore>, window: WindowId) -> Result<String> {
        tracing::debug!("Flushing {} buckets for window {window}", store.bucket_count());
        let mut tasks = Vec::with_capacity(store.bucket_count());
        for index in 0..store.bucket_count() {
            let store = store.clone();
            tasks.push(
                self.rt
                    .spawn_blocking(move || store.checkpoint_bucket(index)),
            );
        }
        let mut fragments = Vec::with_capacity(tasks.len());
        for task in tasks {
            fragments.push(self.rt.block_on(task).expect("bucket flush task panicked")?);
        }
        fragments.sort_by_key(|fragment| fragment.bucket);

        self.phase = CheckpointPhase::Publishing;
        let manifest = Manifest {
            window,
            created_at: Utc::now(),
            previous: self.last_published_name.clone(),
            buckets: fragments,
        };
        let name = self.manifests.publish(&manifest)?;
        self.last_published = Some(window);
        self.last_published_name = Some(name.clone());

        self.collect_garbage(store)?;
        Ok(name)
    }

    /// Drop manifests beyond the retention count, then segment files
    /// no retained manifest references. Runs only after a successful
    /// publish, so every file deleted is unreachable from any
    /// recoverable checkpoint.
    fn collect_garbage(&self, store: &Arc<ManagedStore>) -> Result<()> {
        let kept = self.manifests.prune(self.config.retained_manifests)?;
        let referenced = self.manifests.referenced_segments(&kept)?;
        store.remove_unreferenced(&referenced)?;
        Ok(())
    }

    /// Restore the store from the newest recoverable manifest.
    ///
    /// Returns the checkpointed window, or `None` on a fresh start.
    /// If manifests exist but none verifies, the error is fatal and
    /// startup must fail rather than serve unverified state.
    pub fn recover(&mut self, store: &Arc<ManagedStore>) -> Result<Option<WindowId>> {
        match self.manifests.recover()? {
            Some((name, manifest)) => {
                store.restore(&manifest)?;
                self.last_published = Some(manifest.window);
                self.last_published_name = Some(name);
                Ok(self.last_published)
            }
            None => {
                tracing::info!("No checkpoint on disk; starting fresh");
                Ok(None)
            }
        }
    }

    /// One-step rollback to the prior manifest, invoked when the
    /// store reports corruption under the current checkpoint.
    pub fn rollback(&mut self, store: &Arc<ManagedStore>) -> Result<WindowId> {
        let current = self
            .last_published_name
            .clone()
            .or(self.manifests.current_name()?)
            .ok_or(StateError::Unrecoverable)?;
        let previous = self
            .manifests
            .predecessor_of(&current)?
            .ok_or(StateError::Unrecoverable)?;
        let manifest = self.manifests.load(&previous)?;
        store.restore(&manifest)?;
        self.manifests.publish(&manifest)?;
        // The manifest rolled away from must not be a fallback target
        // for any later recovery.
        self.manifests.remove(&current)?;
        self.last_published = Some(manifest.window);
        self.last_published_name = Some(previous.clone());
        tracing::warn!(
            "Rolled back to manifest {previous} (window {})",
            manifest.window
        );
        Ok(manifest.window)
    }

    /// True when window progression has outrun checkpointing past the
    /// configured lag. The orchestration layer should pause the
    /// window stream until a checkpoint lands.
    pub fn should_pause(&self, window: WindowId) -> bool {
        let base = self.last_published.map_or(0, |last| last.0);
        window.0.saturating_sub(base) > self.config.checkpoint_lag_threshold
    }

    /// Teardown: abandon any in-flight checkpoint. Nothing already
    /// published is affected; the `CURRENT` pointer is untouched.
    pub fn abandon(&mut self) {
        if self.phase != CheckpointPhase::Idle {
            tracing::warn!("Abandoning in-flight checkpoint during teardown");
            self.phase = CheckpointPhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateKey;

    fn small_config() -> EngineConfig {
        EngineConfig {
            bucket_count: 2,
            checkpoint_interval_windows: 2,
            checkpoint_lag_threshold: 3,
            ..Default::default()
        }
    }

    fn open(dir: &std::path::Path) -> (Arc<ManagedStore>, CheckpointCoordinator) {
        let store = ManagedStore::open(small_config(), dir).unwrap();
        let coordinator = CheckpointCoordinator::new(small_config(), dir).unwrap();
        (store, coordinator)
    }

    #[test]
    fn checkpoint_restores_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, mut coordinator) = open(dir.path());
            store.put(StateKey::from("age"), b"Male".to_vec(), WindowId(1));
            coordinator.checkpoint(&store, WindowId(1)).unwrap();
        }

        let (store, mut coordinator) = open(dir.path());
        assert_eq!(
            coordinator.recover(&store).unwrap(),
            Some(WindowId(1))
        );
        assert_eq!(
            store.get(&StateKey::from("age")).unwrap(),
            Some(b"Male".to_vec())
        );
    }

    #[test]
    fn interval_gates_maybe_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut coordinator) = open(dir.path());

        assert!(coordinator
            .maybe_checkpoint(&store, WindowId(1))
            .unwrap()
            .is_some());
        assert!(coordinator
            .maybe_checkpoint(&store, WindowId(2))
            .unwrap()
            .is_none());
        assert!(coordinator
            .maybe_checkpoint(&store, WindowId(3))
            .unwrap()
            .is_some());
    }

    #[test]
    fn crash_before_pointer_swap_exposes_prior_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, mut coordinator) = open(dir.path());
            store.put(StateKey::from("k"), b"first".to_vec(), WindowId(1));
            coordinator.checkpoint(&store, WindowId(1)).unwrap();

            // Second checkpoint crashes after Flushing: segments and
            // even the manifest file land on disk, but the CURRENT
            // pointer is never swapped.
            store.put(StateKey::from("k"), b"second".to_vec(), WindowId(2));
            let mut fragments = Vec::new();
            for index in 0..store.bucket_count() {
                fragments.push(store.checkpoint_bucket(index).unwrap());
            }
            let manifests = ManifestStore::open(dir.path().join("manifests")).unwrap();
            manifests
                .write_manifest_file(&Manifest {
                    window: WindowId(2),
                    created_at: Utc::now(),
                    previous: None,
                    buckets: fragments,
                })
                .unwrap();
        }

        let (store, mut coordinator) = open(dir.path());
        assert_eq!(coordinator.recover(&store).unwrap(), Some(WindowId(1)));
        assert_eq!(
            store.get(&StateKey::from("k")).unwrap(),
            Some(b"first".to_vec())
        );
    }

    #[test]
    fn rollback_steps_back_one_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut coordinator) = open(dir.path());

        store.put(StateKey::from("k"), b"v1".to_vec(), WindowId(1));
        coordinator.checkpoint(&store, WindowId(1)).unwrap();
        store.put(StateKey::from("k"), b"v2".to_vec(), WindowId(2));
        coordinator.checkpoint(&store, WindowId(2)).unwrap();

        let window = coordinator.rollback(&store).unwrap();
        assert_eq!(window, WindowId(1));
        assert_eq!(
            store.get(&StateKey::from("k")).unwrap(),
            Some(b"v1".to_vec())
        );
    }

    #[test]
    fn pause_signal_tracks_checkpoint_lag() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut coordinator) = open(dir.path());

        assert!(!coordinator.should_pause(WindowId(3)));
        assert!(coordinator.should_pause(WindowId(4)));

        coordinator.checkpoint(&store, WindowId(4)).unwrap();
        assert!(!coordinator.should_pause(WindowId(5)));
    }

    #[test]
    fn garbage_collection_bounds_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut coordinator) = open(dir.path());

        for window in 1..=6u64 {
            store.put(
                StateKey::from("k"),
                format!("v{window}").into_bytes(),
                WindowId(window),
            );
            coordinator.checkpoint(&store, WindowId(window)).unwrap();
        }

        let manifests = ManifestStore::open(dir.path().join("manifests")).unwrap();
        assert_eq!(manifests.list().unwrap().len(), 2);

        // Everything still reachable after GC.
        store.drop_caches();
        assert_eq!(
            store.get(&StateKey::from("k")).unwrap(),
            Some(b"v6".to_vec())
        );
    }
}
