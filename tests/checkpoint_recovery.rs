//! End-to-end checkpoint, recovery, and rollback scenarios over a
//! real on-disk engine root.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use spillway::CheckpointCoordinator;
use spillway::EngineConfig;
use spillway::ManagedStore;
use spillway::StateError;
use spillway::StateKey;
use spillway::WindowId;

fn config() -> EngineConfig {
    EngineConfig {
        bucket_count: 4,
        compaction_segment_threshold: 3,
        ..Default::default()
    }
}

fn open(root: &Path) -> (Arc<ManagedStore>, CheckpointCoordinator) {
    let store = ManagedStore::open(config(), root).unwrap();
    let coordinator = CheckpointCoordinator::new(config(), root).unwrap();
    (store, coordinator)
}

fn key(n: u32) -> StateKey {
    StateKey::from(format!("key-{n:04}").as_str())
}

/// Corrupt every manifest file on disk except those in `spare`.
fn corrupt_manifests(root: &Path, spare: &[&str]) {
    let dir = root.join("manifests");
    for entry in fs::read_dir(&dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("MANIFEST-") || spare.contains(&name.as_str()) {
            continue;
        }
        let path = dir.join(&name);
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&path, bytes).unwrap();
    }
}

#[test]
fn full_state_survives_restart() {
    let root = tempfile::tempdir().unwrap();

    {
        let (store, mut coordinator) = open(root.path());
        for window in 1..=5u64 {
            for n in 0..50u32 {
                store.put(
                    key(n),
                    format!("w{window}-v{n}").into_bytes(),
                    WindowId(window),
                );
            }
            coordinator.checkpoint(&store, WindowId(window)).unwrap();
        }
    }

    let (store, mut coordinator) = open(root.path());
    assert_eq!(coordinator.recover(&store).unwrap(), Some(WindowId(5)));
    for n in 0..50u32 {
        assert_eq!(
            store.get(&key(n)).unwrap(),
            Some(format!("w5-v{n}").into_bytes()),
            "key-{n:04} after restart"
        );
    }
}

#[test]
fn uncheckpointed_writes_are_lost_on_restart() {
    let root = tempfile::tempdir().unwrap();

    {
        let (store, mut coordinator) = open(root.path());
        store.put(key(1), b"durable".to_vec(), WindowId(1));
        coordinator.checkpoint(&store, WindowId(1)).unwrap();
        store.put(key(1), b"lost".to_vec(), WindowId(2));
        store.put(key(2), b"also lost".to_vec(), WindowId(2));
        // No checkpoint before the crash.
    }

    let (store, mut coordinator) = open(root.path());
    coordinator.recover(&store).unwrap();
    assert_eq!(store.get(&key(1)).unwrap(), Some(b"durable".to_vec()));
    assert_eq!(store.get(&key(2)).unwrap(), None);
}

#[test]
fn corrupt_current_manifest_recovers_one_window_back() {
    let root = tempfile::tempdir().unwrap();

    let (first, second) = {
        let (store, mut coordinator) = open(root.path());
        store.put(key(1), b"v1".to_vec(), WindowId(1));
        let first = coordinator.checkpoint(&store, WindowId(1)).unwrap();
        store.put(key(1), b"v2".to_vec(), WindowId(2));
        let second = coordinator.checkpoint(&store, WindowId(2)).unwrap();
        (first, second)
    };

    corrupt_manifests(root.path(), &[first.as_str()]);
    let _ = second;

    let (store, mut coordinator) = open(root.path());
    assert_eq!(coordinator.recover(&store).unwrap(), Some(WindowId(1)));
    assert_eq!(store.get(&key(1)).unwrap(), Some(b"v1".to_vec()));
}

#[test]
fn all_manifests_corrupt_refuses_to_start() {
    let root = tempfile::tempdir().unwrap();

    {
        let (store, mut coordinator) = open(root.path());
        store.put(key(1), b"v1".to_vec(), WindowId(1));
        coordinator.checkpoint(&store, WindowId(1)).unwrap();
        store.put(key(1), b"v2".to_vec(), WindowId(2));
        coordinator.checkpoint(&store, WindowId(2)).unwrap();
    }

    corrupt_manifests(root.path(), &[]);

    let (store, mut coordinator) = open(root.path());
    assert!(matches!(
        coordinator.recover(&store),
        Err(StateError::Unrecoverable)
    ));
}

#[test]
fn explicit_rollback_restores_prior_window() {
    let root = tempfile::tempdir().unwrap();
    let (store, mut coordinator) = open(root.path());

    for n in 0..20u32 {
        store.put(key(n), b"good".to_vec(), WindowId(1));
    }
    coordinator.checkpoint(&store, WindowId(1)).unwrap();
    for n in 0..20u32 {
        store.put(key(n), b"bad".to_vec(), WindowId(2));
    }
    coordinator.checkpoint(&store, WindowId(2)).unwrap();

    assert_eq!(coordinator.rollback(&store).unwrap(), WindowId(1));
    store.drop_caches();
    for n in 0..20u32 {
        assert_eq!(store.get(&key(n)).unwrap(), Some(b"good".to_vec()));
    }
}

#[test]
fn compaction_and_gc_do_not_lose_state() {
    let root = tempfile::tempdir().unwrap();
    let (store, mut coordinator) = open(root.path());

    // Enough checkpoints to trigger compaction (threshold 3) and
    // manifest pruning several times over.
    for window in 1..=12u64 {
        store.put(
            key(window as u32),
            format!("w{window}").into_bytes(),
            WindowId(window),
        );
        coordinator.checkpoint(&store, WindowId(window)).unwrap();
    }
    store.drop_caches();

    for window in 1..=12u64 {
        assert_eq!(
            store.get(&key(window as u32)).unwrap(),
            Some(format!("w{window}").into_bytes())
        );
    }

    // And the surviving layout still recovers cold.
    drop((store, coordinator));
    let (store, mut coordinator) = open(root.path());
    assert_eq!(coordinator.recover(&store).unwrap(), Some(WindowId(12)));
    for window in 1..=12u64 {
        assert_eq!(
            store.get(&key(window as u32)).unwrap(),
            Some(format!("w{window}").into_bytes())
        );
    }
}

#[test]
fn purge_drops_expired_entries_after_compaction() {
    let root = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        bucket_count: 1,
        compaction_segment_threshold: 2,
        ..Default::default()
    };
    let store = ManagedStore::open(config.clone(), root.path()).unwrap();
    let mut coordinator = CheckpointCoordinator::new(config, root.path()).unwrap();

    store.put(key(1), b"stale".to_vec(), WindowId(1));
    coordinator.checkpoint(&store, WindowId(1)).unwrap();
    store.put(key(2), b"fresh".to_vec(), WindowId(5));
    coordinator.checkpoint(&store, WindowId(5)).unwrap();

    store.purge(WindowId(5));
    // Chain length 3 > threshold 2 forces a merge under the horizon.
    store.put(key(3), b"newer".to_vec(), WindowId(6));
    coordinator.checkpoint(&store, WindowId(6)).unwrap();
    store.drop_caches();

    assert_eq!(store.get(&key(1)).unwrap(), None);
    assert_eq!(store.get(&key(2)).unwrap(), Some(b"fresh".to_vec()));
    assert_eq!(store.get(&key(3)).unwrap(), Some(b"newer".to_vec()));
}
