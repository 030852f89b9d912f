//! Engine tuning knobs.

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::StateError;

/// Configuration for the spillable store and checkpoint coordinator.
///
/// All fields have defaults so a config file only needs to name the
/// knobs it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of hash buckets the key space is sharded into. Fixed
    /// for the lifetime of the state directory, since routing must be
    /// stable across restarts.
    pub bucket_count: u64,

    /// Cache admission budget, measured in resident bucket-segments.
    /// Eviction is LRU and only ever touches already-durable segment
    /// data, never a pending mutable table.
    pub cache_budget_segments: usize,

    /// A bucket whose segment chain grows past this many segments is
    /// compacted at the next checkpoint.
    pub compaction_segment_threshold: usize,

    /// Size-tiered compaction merges the oldest contiguous run of
    /// segments whose combined size stays under this many bytes.
    pub compaction_target_bytes: u64,

    /// A checkpoint is triggered every this-many windows, in addition
    /// to explicit requests.
    pub checkpoint_interval_windows: u64,

    /// If window progression runs more than this many windows past
    /// the last published checkpoint, `should_pause` signals the
    /// orchestration layer to stall so unflushed state stays bounded.
    pub checkpoint_lag_threshold: u64,

    /// How many manifests to keep on disk. Must be at least 2 so a
    /// corrupt current manifest can fall back to its predecessor.
    pub retained_manifests: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_count: 16,
            cache_budget_segments: 8,
            compaction_segment_threshold: 4,
            compaction_target_bytes: 64 * 1024 * 1024,
            checkpoint_interval_windows: 10,
            checkpoint_lag_threshold: 20,
            retained_manifests: 2,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(StateError::Config(
                "bucket_count must be at least 1".to_owned(),
            ));
        }
        if self.cache_budget_segments == 0 {
            return Err(StateError::Config(
                "cache_budget_segments must be at least 1".to_owned(),
            ));
        }
        if self.retained_manifests < 2 {
            return Err(StateError::Config(
                "retained_manifests must be at least 2 to allow rollback".to_owned(),
            ));
        }
        Ok(())
    }
}

#[test]
fn default_config_is_valid() {
    EngineConfig::default().validate().unwrap();
}

#[test]
fn rejects_single_retained_manifest() {
    let config = EngineConfig {
        retained_manifests: 1,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn partial_config_deserializes_with_defaults() {
    let config: EngineConfig = serde_json::from_str(r#"{"bucket_count": 4}"#).unwrap();
    assert_eq!(config.bucket_count, 4);
    assert_eq!(config.retained_manifests, 2);
}
