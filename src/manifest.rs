//! Versioned checkpoint manifests.
//!
//! A manifest is the atomically-published description of which
//! segments constitute a checkpoint: per bucket, the active segment
//! set (file name, entry count, checksum) plus a reference to the
//! prior manifest. The file itself is JSON with a trailing seahash,
//! written to a temporary name, verified by re-reading, renamed into
//! place, and only then named by the `CURRENT` pointer — itself
//! replaced with write-then-rename. A crash anywhere before the final
//! rename leaves the prior manifest fully intact.

use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::StateError;
use crate::model::BucketId;
use crate::model::WindowId;
use crate::segment::SegmentHandle;

const CURRENT_POINTER: &str = "CURRENT";
const MANIFEST_PREFIX: &str = "MANIFEST-";

/// One bucket's slice of a manifest: its segment chain at checkpoint
/// time, oldest to newest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketManifest {
    pub bucket: BucketId,
    pub segments: Vec<SegmentHandle>,
}

/// A full checkpoint description, identified by the window it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub window: WindowId,
    pub created_at: DateTime<Utc>,
    /// File name of the manifest this one supersedes, for incremental
    /// diffing. Fallback on corruption scans the directory instead,
    /// since a corrupt current manifest cannot be trusted to name its
    /// predecessor.
    pub previous: Option<String>,
    pub buckets: Vec<BucketManifest>,
}

/// Durable manifest storage under one directory.
#[derive(Debug)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StateError::io(&dir))?;
        Ok(Self { dir })
    }

    fn manifest_name(window: WindowId) -> String {
        // Zero-padded so lexicographic order is window order.
        format!("{MANIFEST_PREFIX}{:020}", window.0)
    }

    /// Write the manifest file durably and verify it by re-reading,
    /// without touching the `CURRENT` pointer. [`Self::publish`] is
    /// the complete operation; this half exists so crash points
    /// between the two renames can be exercised.
    pub(crate) fn write_manifest_file(&self, manifest: &Manifest) -> Result<String> {
        let name = Self::manifest_name(manifest.window);
        let path = self.dir.join(&name);

        let mut buf = serde_json::to_vec(manifest)
            .map_err(|err| StateError::corruption(&path, err.to_string()))?;
        let checksum = seahash::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let tmp = self
            .dir
            .join(format!("{name}.{:08x}.tmp", fastrand::u32(..)));
        write_durable(&tmp, &buf)?;
        fs::rename(&tmp, &path).map_err(StateError::io(&path))?;
        sync_dir(&self.dir)?;

        // Publish nothing we cannot read back.
        self.load(&name)?;
        Ok(name)
    }

    /// Publish a manifest: durable write, self-verify, then atomically
    /// repoint `CURRENT`.
    pub fn publish(&self, manifest: &Manifest) -> Result<String> {
        let name = self.write_manifest_file(manifest)?;
        self.set_current(&name)?;
        tracing::info!("Published manifest {name} for window {}", manifest.window);
        Ok(name)
    }

    fn set_current(&self, name: &str) -> Result<()> {
        let tmp = self
            .dir
            .join(format!("{CURRENT_POINTER}.{:08x}.tmp", fastrand::u32(..)));
        write_durable(&tmp, name.as_bytes())?;
        let current = self.dir.join(CURRENT_POINTER);
        fs::rename(&tmp, &current).map_err(StateError::io(&current))?;
        sync_dir(&self.dir)
    }

    /// Load and verify one manifest file by name.
    pub fn load(&self, name: &str) -> Result<Manifest> {
        let path = self.dir.join(name);
        let buf = fs::read(&path).map_err(StateError::io(&path))?;
        if buf.len() < 8 {
            return Err(StateError::corruption(&path, "manifest truncated"));
        }
        let (body, trailer) = buf.split_at(buf.len() - 8);
        let stored = u64::from_le_bytes(trailer.try_into().expect("8 byte trailer"));
        let computed = seahash::hash(body);
        if stored != computed {
            return Err(StateError::corruption(
                &path,
                format!("checksum mismatch: stored {stored:016x}, computed {computed:016x}"),
            ));
        }
        serde_json::from_slice(body).map_err(|err| StateError::corruption(&path, err.to_string()))
    }

    /// The manifest file `CURRENT` names, if any.
    pub fn current_name(&self) -> Result<Option<String>> {
        let path = self.dir.join(CURRENT_POINTER);
        match fs::read_to_string(&path) {
            Ok(name) => Ok(Some(name.trim().to_owned())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StateError::io(&path)(err)),
        }
    }

    /// Restart-time recovery: load the current manifest; if it fails
    /// verification, fall back one step to the newest older manifest
    /// on disk. Both failing is fatal. No pointer means a fresh start.
    pub fn recover(&self) -> Result<Option<(String, Manifest)>> {
        let Some(current) = self.current_name()? else {
            return Ok(None);
        };
        match self.load(&current) {
            Ok(manifest) => Ok(Some((current, manifest))),
            Err(err) => {
                tracing::warn!("Current manifest {current} failed to load ({err}); falling back");
                let Some(fallback) = self.predecessor_of(&current)? else {
                    return Err(StateError::Unrecoverable);
                };
                match self.load(&fallback) {
                    Ok(manifest) => {
                        tracing::warn!("Recovered from prior manifest {fallback}");
                        Ok(Some((fallback, manifest)))
                    }
                    Err(fallback_err) => {
                        tracing::error!(
                            "Prior manifest {fallback} also failed to load: {fallback_err}"
                        );
                        Err(StateError::Unrecoverable)
                    }
                }
            }
        }
    }

    /// The newest manifest on disk strictly older than `name`.
    pub(crate) fn predecessor_of(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|candidate| candidate.as_str() < name))
    }

    /// All manifest file names, newest first.
    pub(crate) fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StateError::io(&self.dir))? {
            let entry = entry.map_err(StateError::io(&self.dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(MANIFEST_PREFIX) && !name.ends_with(".tmp") {
                names.push(name.to_owned());
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Delete all but the newest `keep` manifests. Returns the kept
    /// names, newest first. At least two are always retained.
    pub(crate) fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let keep = keep.max(2);
        let names = self.list()?;
        for name in names.iter().skip(keep) {
            let path = self.dir.join(name);
            fs::remove_file(&path).map_err(StateError::io(&path))?;
            tracing::debug!("Aged out manifest {name}");
        }
        Ok(names.into_iter().take(keep).collect())
    }

    /// Delete one manifest file. The caller must have already moved
    /// `CURRENT` off of it.
    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::remove_file(&path).map_err(StateError::io(&path))
    }

    /// Union of segment file names referenced by the given manifests.
    /// A manifest that no longer loads contributes nothing (it can no
    /// longer be recovered to either).
    pub(crate) fn referenced_segments(&self, names: &[String]) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        for name in names {
            let manifest = match self.load(name) {
                Ok(manifest) => manifest,
                Err(err) => {
                    tracing::warn!("Skipping unreadable manifest {name} during GC: {err}");
                    continue;
                }
            };
            for fragment in &manifest.buckets {
                for handle in &fragment.segments {
                    referenced.insert(handle.file_name.clone());
                }
            }
        }
        Ok(referenced)
    }
}

fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(StateError::io(path))?;
    file.write_all(bytes).map_err(StateError::io(path))?;
    file.sync_all().map_err(StateError::io(path))
}

fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).map_err(StateError::io(dir))?;
    handle.sync_all().map_err(StateError::io(dir))
}
