//! Append-only segment files.
//!
//! A segment is an immutable on-disk chunk of state entries for one
//! bucket. The layout is a magic/version header, an entry count, a run
//! of length-prefixed `(key, value, window)` records, and a trailing
//! seahash over everything before it. Writes fsync the file and its
//! directory before returning; reads verify the whole-file checksum
//! before any record is handed out, so a torn or flipped file is
//! reported as corruption instead of partial data.
//!
//! Segments are never mutated in place. Compaction supersedes them
//! with a merged file and the old files are garbage collected once no
//! retained manifest references them.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::StateError;
use crate::model::BucketId;
use crate::model::StateEntry;
use crate::model::StateKey;
use crate::model::WindowId;

const SEGMENT_MAGIC: &[u8; 4] = b"SPWS";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_EXT: &str = "spw";

/// Reference to one immutable segment file.
///
/// Everything a manifest needs to describe the segment: file name,
/// entry count, byte size, and the whole-file checksum a reader must
/// reproduce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHandle {
    pub bucket: BucketId,
    pub file_name: String,
    pub entries: u64,
    pub bytes: u64,
    pub checksum: u64,
}

/// The only component that touches segment storage directly.
#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
    next_seq: AtomicU64,
}

impl SegmentStore {
    /// Open (or create) the segment directory.
    ///
    /// Scans existing files so sequence numbers keep increasing
    /// across restarts and never collide with live segments.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StateError::io(&dir))?;

        let mut max_seq = 0;
        for name in list_segment_files(&dir)? {
            if let Some(seq) = parse_seq(&name) {
                max_seq = max_seq.max(seq + 1);
            }
        }

        tracing::debug!("Opened segment store at {dir:?}, next seq {max_seq}");
        Ok(Self {
            dir,
            next_seq: AtomicU64::new(max_seq),
        })
    }

    /// Append-only write of a new segment. Fsyncs the file and the
    /// directory entry before returning the handle.
    pub fn write(&self, bucket: BucketId, entries: &[StateEntry]) -> Result<SegmentHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let file_name = format!("seg-{:05}-{:010}.{SEGMENT_EXT}", bucket.0, seq);
        let path = self.dir.join(&file_name);

        let mut buf = Vec::with_capacity(64 + entries.len() * 32);
        buf.extend_from_slice(SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for entry in entries {
            buf.extend_from_slice(&(entry.key.0.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry.key.0);
            buf.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry.value);
            buf.extend_from_slice(&entry.window.0.to_le_bytes());
        }
        let checksum = seahash::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(StateError::io(&path))?;
        file.write_all(&buf).map_err(StateError::io(&path))?;
        file.sync_all().map_err(StateError::io(&path))?;
        sync_dir(&self.dir)?;

        tracing::trace!(
            "Wrote segment {file_name} for bucket {bucket}: {} entries, {} bytes",
            entries.len(),
            buf.len()
        );
        Ok(SegmentHandle {
            bucket,
            file_name,
            entries: entries.len() as u64,
            bytes: buf.len() as u64,
            checksum,
        })
    }

    /// Read a segment back, verifying the checksum first.
    ///
    /// A missing file is an I/O error; a checksum or format mismatch
    /// is corruption. Neither ever yields partial data.
    pub fn read(&self, handle: &SegmentHandle) -> Result<Vec<StateEntry>> {
        let path = self.dir.join(&handle.file_name);
        let buf = fs::read(&path).map_err(StateError::io(&path))?;

        if buf.len() < SEGMENT_MAGIC.len() + 4 + 8 + 8 {
            return Err(StateError::corruption(&path, "segment file truncated"));
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
        if stored != handle.checksum {
            return Err(StateError::corruption(
                &path,
                format!(
                    "checksum does not match manifest: file {stored:016x}, manifest {:016x}",
                    handle.checksum
                ),
            ));
        }

        decode_entries(&path, body)
    }

    /// Cheap integrity probe used by recovery checks.
    pub fn verify(&self, handle: &SegmentHandle) -> bool {
        self.read(handle).is_ok()
    }

    /// List all segment file names currently on disk.
    pub(crate) fn list(&self) -> Result<Vec<String>> {
        list_segment_files(&self.dir)
    }

    /// Delete a superseded segment file by name.
    pub(crate) fn remove_file(&self, file_name: &str) -> Result<()> {
        let path = self.dir.join(file_name);
        fs::remove_file(&path).map_err(StateError::io(&path))
    }
}

fn decode_entries(path: &Path, body: &[u8]) -> Result<Vec<StateEntry>> {
    let mut offset = 0;
    let magic = take(path, body, &mut offset, SEGMENT_MAGIC.len())?;
    if magic != SEGMENT_MAGIC {
        return Err(StateError::corruption(path, "bad segment magic"));
    }
    let version = u32::from_le_bytes(take(path, body, &mut offset, 4)?.try_into().unwrap());
    if version != SEGMENT_VERSION {
        return Err(StateError::corruption(
            path,
            format!("unsupported segment version {version}"),
        ));
    }
    let count = u64::from_le_bytes(take(path, body, &mut offset, 8)?.try_into().unwrap());

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = u32::from_le_bytes(take(path, body, &mut offset, 4)?.try_into().unwrap());
        let key = take(path, body, &mut offset, key_len as usize)?.to_vec();
        let value_len = u32::from_le_bytes(take(path, body, &mut offset, 4)?.try_into().unwrap());
        let value = take(path, body, &mut offset, value_len as usize)?.to_vec();
        let window = u64::from_le_bytes(take(path, body, &mut offset, 8)?.try_into().unwrap());
        entries.push(StateEntry {
            key: StateKey(key),
            value,
            window: WindowId(window),
        });
    }
    if offset != body.len() {
        return Err(StateError::corruption(path, "trailing bytes after records"));
    }
    Ok(entries)
}

fn take<'b>(path: &Path, body: &'b [u8], offset: &mut usize, len: usize) -> Result<&'b [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= body.len())
        .ok_or_else(|| StateError::corruption(path, "record extends past end of segment"))?;
    let slice = &body[*offset..end];
    *offset = end;
    Ok(slice)
}

fn list_segment_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(StateError::io(dir))? {
        let entry = entry.map_err(StateError::io(dir))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("seg-") && name.ends_with(&format!(".{SEGMENT_EXT}")) {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn parse_seq(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("seg-")?
        .strip_suffix(&format!(".{SEGMENT_EXT}"))?
        .rsplit('-')
        .next()?
        .parse()
        .ok()
}

fn sync_dir(dir: &Path) -> Result<()> {
    // Durability of the new directory entry, not just the file bytes.
    let handle = File::open(dir).map_err(StateError::io(dir))?;
    handle.sync_all().map_err(StateError::io(dir))
}
