//! Segment directory index.
//!
//! The directory holds segments named by the 20-digit signature of their
//! starting vclock. The index maps signature to starting vclock, ordered;
//! it contains every segment from which rows have been flushed and never
//! an empty pending segment, because a segment is created lazily by the
//! first batch that needs it and indexed in the same step.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::errors::{XlogError, XlogResult};
use super::reader::XlogReader;
use super::segment::{SegmentMeta, XlogWriter, XLOG_EXTENSION};
use crate::clock::VClock;
use crate::observability::{Logger, Severity};

/// Exclusive lock on a WAL directory.
///
/// The directory is singleton per process: a second writer would interleave
/// segments and destroy the log. The lock is a marker file holding the
/// owner pid, removed on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock, failing if another writer holds it.
    pub fn acquire(dir: &Path) -> XlogResult<Self> {
        let path = dir.join(".wal_dir_lock");
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                XlogError::io(
                    format!("wal directory {} is locked by another writer", dir.display()),
                    e,
                )
            })?;
        let _ = write!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Sorted index of the segments in one WAL directory.
pub struct XDir {
    dirname: PathBuf,
    instance: Uuid,
    index: BTreeMap<i64, VClock>,
}

impl XDir {
    /// Create the index over `dirname`, creating the directory if needed.
    pub fn open(dirname: impl Into<PathBuf>, instance: Uuid) -> XlogResult<Self> {
        let dirname = dirname.into();
        fs::create_dir_all(&dirname)
            .map_err(|e| XlogError::io(format!("failed to create {}", dirname.display()), e))?;
        Ok(Self { dirname, instance, index: BTreeMap::new() })
    }

    /// Directory path.
    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    /// Instance uuid stamped into new segment headers.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Path of the segment starting at the given signature.
    pub fn format_filename(&self, signature: i64) -> PathBuf {
        self.dirname.join(format!("{:020}.{}", signature, XLOG_EXTENSION))
    }

    /// Scan the directory and rebuild the index from segment headers.
    ///
    /// Files with unparseable names are ignored; a file whose header
    /// cannot be read is an error, because every indexed vclock feeds
    /// garbage-collection decisions.
    pub fn scan(&mut self) -> XlogResult<()> {
        self.index.clear();
        let entries = fs::read_dir(&self.dirname)
            .map_err(|e| XlogError::io(format!("failed to list {}", self.dirname.display()), e))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| XlogError::io(format!("failed to list {}", self.dirname.display()), e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if parse_segment_filename(&name).is_none() {
                continue;
            }
            let meta = XlogReader::read_meta(&entry.path())?;
            self.index.insert(meta.vclock.signature(), meta.vclock);
        }
        Ok(())
    }

    /// Add a newly created segment's starting vclock.
    pub fn add_vclock(&mut self, vclock: VClock) {
        self.index.insert(vclock.signature(), vclock);
    }

    /// Starting vclock of the oldest segment.
    pub fn first(&self) -> Option<&VClock> {
        self.index.values().next()
    }

    /// Starting vclock of the segment after the one at `signature`.
    pub fn next_after(&self, signature: i64) -> Option<&VClock> {
        use std::ops::Bound;
        self.index
            .range((Bound::Excluded(signature), Bound::Unbounded))
            .map(|(_, v)| v)
            .next()
    }

    /// The greatest indexed vclock whose signature does not exceed
    /// `vclock`'s: the segment that contains that position.
    pub fn match_vclock(&self, vclock: &VClock) -> Option<&VClock> {
        self.index
            .range(..=vclock.signature())
            .next_back()
            .map(|(_, v)| v)
    }

    /// Signature form of [`match_vclock`].
    ///
    /// [`match_vclock`]: XDir::match_vclock
    pub fn match_signature(&self, signature: i64) -> Option<i64> {
        self.index.range(..=signature).next_back().map(|(&s, _)| s)
    }

    /// Number of indexed segments.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterate starting vclocks in log order.
    pub fn iter(&self) -> impl Iterator<Item = &VClock> {
        self.index.values()
    }

    /// True if at least one segment could be deleted without losing rows
    /// at or after `keep_signature`.
    pub fn has_garbage(&self, keep_signature: i64) -> bool {
        match self.index.range(..=keep_signature).next_back() {
            Some((&bound, _)) => self.index.keys().next().is_some_and(|&first| first < bound),
            None => false,
        }
    }

    /// Delete segments whose starting signature is strictly below
    /// `before_signature`. With `one`, delete only the oldest eligible
    /// segment. Returns the starting vclocks of the deleted segments.
    pub fn collect_garbage(&mut self, before_signature: i64, one: bool) -> Vec<VClock> {
        let victims: Vec<i64> = self
            .index
            .range(..before_signature)
            .map(|(&sig, _)| sig)
            .take(if one { 1 } else { usize::MAX })
            .collect();
        let mut removed = Vec::with_capacity(victims.len());
        for signature in victims {
            let path = self.format_filename(signature);
            match fs::remove_file(&path) {
                Ok(()) => {
                    Logger::log(
                        Severity::Info,
                        "wal_segment_deleted",
                        &[("path", &path.display().to_string())],
                    );
                }
                Err(e) => {
                    // A missing file is already collected; anything else
                    // is logged and the index entry dropped anyway so GC
                    // does not retry forever.
                    if e.kind() != std::io::ErrorKind::NotFound {
                        Logger::log_stderr(
                            Severity::Warn,
                            "wal_segment_delete_failed",
                            &[("path", &path.display().to_string()), ("error", &e.to_string())],
                        );
                    }
                }
            }
            if let Some(vclock) = self.index.remove(&signature) {
                removed.push(vclock);
            }
        }
        removed
    }

    /// Create a new segment starting at `vclock` and index it.
    pub fn create_segment(&mut self, vclock: &VClock, sync_on_flush: bool) -> XlogResult<XlogWriter> {
        let path = self.format_filename(vclock.signature());
        let meta = SegmentMeta::new(self.instance, vclock.clone());
        let writer = XlogWriter::create(&path, meta, sync_on_flush)?;
        self.add_vclock(vclock.clone());
        Ok(writer)
    }
}

/// Parse a segment filename into its starting signature.
pub(crate) fn parse_segment_filename(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(&format!(".{}", XLOG_EXTENSION))?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn clock(pairs: &[(u32, i64)]) -> VClock {
        VClock::from_components(pairs.iter().copied())
    }

    fn dir_with_segments(tmp: &TempDir, starts: &[VClock]) -> XDir {
        let mut xdir = XDir::open(tmp.path(), Uuid::new_v4()).unwrap();
        for start in starts {
            let writer = xdir.create_segment(start, false).unwrap();
            writer.close().unwrap();
        }
        xdir
    }

    #[test]
    fn test_parse_segment_filename() {
        assert_eq!(parse_segment_filename("00000000000000000000.xlog"), Some(0));
        assert_eq!(parse_segment_filename("00000000000000000042.xlog"), Some(42));
        assert_eq!(parse_segment_filename("42.xlog"), None);
        assert_eq!(parse_segment_filename("00000000000000000042.log"), None);
        assert_eq!(parse_segment_filename("segment.xlog"), None);
    }

    #[test]
    fn test_scan_rebuilds_sorted_index() {
        let tmp = TempDir::new().unwrap();
        let starts = vec![clock(&[(1, 6)]), clock(&[(1, 3)]), clock(&[])];
        let _ = dir_with_segments(&tmp, &starts);

        let mut fresh = XDir::open(tmp.path(), Uuid::new_v4()).unwrap();
        fresh.scan().unwrap();
        let signatures: Vec<i64> = fresh.iter().map(VClock::signature).collect();
        assert_eq!(signatures, vec![0, 3, 6]);
    }

    #[test]
    fn test_scan_ignores_foreign_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(tmp.path().join("123.xlog"), b"hi").unwrap();
        let mut xdir = XDir::open(tmp.path(), Uuid::new_v4()).unwrap();
        xdir.scan().unwrap();
        assert!(xdir.is_empty());
    }

    #[test]
    fn test_match_vclock_picks_containing_segment() {
        let tmp = TempDir::new().unwrap();
        let xdir = dir_with_segments(
            &tmp,
            &[clock(&[]), clock(&[(1, 3)]), clock(&[(1, 6)])],
        );
        assert_eq!(xdir.match_vclock(&clock(&[(1, 5)])).unwrap().signature(), 3);
        assert_eq!(xdir.match_vclock(&clock(&[(1, 6)])).unwrap().signature(), 6);
        assert_eq!(xdir.match_vclock(&clock(&[(1, 100)])).unwrap().signature(), 6);
        assert_eq!(xdir.match_vclock(&clock(&[])).unwrap().signature(), 0);
    }

    #[test]
    fn test_first_and_next_after() {
        let tmp = TempDir::new().unwrap();
        let xdir = dir_with_segments(&tmp, &[clock(&[]), clock(&[(1, 3)])]);
        assert_eq!(xdir.first().unwrap().signature(), 0);
        assert_eq!(xdir.next_after(0).unwrap().signature(), 3);
        assert!(xdir.next_after(3).is_none());
    }

    #[test]
    fn test_has_garbage() {
        let tmp = TempDir::new().unwrap();
        let xdir = dir_with_segments(
            &tmp,
            &[clock(&[]), clock(&[(1, 3)]), clock(&[(1, 6)])],
        );
        // Keeping {1:5} means the segment at 3 must stay, 0 is garbage.
        assert!(xdir.has_garbage(5));
        // Keeping {1:2} pins the segment at 0.
        assert!(!xdir.has_garbage(2));
    }

    #[test]
    fn test_collect_garbage_one() {
        let tmp = TempDir::new().unwrap();
        let mut xdir = dir_with_segments(
            &tmp,
            &[clock(&[]), clock(&[(1, 3)]), clock(&[(1, 6)])],
        );
        let removed = xdir.collect_garbage(3, true);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].signature(), 0);
        assert!(!xdir.format_filename(0).exists());
        assert!(xdir.format_filename(3).exists());
        assert_eq!(xdir.len(), 2);
    }

    #[test]
    fn test_collect_garbage_all() {
        let tmp = TempDir::new().unwrap();
        let mut xdir = dir_with_segments(
            &tmp,
            &[clock(&[]), clock(&[(1, 3)]), clock(&[(1, 6)])],
        );
        let removed = xdir.collect_garbage(6, false);
        assert_eq!(removed.len(), 2);
        assert_eq!(xdir.len(), 1);
        assert_eq!(xdir.first().unwrap().signature(), 6);
    }

    #[test]
    fn test_dir_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let lock = DirLock::acquire(tmp.path()).unwrap();
        assert!(DirLock::acquire(tmp.path()).is_err());
        drop(lock);
        let _relock = DirLock::acquire(tmp.path()).unwrap();
    }
}
