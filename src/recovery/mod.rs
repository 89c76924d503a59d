//! Directory replay.
//!
//! A [`Recovery`] walks the segment files of a WAL directory from a given
//! vclock, feeding every not-yet-seen row to a sink. It tolerates a live
//! tail: reaching the torn end of the segment currently being written
//! reports [`RecoverStatus::Live`], and a later call resumes at the same
//! block boundary after rescanning the directory for new segments. Relays
//! use this as their file phase whenever a follower's position has left
//! the in-memory row ring.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::clock::VClock;
use crate::xlog::{XDir, XlogError, XlogReader, XlogResult};
use crate::xrow::Row;

/// Why a replay pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverStatus {
    /// The stop vclock was reached.
    Done,
    /// The readable log is exhausted; more may be flushed later.
    Live,
}

/// Replay error: either the log itself failed, or the sink did.
#[derive(Debug)]
pub enum RecoveryError<E> {
    /// Reading the segment files failed.
    Xlog(XlogError),
    /// The row sink reported an error.
    Sink(E),
}

impl<E> From<XlogError> for RecoveryError<E> {
    fn from(err: XlogError) -> Self {
        RecoveryError::Xlog(err)
    }
}

/// A resumable replay cursor over a WAL directory.
pub struct Recovery {
    dir: XDir,
    clock: VClock,
    /// Segment currently being read and the offset to resume at.
    position: Option<(i64, u64)>,
    /// Most recent segment fully consumed (EOF marker seen).
    finished: Option<i64>,
}

impl Recovery {
    /// A cursor positioned at `clock`.
    pub fn new(wal_dir: &Path, instance: Uuid, clock: VClock) -> XlogResult<Self> {
        let dir = XDir::open(wal_dir, instance)?;
        Ok(Self { dir, clock, position: None, finished: None })
    }

    /// Everything replayed so far.
    pub fn clock(&self) -> &VClock {
        &self.clock
    }

    /// Replay rows until `stop` is covered or the readable log runs out.
    ///
    /// Every row with an LSN the cursor has not yet seen is handed to
    /// `sink` in log order; the cursor clock follows each one. Rows at or
    /// past `stop` (when given) are not delivered.
    pub fn recover_remaining<E>(
        &mut self,
        stop: Option<&VClock>,
        sink: &mut dyn FnMut(&Row) -> Result<(), E>,
    ) -> Result<RecoverStatus, RecoveryError<E>> {
        self.dir.scan()?;
        loop {
            if let Some(stop) = stop {
                if self.clock.ge(stop) {
                    return Ok(RecoverStatus::Done);
                }
            }
            let (signature, offset) = match self.position {
                Some(position) => position,
                None => match self.next_segment()? {
                    Some(signature) => (signature, 0),
                    None => return Ok(RecoverStatus::Live),
                },
            };

            let path = self.dir.format_filename(signature);
            let mut reader = self.open_reader(&path, offset)?;
            loop {
                if let Some(stop) = stop {
                    if self.clock.ge(stop) {
                        self.position = Some((signature, reader.good_offset()));
                        return Ok(RecoverStatus::Done);
                    }
                }
                match reader.next_row()? {
                    Some(row) => {
                        if row.lsn <= self.clock.get(row.replica_id) {
                            continue;
                        }
                        sink(&row).map_err(RecoveryError::Sink)?;
                        let _ = self.clock.follow(row.replica_id, row.lsn);
                    }
                    None => break,
                }
            }

            if reader.saw_eof_marker() {
                // Segment sealed; move on to the next one.
                self.finished = Some(signature);
                self.position = None;
            } else {
                // Torn or live tail: resume here once more is flushed.
                self.position = Some((signature, reader.good_offset()));
                return Ok(RecoverStatus::Live);
            }
        }
    }

    /// Pick the next segment to read, or `None` when the replay has to
    /// wait for the writer.
    fn next_segment<E>(&self) -> Result<Option<i64>, RecoveryError<E>> {
        if let Some(finished) = self.finished {
            return Ok(self.dir.next_after(finished).map(VClock::signature));
        }
        if self.dir.is_empty() {
            return Ok(None);
        }
        match self.dir.match_signature(self.clock.signature()) {
            Some(signature) => Ok(Some(signature)),
            None => Err(RecoveryError::Xlog(XlogError::corruption(format!(
                "log gap: no segment covers {} in {}",
                self.clock,
                self.dir.dirname().display()
            )))),
        }
    }

    fn open_reader(&self, path: &PathBuf, offset: u64) -> XlogResult<XlogReader> {
        let mut reader = XlogReader::open(path)?;
        if offset > 0 {
            reader.seek_to(offset)?;
        }
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xlog::{SegmentMeta, XlogWriter};
    use crate::xrow::RowType;
    use tempfile::TempDir;

    fn clock(pairs: &[(u32, i64)]) -> VClock {
        VClock::from_components(pairs.iter().copied())
    }

    fn row(lsn: i64) -> Row {
        let mut row = Row::new(RowType::Insert, vec![1, 2, 3]);
        row.replica_id = 1;
        row.lsn = lsn;
        row.tsn = lsn;
        row.is_commit = true;
        row
    }

    fn write_segment(dir: &XDir, start: &VClock, lsns: &[i64], seal: bool) {
        let path = dir.format_filename(start.signature());
        let meta = SegmentMeta::new(dir.instance(), start.clone());
        let mut writer = XlogWriter::create(&path, meta, false).unwrap();
        for &lsn in lsns {
            writer.append_tx(&[row(lsn).encode()]).unwrap();
        }
        writer.flush().unwrap();
        if seal {
            writer.close().unwrap();
        }
    }

    fn replay(
        recovery: &mut Recovery,
        stop: Option<&VClock>,
    ) -> (Vec<i64>, RecoverStatus) {
        let mut lsns = Vec::new();
        let status = recovery
            .recover_remaining::<()>(stop, &mut |row| {
                lsns.push(row.lsn);
                Ok(())
            })
            .unwrap();
        (lsns, status)
    }

    #[test]
    fn test_replays_across_segments() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let dir = XDir::open(tmp.path(), instance).unwrap();
        write_segment(&dir, &clock(&[]), &[1, 2], true);
        write_segment(&dir, &clock(&[(1, 2)]), &[3, 4], true);

        let mut recovery = Recovery::new(tmp.path(), instance, VClock::new()).unwrap();
        let (lsns, status) = replay(&mut recovery, None);
        assert_eq!(lsns, vec![1, 2, 3, 4]);
        assert_eq!(status, RecoverStatus::Live);
        assert_eq!(recovery.clock().get(1), 4);
    }

    #[test]
    fn test_starts_inside_containing_segment() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let dir = XDir::open(tmp.path(), instance).unwrap();
        write_segment(&dir, &clock(&[]), &[1, 2, 3], true);
        write_segment(&dir, &clock(&[(1, 3)]), &[4, 5], true);

        let mut recovery = Recovery::new(tmp.path(), instance, clock(&[(1, 2)])).unwrap();
        let (lsns, _) = replay(&mut recovery, None);
        assert_eq!(lsns, vec![3, 4, 5]);
    }

    #[test]
    fn test_stop_vclock_bounds_replay() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let dir = XDir::open(tmp.path(), instance).unwrap();
        write_segment(&dir, &clock(&[]), &[1, 2, 3, 4], true);

        let mut recovery = Recovery::new(tmp.path(), instance, VClock::new()).unwrap();
        let (lsns, status) = replay(&mut recovery, Some(&clock(&[(1, 2)])));
        assert_eq!(lsns, vec![1, 2]);
        assert_eq!(status, RecoverStatus::Done);
    }

    #[test]
    fn test_live_tail_resumes_without_duplicates() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let dir = XDir::open(tmp.path(), instance).unwrap();
        let path = dir.format_filename(0);
        let meta = SegmentMeta::new(instance, VClock::new());
        let mut writer = XlogWriter::create(&path, meta, false).unwrap();
        writer.append_tx(&[row(1).encode()]).unwrap();
        writer.flush().unwrap();

        let mut recovery = Recovery::new(tmp.path(), instance, VClock::new()).unwrap();
        let (lsns, status) = replay(&mut recovery, None);
        assert_eq!(lsns, vec![1]);
        assert_eq!(status, RecoverStatus::Live);

        // The writer keeps appending to the same live segment.
        writer.append_tx(&[row(2).encode()]).unwrap();
        writer.flush().unwrap();

        let (lsns, _) = replay(&mut recovery, None);
        assert_eq!(lsns, vec![2]);
    }

    #[test]
    fn test_gap_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let dir = XDir::open(tmp.path(), instance).unwrap();
        // The oldest segment starts at {1:5}; a follower at {1:1} has a gap.
        write_segment(&dir, &clock(&[(1, 5)]), &[6], true);

        let mut recovery = Recovery::new(tmp.path(), instance, clock(&[(1, 1)])).unwrap();
        let result = recovery.recover_remaining::<()>(None, &mut |_| Ok(()));
        assert!(matches!(result, Err(RecoveryError::Xlog(e)) if e.is_corruption()));
    }

    #[test]
    fn test_empty_directory_is_live() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let mut recovery = Recovery::new(tmp.path(), instance, VClock::new()).unwrap();
        let (lsns, status) = replay(&mut recovery, None);
        assert!(lsns.is_empty());
        assert_eq!(status, RecoverStatus::Live);
    }

    #[test]
    fn test_sink_error_propagates() {
        let tmp = TempDir::new().unwrap();
        let instance = Uuid::new_v4();
        let dir = XDir::open(tmp.path(), instance).unwrap();
        write_segment(&dir, &clock(&[]), &[1], true);

        let mut recovery = Recovery::new(tmp.path(), instance, VClock::new()).unwrap();
        let result = recovery.recover_remaining::<&str>(None, &mut |_| Err("sink failed"));
        assert!(matches!(result, Err(RecoveryError::Sink("sink failed"))));
    }
}
