//! In-memory window of recently committed rows.
//!
//! The ring lets relays serve up-to-date followers without touching
//! segment files. Rows are appended in commit order inside a transaction
//! that mirrors one WAL batch: `tx_begin` / `tx_write` / `tx_commit` or
//! `tx_rollback`. Storage is chunked; when the chunk limit is reached
//! the oldest chunk is evicted and any cursor still pointing into it
//! observes [`RingNext::Gone`] on its next read.
//!
//! The WAL thread writes, relay threads read. Readers learn about new
//! commits through the write signal owned by the WAL (see
//! [`crate::bus::Signal`]).

use crate::clock::VClock;
use crate::xrow::Row;
use std::collections::VecDeque;

/// How many chunks the ring retains.
pub const RING_CHUNK_COUNT: usize = 8;

/// A chunk is rotated once it holds this many rows.
pub const RING_CHUNK_ROWS: usize = 1024;

/// One row held in the ring: the decoded header plus the encoded frame,
/// kept so relays can forward bytes without re-encoding.
#[derive(Debug, Clone)]
pub struct RingRow {
    /// Decoded row.
    pub row: Row,
    /// Frame bytes as written to the segment file.
    pub encoded: Vec<u8>,
}

#[derive(Debug)]
struct RingChunk {
    /// Log state right before the first row of this chunk.
    start: VClock,
    rows: Vec<RingRow>,
}

#[derive(Debug)]
struct RingTx {
    /// Global index of the chunk receiving staged rows.
    chunk_index: u64,
    /// Visible length of that chunk before the transaction.
    staged_start: usize,
    /// End clock to restore on rollback.
    end_backup: VClock,
}

/// The position a cursor referenced has been evicted from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionEvicted;

impl std::fmt::Display for PositionEvicted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "requested position is no longer in the row ring")
    }
}

impl std::error::Error for PositionEvicted {}

/// Result of one cursor step.
#[derive(Debug, Clone)]
pub enum RingNext {
    /// The next committed row.
    Row(RingRow),
    /// The cursor is caught up; wait on the write signal.
    Empty,
    /// The cursor's position was evicted; fall back to file replay.
    Gone,
}

/// A stable read position in the ring.
///
/// The cursor tracks its own clock and skips rows a follower at that
/// clock has already seen, so the per-replica LSN sequence it yields is
/// strictly increasing.
#[derive(Debug, Clone)]
pub struct RingCursor {
    chunk_index: u64,
    row_pos: usize,
    clock: VClock,
}

impl RingCursor {
    /// The clock of everything this cursor has yielded so far.
    pub fn clock(&self) -> &VClock {
        &self.clock
    }
}

/// The ring buffer. Owned by the WAL thread behind a mutex shared with
/// relay readers.
#[derive(Debug)]
pub struct XrowRing {
    chunks: VecDeque<RingChunk>,
    /// Global index of `chunks[0]`.
    first_index: u64,
    max_chunks: usize,
    chunk_rows: usize,
    /// Log state after the last committed row.
    end: VClock,
    tx: Option<RingTx>,
}

impl Default for XrowRing {
    fn default() -> Self {
        Self::new(RING_CHUNK_COUNT, RING_CHUNK_ROWS)
    }
}

impl XrowRing {
    /// A ring retaining at most `max_chunks` chunks of `chunk_rows` rows.
    pub fn new(max_chunks: usize, chunk_rows: usize) -> Self {
        assert!(max_chunks >= 2, "ring needs at least two chunks");
        assert!(chunk_rows >= 1);
        Self {
            chunks: VecDeque::new(),
            first_index: 0,
            max_chunks,
            chunk_rows,
            end: VClock::new(),
            tx: None,
        }
    }

    /// Set the log position the next transaction continues from. Called
    /// once at WAL startup, before any write.
    pub fn reset(&mut self, vclock: VClock) {
        assert!(self.chunks.is_empty(), "reset on a non-empty ring");
        self.end = vclock;
    }

    /// Clock of the last committed row.
    pub fn end_clock(&self) -> &VClock {
        &self.end
    }

    /// Begin the write transaction for one WAL batch starting at `base`.
    pub fn tx_begin(&mut self, base: &VClock) {
        assert!(self.tx.is_none(), "ring transaction already open");
        let rotate = match self.chunks.back() {
            None => true,
            Some(chunk) => chunk.rows.len() >= self.chunk_rows,
        };
        if rotate {
            if self.chunks.len() == self.max_chunks {
                self.chunks.pop_front();
                self.first_index += 1;
            }
            self.chunks.push_back(RingChunk { start: base.clone(), rows: Vec::new() });
        }
        let chunk_index = self.first_index + self.chunks.len() as u64 - 1;
        let staged_start = self.chunks.back().unwrap().rows.len();
        self.tx = Some(RingTx {
            chunk_index,
            staged_start,
            end_backup: self.end.clone(),
        });
    }

    /// Append rows to the open transaction, returning the encoded frame
    /// of every row for the segment append.
    pub fn tx_write(&mut self, rows: &[Row]) -> Vec<Vec<u8>> {
        assert!(self.tx.is_some(), "tx_write outside a ring transaction");
        let chunk = self.chunks.back_mut().expect("open tx implies a chunk");
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let frame = row.encode();
            if row.lsn > self.end.get(row.replica_id) {
                let _ = self.end.follow(row.replica_id, row.lsn);
            }
            chunk.rows.push(RingRow { row: row.clone(), encoded: frame.clone() });
            encoded.push(frame);
        }
        encoded
    }

    /// Make the staged rows visible to cursors.
    pub fn tx_commit(&mut self) {
        assert!(self.tx.take().is_some(), "tx_commit outside a ring transaction");
    }

    /// Discard the staged rows.
    pub fn tx_rollback(&mut self) {
        let tx = self.tx.take().expect("tx_rollback outside a ring transaction");
        let rel = (tx.chunk_index - self.first_index) as usize;
        self.chunks[rel].rows.truncate(tx.staged_start);
        self.end = tx.end_backup;
    }

    /// Rows of `chunks[rel]` visible to cursors.
    fn visible_len(&self, global_index: u64, rel: usize) -> usize {
        match &self.tx {
            Some(tx) if tx.chunk_index == global_index => tx.staged_start,
            _ => self.chunks[rel].rows.len(),
        }
    }

    /// Open a cursor at `from`.
    ///
    /// Fails when `from` precedes the oldest retained position. A cursor
    /// at or past the current end is valid and starts out [`RingNext::Empty`].
    pub fn cursor(&self, from: &VClock) -> Result<RingCursor, PositionEvicted> {
        if from.ge(&self.end) {
            // Caught up (or ahead): position after the last visible row,
            // inside the newest chunk so later appends to it are seen.
            let (chunk_index, row_pos) = match self.chunks.len() {
                0 => (self.first_index, 0),
                n => {
                    let chunk_index = self.first_index + n as u64 - 1;
                    (chunk_index, self.visible_len(chunk_index, n - 1))
                }
            };
            return Ok(RingCursor {
                chunk_index,
                row_pos,
                clock: from.clone(),
            });
        }
        // Find the newest chunk starting at or before `from`.
        let mut candidate: Option<usize> = None;
        for (rel, chunk) in self.chunks.iter().enumerate() {
            if from.ge(&chunk.start) {
                candidate = Some(rel);
            } else {
                break;
            }
        }
        match candidate {
            Some(rel) => Ok(RingCursor {
                chunk_index: self.first_index + rel as u64,
                row_pos: 0,
                clock: from.clone(),
            }),
            None => Err(PositionEvicted),
        }
    }

    /// Advance a cursor by one row.
    pub fn next(&self, cursor: &mut RingCursor) -> RingNext {
        loop {
            if cursor.chunk_index < self.first_index {
                return RingNext::Gone;
            }
            let rel = (cursor.chunk_index - self.first_index) as usize;
            if rel >= self.chunks.len() {
                return RingNext::Empty;
            }
            let visible = self.visible_len(cursor.chunk_index, rel);
            if cursor.row_pos >= visible {
                if rel + 1 < self.chunks.len()
                    || self
                        .tx
                        .as_ref()
                        .is_some_and(|tx| tx.chunk_index > cursor.chunk_index)
                {
                    // The chunk is exhausted and a newer one exists.
                    cursor.chunk_index += 1;
                    cursor.row_pos = 0;
                    continue;
                }
                return RingNext::Empty;
            }
            let ring_row = &self.chunks[rel].rows[cursor.row_pos];
            cursor.row_pos += 1;
            let row = &ring_row.row;
            if row.lsn <= cursor.clock.get(row.replica_id) {
                // Already seen by a follower at the cursor's clock.
                continue;
            }
            let _ = cursor.clock.follow(row.replica_id, row.lsn);
            return RingNext::Row(ring_row.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrow::RowType;

    fn row(replica_id: u32, lsn: i64) -> Row {
        let mut row = Row::new(RowType::Insert, format!("r{}", lsn).into_bytes());
        row.replica_id = replica_id;
        row.lsn = lsn;
        row.tsn = lsn;
        row.is_commit = true;
        row
    }

    fn clock(pairs: &[(u32, i64)]) -> VClock {
        VClock::from_components(pairs.iter().copied())
    }

    /// Commit `rows` as one transaction.
    fn commit(ring: &mut XrowRing, rows: &[Row]) {
        let base = ring.end_clock().clone();
        ring.tx_begin(&base);
        ring.tx_write(rows);
        ring.tx_commit();
    }

    fn collect_lsns(ring: &XrowRing, cursor: &mut RingCursor) -> Vec<i64> {
        let mut lsns = Vec::new();
        while let RingNext::Row(r) = ring.next(cursor) {
            lsns.push(r.row.lsn);
        }
        lsns
    }

    #[test]
    fn test_cursor_reads_committed_rows_in_order() {
        let mut ring = XrowRing::default();
        commit(&mut ring, &[row(1, 1), row(1, 2)]);
        commit(&mut ring, &[row(1, 3)]);

        let mut cursor = ring.cursor(&VClock::new()).unwrap();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![1, 2, 3]);
        assert!(matches!(ring.next(&mut cursor), RingNext::Empty));
    }

    #[test]
    fn test_cursor_skips_rows_before_its_clock() {
        let mut ring = XrowRing::default();
        commit(&mut ring, &[row(1, 1), row(1, 2), row(1, 3)]);

        let mut cursor = ring.cursor(&clock(&[(1, 2)])).unwrap();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![3]);
    }

    #[test]
    fn test_cursor_at_end_waits_for_rows() {
        let mut ring = XrowRing::default();
        commit(&mut ring, &[row(1, 1)]);

        let mut cursor = ring.cursor(&clock(&[(1, 1)])).unwrap();
        assert!(matches!(ring.next(&mut cursor), RingNext::Empty));

        commit(&mut ring, &[row(1, 2)]);
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![2]);
    }

    #[test]
    fn test_staged_rows_invisible_until_commit() {
        let mut ring = XrowRing::default();
        commit(&mut ring, &[row(1, 1)]);

        let mut cursor = ring.cursor(&clock(&[(1, 1)])).unwrap();
        let base = ring.end_clock().clone();
        ring.tx_begin(&base);
        ring.tx_write(&[row(1, 2)]);
        assert!(matches!(ring.next(&mut cursor), RingNext::Empty));
        ring.tx_commit();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![2]);
    }

    #[test]
    fn test_rollback_discards_staged_rows() {
        let mut ring = XrowRing::default();
        commit(&mut ring, &[row(1, 1)]);
        let end_before = ring.end_clock().clone();

        let base = ring.end_clock().clone();
        ring.tx_begin(&base);
        ring.tx_write(&[row(1, 2), row(1, 3)]);
        ring.tx_rollback();

        assert_eq!(ring.end_clock(), &end_before);
        let mut cursor = ring.cursor(&clock(&[(1, 1)])).unwrap();
        assert!(matches!(ring.next(&mut cursor), RingNext::Empty));
    }

    #[test]
    fn test_eviction_invalidates_old_cursor() {
        let mut ring = XrowRing::new(2, 1);
        commit(&mut ring, &[row(1, 1)]);
        let mut cursor = ring.cursor(&VClock::new()).unwrap();

        // Each commit fills a one-row chunk; two more evict the first.
        commit(&mut ring, &[row(1, 2)]);
        commit(&mut ring, &[row(1, 3)]);

        assert!(matches!(ring.next(&mut cursor), RingNext::Gone));
    }

    #[test]
    fn test_cursor_create_fails_before_window() {
        let mut ring = XrowRing::new(2, 1);
        commit(&mut ring, &[row(1, 1)]);
        commit(&mut ring, &[row(1, 2)]);
        commit(&mut ring, &[row(1, 3)]);

        // {} precedes the retained window.
        assert!(ring.cursor(&VClock::new()).is_err());
        // A position inside the window is fine.
        let mut cursor = ring.cursor(&clock(&[(1, 2)])).unwrap();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![3]);
    }

    #[test]
    fn test_cursor_survives_writes_across_chunks() {
        let mut ring = XrowRing::new(4, 2);
        commit(&mut ring, &[row(1, 1)]);
        let mut cursor = ring.cursor(&VClock::new()).unwrap();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![1]);

        for lsn in 2..=6 {
            commit(&mut ring, &[row(1, lsn)]);
        }
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_reset_sets_continuation_point() {
        let mut ring = XrowRing::default();
        ring.reset(clock(&[(1, 10)]));
        commit(&mut ring, &[row(1, 11)]);

        // A follower at {1:10} reads from memory.
        let mut cursor = ring.cursor(&clock(&[(1, 10)])).unwrap();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![11]);
        // A follower at {1:0} is before the window.
        assert!(ring.cursor(&clock(&[(1, 9)])).is_err());
    }

    #[test]
    fn test_multi_replica_rows() {
        let mut ring = XrowRing::default();
        commit(&mut ring, &[row(1, 1), row(2, 5)]);
        let mut cursor = ring.cursor(&clock(&[(2, 5)])).unwrap();
        assert_eq!(collect_lsns(&ring, &mut cursor), vec![1]);
    }
}
