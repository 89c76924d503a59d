//! Journal entries and write batches.
//!
//! A journal entry is one atomic transaction: an ordered list of rows and
//! a completion callback that fires exactly once, with the sum of the
//! assigned LSNs on commit or -1 on rollback. Entries are owned by the
//! submitting side; the WAL borrows them for the duration of the round
//! trip by taking them over the bus and handing them back completed.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::clock::VClock;
use crate::xrow::Row;

/// Completion result of a rolled-back entry.
pub const JOURNAL_ENTRY_ERR: i64 = -1;

/// One atomic transaction headed for the log.
pub struct JournalEntry {
    /// Rows of the transaction, in statement order. The WAL stamps the
    /// final row with the commit flag.
    pub rows: Vec<Row>,
    /// Approximate encoded size, used for preallocation.
    pub approx_len: usize,
    /// Write result: LSN signature on commit, -1 on rollback. Written
    /// exactly once, by the WAL.
    res: i64,
    completion: Option<Box<dyn FnOnce(i64) + Send>>,
}

impl std::fmt::Debug for JournalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalEntry")
            .field("rows", &self.rows.len())
            .field("approx_len", &self.approx_len)
            .field("res", &self.res)
            .finish()
    }
}

impl JournalEntry {
    /// A new entry whose completion callback receives the write result.
    pub fn new(rows: Vec<Row>, completion: impl FnOnce(i64) + Send + 'static) -> Self {
        let approx_len = rows.iter().map(Row::encoded_len).sum();
        Self { rows, approx_len, res: 0, completion: Some(Box::new(completion)) }
    }

    /// A new entry paired with a channel that receives the result. The
    /// convenient form for code that wants to block on durability.
    pub fn with_channel(rows: Vec<Row>) -> (Self, Receiver<i64>) {
        let (tx, rx): (Sender<i64>, Receiver<i64>) = mpsc::channel();
        let entry = Self::new(rows, move |res| {
            let _ = tx.send(res);
        });
        (entry, rx)
    }

    /// The write result recorded so far.
    pub fn res(&self) -> i64 {
        self.res
    }

    pub(crate) fn set_res(&mut self, res: i64) {
        self.res = res;
    }

    /// Run the completion callback. Idempotent: the callback fires only
    /// on the first call.
    pub(crate) fn complete(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion(self.res);
        }
    }

    /// Record a rollback result and complete.
    pub(crate) fn complete_with(&mut self, res: i64) {
        self.res = res;
        self.complete();
    }
}

/// A batch of entries processed by the WAL thread in one step. Entries
/// submitted while a batch is still queued coalesce into it.
#[derive(Debug)]
pub(crate) struct WalBatch {
    /// Sum of the entries' approximate encoded sizes.
    pub approx_len: usize,
    /// Input queue; after processing, the entries that committed.
    pub commit: Vec<JournalEntry>,
    /// After processing, the entries that must be rolled back.
    pub rollback: Vec<JournalEntry>,
    /// Writer vclock after the batch was processed.
    pub vclock: VClock,
}

impl WalBatch {
    /// A batch holding a single entry.
    pub fn single(entry: JournalEntry) -> Self {
        Self {
            approx_len: entry.approx_len,
            commit: vec![entry],
            rollback: Vec::new(),
            vclock: VClock::new(),
        }
    }

    /// Absorb another batch submitted while this one was queued.
    pub fn merge(&mut self, other: WalBatch) {
        self.approx_len += other.approx_len;
        self.commit.extend(other.commit);
    }
}
