//! The WAL thread.
//!
//! A single thread owns the log directory, the current segment, the
//! in-memory row ring, the follower matrix clock and the watcher list.
//! Everything reaches it as a [`WalRequest`]; results travel back to the
//! submitting side as [`TxMessage`]s handled by the completion dispatcher.
//!
//! The cascading-rollback protocol is a four-hop bounce between the two
//! pipes. A failed batch closes the submission valve (the shared rollback
//! queue becomes non-empty when its completion message is processed), and
//! the bounce guarantees both pipes are drained before the queue is
//! reversed and completed:
//!
//! 1. WAL fails a batch, sends its completion, then `RollbackBounce1`.
//! 2. The dispatcher answers with `RollbackBounce2` on the WAL pipe;
//!    every entry that slipped in before the valve closed is already
//!    ahead of it and gets rolled back on arrival.
//! 3. The WAL answers with `RollbackBounce3`; the dispatcher reverses
//!    the accumulated queue and completes it with -1, newest first.
//! 4. `RollbackBounce4` reopens the WAL for writing.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::bus::{Endpoint, Pipe, Signal};
use crate::clock::{order_crossed, MClock, ReplicaId, VClock, REPLICA_ID_NIL};
use crate::config::WalMode;
use crate::fault::{self, knobs};
use crate::observability::{Logger, Severity};
use crate::ring::XrowRing;
use crate::xlog::{DirLock, SegmentMeta, XDir, XlogResult, XlogWriter};
use crate::xrow::{now_tm, Row};

use super::batch::{JournalEntry, WalBatch, JOURNAL_ENTRY_ERR};
use super::errors::{WalError, WalResult};
use super::watchers::{WatcherSlot, WAL_EVENT_ROTATE, WAL_EVENT_WRITE};

/// Closure executed on the WAL thread on behalf of a blocking call.
pub(crate) type WorkerFn = Box<dyn FnOnce(&mut WalWorker) + Send>;

/// Stamp rows with the writer time, sign local rows with the instance id
/// and fresh LSNs, and track every row in the batch diff clock. The LSN
/// of a transaction's first local row becomes the transaction id of all
/// its rows, and the final row carries the commit flag.
pub(crate) fn assign_lsn(
    instance_id: ReplicaId,
    base: &VClock,
    diff: &mut VClock,
    rows: &mut [Row],
) {
    let mut tsn = 0i64;
    let last = rows.len().saturating_sub(1);
    for (i, row) in rows.iter_mut().enumerate() {
        row.tm = now_tm();
        if row.replica_id == REPLICA_ID_NIL {
            row.lsn = diff.inc(instance_id) + base.get(instance_id);
            row.replica_id = instance_id;
            if tsn == 0 {
                tsn = row.lsn;
            }
            row.tsn = tsn;
            row.is_commit = i == last;
            if let Some(broken) = fault::maybe_break_lsn(knobs::WAL_BREAK_LSN, row.lsn) {
                Logger::log_stderr(
                    Severity::Warn,
                    "wal_injected_broken_lsn",
                    &[("lsn", &broken.to_string())],
                );
                row.lsn = broken;
            }
        } else {
            let delta = row.lsn - base.get(row.replica_id);
            if diff.follow(row.replica_id, delta).is_err() {
                Logger::log_stderr(
                    Severity::Warn,
                    "wal_non_monotonic_foreign_row",
                    &[
                        ("replica_id", &row.replica_id.to_string()),
                        ("lsn", &row.lsn.to_string()),
                    ],
                );
            }
        }
    }
}

/// Requests processed by the WAL thread.
pub(crate) enum WalRequest {
    /// Write a batch of journal entries.
    Batch(WalBatch),
    /// Run a closure with the worker state (blocking RPC body).
    Call(WorkerFn),
    /// A follower acknowledged up to `vclock`.
    RelayStatus { replica_id: ReplicaId, vclock: VClock },
    /// A follower left the replica set; drop its GC pin.
    RelayDelete { replica_id: ReplicaId },
    /// A watcher consumed its last notification.
    WatcherAck { name: String },
    /// Rollback bounce, second hop.
    RollbackBounce2,
    /// Rollback bounce, final hop.
    RollbackBounce4,
    /// Liveness probe; does nothing.
    Nop,
    /// Stop the thread.
    Shutdown,
}

/// Messages processed by the completion dispatcher on the TX side.
pub(crate) enum TxMessage {
    /// A batch came back from the WAL with results recorded.
    BatchDone(WalBatch),
    /// The WAL deleted segments; `vclock` is the oldest row it retains.
    GcNotify(VClock),
    /// Bytes written since the last checkpoint crossed the threshold.
    CheckpointThreshold,
    /// Rollback bounce, first hop.
    RollbackBounce1,
    /// Rollback bounce, third hop.
    RollbackBounce3,
}

/// The row ring plus its write signal, shared between the WAL thread
/// (writer) and relay threads (readers).
pub struct SharedRing {
    /// The ring itself.
    pub(crate) ring: Mutex<XrowRing>,
    /// Bumped after every committed ring transaction.
    pub(crate) write_signal: Signal,
}

impl SharedRing {
    pub(crate) fn new(ring: XrowRing) -> Self {
        Self { ring: Mutex::new(ring), write_signal: Signal::new() }
    }
}

/// State owned by the WAL thread.
pub(crate) struct WalWorker {
    pub mode: WalMode,
    max_size: u64,
    sync_on_flush: bool,
    dir: XDir,
    _dir_lock: DirLock,
    current: Option<XlogWriter>,
    pub vclock: VClock,
    instance_id: ReplicaId,
    pub in_rollback: bool,
    checkpoint_vclock: VClock,
    checkpoint_wal_size: i64,
    checkpoint_threshold: i64,
    checkpoint_triggered: bool,
    mclock: MClock,
    /// Cached starting vclock of the second-oldest segment; the cheap
    /// bound for "did this ack unpin a file".
    gc_wal_vclock: Option<VClock>,
    gc_first_vclock: VClock,
    watchers: Vec<WatcherSlot>,
    ring: Arc<SharedRing>,
    tx_pipe: Pipe<TxMessage>,
    meta_log: Option<XlogWriter>,
}

impl WalWorker {
    /// Build the worker: lock and scan the directory, open or quarantine
    /// the most recent segment, and seed the ring at `start_vclock`.
    pub(crate) fn new(
        mode: WalMode,
        max_size: u64,
        mut dir: XDir,
        dir_lock: DirLock,
        instance_id: ReplicaId,
        start_vclock: VClock,
        ring: Arc<SharedRing>,
        tx_pipe: Pipe<TxMessage>,
    ) -> WalResult<Self> {
        dir.scan().map_err(WalError::from)?;
        ring.ring.lock().unwrap().reset(start_vclock.clone());
        let mut worker = Self {
            mode,
            max_size,
            sync_on_flush: mode == WalMode::Fsync,
            dir,
            _dir_lock: dir_lock,
            current: None,
            vclock: start_vclock,
            instance_id,
            in_rollback: false,
            checkpoint_vclock: VClock::new(),
            checkpoint_wal_size: 0,
            checkpoint_threshold: i64::MAX,
            checkpoint_triggered: false,
            mclock: MClock::new(),
            gc_wal_vclock: None,
            gc_first_vclock: VClock::new(),
            watchers: Vec::new(),
            ring,
            tx_pipe,
            meta_log: None,
        };
        worker.gc_wal_vclock = worker.second_vclock();
        worker.open_current()?;
        Ok(worker)
    }

    /// Try to open the most recent segment for appending. A segment that
    /// fails structural checks is renamed `*.corrupted` and skipped; the
    /// next batch starts a fresh one.
    fn open_current(&mut self) -> WalResult<()> {
        let path = self.dir.format_filename(self.vclock.signature());
        if !path.exists() {
            return Ok(());
        }
        match XlogWriter::open_append(&path, self.sync_on_flush) {
            Ok((writer, scanned)) => {
                if scanned != self.vclock {
                    Logger::log(
                        Severity::Warn,
                        "wal_segment_vclock_mismatch",
                        &[
                            ("path", &path.display().to_string()),
                            ("scanned", &scanned.to_string()),
                            ("expected", &self.vclock.to_string()),
                        ],
                    );
                }
                self.current = Some(writer);
                Ok(())
            }
            Err(e) if e.is_corruption() => {
                let quarantine = path.with_extension("xlog.corrupted");
                Logger::log_stderr(
                    Severity::Warn,
                    "wal_segment_quarantined",
                    &[
                        ("path", &path.display().to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                std::fs::rename(&path, &quarantine)
                    .map_err(|e| WalError::io(format!("failed to quarantine segment: {}", e)))?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Thread main loop. Adjacent write requests already sitting in the
    /// queue coalesce into one batch; groups form only by concurrent
    /// arrival, never by waiting.
    pub(crate) fn run(mut self, endpoint: Endpoint<WalRequest>) {
        let mut deferred: VecDeque<WalRequest> = VecDeque::new();
        loop {
            let msg = match deferred.pop_front() {
                Some(msg) => msg,
                None => match endpoint.recv() {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                WalRequest::Batch(mut batch) => {
                    while let Some(next) = endpoint.try_recv() {
                        match next {
                            WalRequest::Batch(other) => batch.merge(other),
                            other => {
                                deferred.push_back(other);
                                break;
                            }
                        }
                    }
                    self.write_batch(batch);
                }
                WalRequest::Call(f) => f(&mut self),
                WalRequest::RelayStatus { replica_id, vclock } => {
                    self.relay_status(replica_id, vclock)
                }
                WalRequest::RelayDelete { replica_id } => self.relay_delete(replica_id),
                WalRequest::WatcherAck { name } => {
                    if let Some(slot) = self.watchers.iter_mut().find(|s| s.name == name) {
                        slot.ack();
                    }
                }
                WalRequest::RollbackBounce2 => {
                    let _ = self.tx_pipe.push(TxMessage::RollbackBounce3);
                }
                WalRequest::RollbackBounce4 => {
                    self.in_rollback = false;
                }
                WalRequest::Nop => {}
                WalRequest::Shutdown => break,
            }
        }
        self.shutdown();
    }

    /// Process one batch: rotate and preallocate if needed, then write
    /// entry by entry. An entry is moved to the rollback list the moment
    /// anything fails; everything written before the failure stays
    /// committed.
    fn write_batch(&mut self, mut batch: WalBatch) {
        if self.in_rollback {
            // Roll back on arrival until the end-of-rollback hop returns.
            let mut entries = std::mem::take(&mut batch.commit);
            for entry in &mut entries {
                entry.set_res(JOURNAL_ENTRY_ERR);
            }
            batch.rollback = entries;
            batch.vclock = self.vclock.clone();
            self.send_to_tx(TxMessage::BatchDone(batch));
            return;
        }

        fault::maybe_sleep(knobs::WAL_DELAY);

        if let Err(e) = self.rotate_if_needed() {
            self.fail_whole_batch(batch, e);
            return;
        }
        if let Err(e) = self.fallocate(batch.approx_len as u64) {
            self.fail_whole_batch(batch, e);
            return;
        }

        let entries = std::mem::take(&mut batch.commit);
        let mut committed = Vec::with_capacity(entries.len());
        let mut rollback = Vec::new();
        let mut failed = false;
        for mut entry in entries {
            if failed {
                entry.set_res(JOURNAL_ENTRY_ERR);
                rollback.push(entry);
                continue;
            }
            match self.write_entry(&mut entry) {
                Ok(bytes) => {
                    self.checkpoint_wal_size += bytes as i64;
                    committed.push(entry);
                }
                Err(e) => {
                    Logger::log_stderr(
                        Severity::Error,
                        "wal_write_failed",
                        &[("error", &e.to_string())],
                    );
                    entry.set_res(JOURNAL_ENTRY_ERR);
                    rollback.push(entry);
                    failed = true;
                }
            }
        }

        if !self.checkpoint_triggered && self.checkpoint_wal_size > self.checkpoint_threshold {
            if self.tx_pipe.push(TxMessage::CheckpointThreshold).is_ok() {
                self.checkpoint_triggered = true;
            }
        }

        let wrote = !committed.is_empty();
        let had_rollback = !rollback.is_empty();
        batch.commit = committed;
        batch.rollback = rollback;
        batch.vclock = self.vclock.clone();
        self.send_to_tx(TxMessage::BatchDone(batch));
        if had_rollback {
            self.begin_rollback();
        }
        if wrote {
            self.notify_watchers(WAL_EVENT_WRITE);
        }
    }

    /// Write one entry: assign LSNs, stage the rows in the ring, append
    /// them as one tx-block and flush. Commits the ring transaction only
    /// after the flush succeeded.
    fn write_entry(&mut self, entry: &mut JournalEntry) -> WalResult<u64> {
        let mut diff = VClock::new();
        self.assign_lsn(&mut diff, &mut entry.rows);
        entry.set_res(diff.signature() + self.vclock.signature());

        let encoded = {
            let mut ring = self.ring.ring.lock().unwrap();
            let base = ring.end_clock().clone();
            ring.tx_begin(&base);
            ring.tx_write(&entry.rows)
        };

        let io_result = (|| -> XlogResult<u64> {
            let current = self.current.as_mut().expect("rotation precedes writes");
            let bytes = current.append_tx(&encoded)?;
            current.flush()?;
            Ok(bytes)
        })();

        match io_result {
            Ok(bytes) => {
                self.ring.ring.lock().unwrap().tx_commit();
                self.ring.write_signal.notify();
                self.vclock.merge(&diff);
                Ok(bytes)
            }
            Err(e) => {
                self.ring.ring.lock().unwrap().tx_rollback();
                if let Some(current) = self.current.as_mut() {
                    current.discard_buffered();
                }
                Err(WalError::from(e))
            }
        }
    }

    /// Assign LSNs to local rows and track every row in the diff clock.
    fn assign_lsn(&self, diff: &mut VClock, rows: &mut [Row]) {
        assign_lsn(self.instance_id, &self.vclock, diff, rows);
    }

    /// Fail every entry of a batch before anything was written and enter
    /// rollback mode.
    fn fail_whole_batch(&mut self, mut batch: WalBatch, err: WalError) {
        Logger::log_stderr(Severity::Error, "wal_batch_failed", &[("error", &err.to_string())]);
        let mut entries = std::mem::take(&mut batch.commit);
        for entry in &mut entries {
            entry.set_res(JOURNAL_ENTRY_ERR);
        }
        batch.rollback = entries;
        batch.vclock = self.vclock.clone();
        self.send_to_tx(TxMessage::BatchDone(batch));
        self.begin_rollback();
    }

    fn begin_rollback(&mut self) {
        self.in_rollback = true;
        self.send_to_tx(TxMessage::RollbackBounce1);
    }

    fn send_to_tx(&self, msg: TxMessage) {
        if self.tx_pipe.push(msg).is_err() {
            Logger::log_stderr(Severity::Warn, "wal_tx_pipe_closed", &[]);
        }
    }

    /// Close the current segment if it outgrew the limit and open a new
    /// one on demand. The old segment is sealed before the new one is
    /// created so followers observe EOF in order.
    fn rotate_if_needed(&mut self) -> WalResult<()> {
        if fault::is_armed(knobs::WAL_ROTATE) {
            return Err(WalError::injection(knobs::WAL_ROTATE));
        }
        if let Some(current) = &self.current {
            if current.offset() >= self.max_size {
                let writer = self.current.take().expect("checked above");
                let path = writer.path().display().to_string();
                if let Err(e) = writer.close() {
                    // Close failure cannot be handled in any reasonable
                    // way; the sealed-at-crash reader path covers it.
                    Logger::log_stderr(
                        Severity::Warn,
                        "wal_segment_close_failed",
                        &[("path", &path), ("error", &e.to_string())],
                    );
                }
            }
        }
        if self.current.is_some() {
            return Ok(());
        }
        let writer = self.dir.create_segment(&self.vclock, self.sync_on_flush)?;
        Logger::log(
            Severity::Info,
            "wal_rotate",
            &[("path", &writer.path().display().to_string())],
        );
        self.current = Some(writer);
        if self.gc_wal_vclock.is_none() {
            self.gc_wal_vclock = self.second_vclock();
        }
        self.notify_watchers(WAL_EVENT_ROTATE);
        Ok(())
    }

    /// Make sure enough space is preallocated for `len` encoded bytes.
    ///
    /// On out-of-space, delete sealed segments not needed to recover from
    /// the last checkpoint, one at a time, and retry.
    fn fallocate(&mut self, len: u64) -> WalResult<()> {
        // Fixheaders and framing make the write larger than the row
        // estimate; double it for a rough upper bound.
        let len = len * 2;
        let gc_signature = self.checkpoint_vclock.signature();
        let mut warned = false;
        let mut notify = false;
        let result = loop {
            let attempt = self
                .current
                .as_mut()
                .expect("rotation precedes preallocation")
                .fallocate(len);
            match attempt {
                Ok(()) => break Ok(()),
                Err(e) if e.is_no_space() => {
                    if !self.dir.has_garbage(gc_signature) {
                        break Err(e);
                    }
                    if !warned {
                        Logger::log_stderr(
                            Severity::Error,
                            "wal_out_of_space",
                            &[("action", "deleting old segments")],
                        );
                        warned = true;
                    }
                    if let Some(bound) = self.dir.match_signature(gc_signature) {
                        self.dir.collect_garbage(bound, true);
                    }
                    self.gc_wal_vclock = self.second_vclock();
                    if let Some(gc_wal) = self.gc_wal_vclock.clone() {
                        if self.gc_first_vclock.partial_cmp_clock(&gc_wal)
                            == Some(Ordering::Less)
                        {
                            self.gc_first_vclock = gc_wal;
                        }
                    }
                    notify = true;
                }
                Err(e) => break Err(e),
            }
        };
        if notify {
            self.send_gc_notify();
        }
        result.map_err(WalError::from)
    }

    /// Starting vclock of the second-oldest segment. With exactly one
    /// sealed segment on disk the writer vclock stands in for the not yet
    /// created next segment.
    fn second_vclock(&self) -> Option<VClock> {
        let first = self.dir.first()?;
        if let Some(second) = self.dir.next_after(first.signature()) {
            return Some(second.clone());
        }
        if first.signature() != self.vclock.signature() {
            return Some(self.vclock.clone());
        }
        None
    }

    /// Tell the TX side what the oldest retained row is now.
    fn send_gc_notify(&self) {
        let vclock = self.dir.first().cloned().unwrap_or_else(|| self.vclock.clone());
        self.send_to_tx(TxMessage::GcNotify(vclock));
    }

    /// Collect every segment below the GC horizon: the lower of the
    /// explicit first-preserved vclock and the slowest follower's ack.
    fn collect_garbage(&mut self) {
        let mut collect = self.gc_first_vclock.clone();
        if let Some(min) = self.mclock.min() {
            match collect.partial_cmp_clock(&min) {
                Some(Ordering::Greater) | None => collect = min,
                _ => {}
            }
        }
        let collect_signature = if self.current.is_none()
            && collect.signature() >= self.vclock.signature()
        {
            // The last segment is sealed and every consumer is past it.
            Some(collect.signature())
        } else {
            self.dir.match_vclock(&collect).map(VClock::signature)
        };
        if let Some(signature) = collect_signature {
            self.dir.collect_garbage(signature, false);
            self.gc_wal_vclock = self.second_vclock();
            self.send_gc_notify();
        }
    }

    /// Handle a follower acknowledgement.
    fn relay_status(&mut self, replica_id: ReplicaId, vclock: VClock) {
        let old = self.mclock.get(replica_id).cloned().unwrap_or_default();
        self.mclock.update(replica_id, vclock.clone());
        if let Some(gc_wal) = self.gc_wal_vclock.clone() {
            if order_crossed(&old, &gc_wal, &vclock) {
                self.collect_garbage();
            }
        }
    }

    /// Handle a follower leaving the replica set.
    fn relay_delete(&mut self, replica_id: ReplicaId) {
        self.mclock.remove(replica_id);
        self.collect_garbage();
    }

    fn notify_watchers(&mut self, events: u8) {
        for watcher in &mut self.watchers {
            watcher.notify(events);
        }
    }

    // --- blocking call bodies -------------------------------------------

    pub(crate) fn sync_vclock(&self) -> WalResult<VClock> {
        if self.in_rollback {
            return Err(WalError::rollback("sync during cascading rollback"));
        }
        Ok(self.vclock.clone())
    }

    /// Seal the current segment (if it holds rows) and report the state a
    /// checkpoint at this moment would capture.
    pub(crate) fn begin_checkpoint(&mut self) -> WalResult<(VClock, i64)> {
        if self.in_rollback {
            return Err(WalError::checkpoint_rollback());
        }
        let close = match &self.current {
            Some(current) => {
                current.meta().vclock.signature() != self.vclock.signature()
            }
            None => false,
        };
        if close {
            let writer = self.current.take().expect("checked above");
            let path = writer.path().display().to_string();
            if let Err(e) = writer.close() {
                Logger::log_stderr(
                    Severity::Warn,
                    "wal_segment_close_failed",
                    &[("path", &path), ("error", &e.to_string())],
                );
            }
            if self.gc_wal_vclock.is_none() {
                self.gc_wal_vclock = self.second_vclock();
            }
        }
        Ok((self.vclock.clone(), self.checkpoint_wal_size))
    }

    /// Record a completed checkpoint. Writes continued while it was being
    /// made, so the observed size is subtracted rather than zeroed.
    pub(crate) fn commit_checkpoint(&mut self, vclock: VClock, wal_size: i64) {
        self.checkpoint_vclock = vclock;
        self.checkpoint_wal_size = (self.checkpoint_wal_size - wal_size).max(0);
        self.checkpoint_triggered = false;
    }

    pub(crate) fn set_checkpoint_threshold(&mut self, threshold: i64) {
        self.checkpoint_threshold = threshold;
    }

    /// Set the lower bound a consumer still requires, waking GC when the
    /// move unpinned a sealed segment.
    pub(crate) fn set_gc_first_vclock(&mut self, vclock: VClock) {
        let crossed = match self.gc_wal_vclock.clone() {
            Some(gc_wal) => order_crossed(&self.gc_first_vclock, &gc_wal, &vclock),
            None => false,
        };
        self.gc_first_vclock = vclock;
        if crossed {
            self.collect_garbage();
        }
    }

    pub(crate) fn attach_watcher(&mut self, name: String, pipe: Pipe<u8>) {
        let mut slot = WatcherSlot::new(name, pipe);
        // Deliver ROTATE right away so the subscriber processes the
        // existing segments before waiting for fresh events.
        slot.notify(WAL_EVENT_ROTATE);
        self.watchers.push(slot);
    }

    pub(crate) fn detach_watcher(&mut self, name: &str) {
        self.watchers.retain(|slot| slot.name != name);
    }

    /// Append rows to the auxiliary metadata log, opening it on first
    /// use. The metadata log shares the WAL thread so all file I/O stays
    /// here, but has its own fixed-name file outside the segment index.
    pub(crate) fn write_meta_log(&mut self, rows: Vec<Row>) -> WalResult<()> {
        if self.meta_log.is_none() {
            let path = self.dir.dirname().join("meta.xlog");
            let writer = if path.exists() {
                XlogWriter::open_append(&path, self.sync_on_flush)?.0
            } else {
                XlogWriter::create(
                    &path,
                    SegmentMeta::new(self.dir.instance(), self.vclock.clone()),
                    self.sync_on_flush,
                )?
            };
            self.meta_log = Some(writer);
        }
        let encoded: Vec<Vec<u8>> = rows.iter().map(Row::encode).collect();
        let log = self.meta_log.as_mut().expect("opened above");
        log.append_tx(&encoded)?;
        log.flush()?;
        Ok(())
    }

    /// Seal the metadata log; the next write starts a fresh one.
    pub(crate) fn rotate_meta_log(&mut self) {
        if let Some(log) = self.meta_log.take() {
            let path = log.path().display().to_string();
            if let Err(e) = log.close() {
                Logger::log_stderr(
                    Severity::Warn,
                    "meta_log_close_failed",
                    &[("path", &path), ("error", &e.to_string())],
                );
            }
        }
    }

    /// Thread teardown: leave a sealed segment at the final vclock so a
    /// restart learns the instance position without rescanning, and close
    /// whatever is open. Dropping the watcher slots closes their pipes,
    /// which is how relays learn the WAL is gone.
    fn shutdown(&mut self) {
        if self.mode != WalMode::None {
            let need_marker = match &self.current {
                None => true,
                Some(current) => {
                    self.vclock.partial_cmp_clock(&current.meta().vclock)
                        == Some(Ordering::Greater)
                }
            };
            if need_marker {
                let path = self.dir.format_filename(self.vclock.signature());
                if !path.exists() {
                    match self.dir.create_segment(&self.vclock, self.sync_on_flush) {
                        Ok(writer) => {
                            if let Err(e) = writer.close() {
                                Logger::log_stderr(
                                    Severity::Warn,
                                    "wal_shutdown_segment_failed",
                                    &[("error", &e.to_string())],
                                );
                            }
                        }
                        Err(e) => {
                            Logger::log_stderr(
                                Severity::Warn,
                                "wal_shutdown_segment_failed",
                                &[("error", &e.to_string())],
                            );
                        }
                    }
                }
            }
        }
        if let Some(current) = self.current.take() {
            let path = current.path().display().to_string();
            if let Err(e) = current.close() {
                Logger::log_stderr(
                    Severity::Warn,
                    "wal_segment_close_failed",
                    &[("path", &path), ("error", &e.to_string())],
                );
            }
        }
        self.rotate_meta_log();
        Logger::log(Severity::Info, "wal_shutdown", &[("vclock", &self.vclock.to_string())]);
    }
}
