//! Write-ahead log writer.
//!
//! The WAL is the durability authority of the instance: a transaction
//! exists once its rows are flushed to the current segment, and only the
//! WAL assigns real LSNs. All file I/O happens on one dedicated thread;
//! the submitting side talks to it exclusively over the message bus.
//!
//! # Guarantees
//!
//! - A journal entry's completion callback runs exactly once, with the
//!   LSN signature on commit or -1 on rollback.
//! - Commit results are strictly increasing in submission order.
//! - After an I/O failure, every entry that was in flight is rolled back
//!   in reverse submission order, and new submissions are rejected until
//!   the rollback protocol completes.
//! - No segment still needed by the last checkpoint or any attached
//!   follower is ever deleted.
//!
//! # Lifecycle
//!
//! [`Wal::init`] locks the directory, scans the segment index, opens (or
//! quarantines) the newest segment and spawns two threads: the WAL writer
//! and the completion dispatcher. [`Wal::free`] (or drop) stops both,
//! sealing a final segment at the instance vclock so restart recovery
//! does not rescan the log.

mod batch;
mod errors;
mod watchers;
mod writer;

pub use batch::{JournalEntry, JOURNAL_ENTRY_ERR};
pub use errors::{Severity, WalError, WalErrorCode, WalResult};
pub use watchers::{WalWatcher, WAL_EVENT_ROTATE, WAL_EVENT_WRITE};
pub use writer::SharedRing;

pub(crate) use batch::WalBatch;
pub(crate) use writer::{TxMessage, WalRequest, WalWorker};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use uuid::Uuid;

use crate::bus::{self, Endpoint, Pipe};
use crate::clock::{ReplicaId, VClock};
use crate::config::{WalConfig, WalMode};
use crate::fault::{self, knobs};
use crate::observability::{Logger, Severity as LogSeverity};
use crate::ring::XrowRing;
use crate::xlog::{DirLock, XDir};
use crate::xrow::Row;

/// Callback invoked on the dispatcher thread when the WAL had to delete
/// segments; the argument is the oldest row the WAL still retains.
pub type OnGarbageCollection = Box<dyn Fn(&VClock) + Send>;

/// Callback invoked once when bytes written since the last checkpoint
/// cross the configured threshold.
pub type OnCheckpointThreshold = Box<dyn Fn() + Send>;

/// Result of [`Wal::begin_checkpoint`], fed back to
/// [`Wal::commit_checkpoint`] once the engine snapshot is durable.
#[derive(Debug, Clone)]
pub struct WalCheckpoint {
    /// State the checkpoint captures.
    pub vclock: VClock,
    /// Bytes written since the previous checkpoint, as observed when the
    /// checkpoint began.
    pub wal_size: i64,
}

/// Construction parameters for [`Wal::init`].
pub struct WalOptions {
    /// Durability configuration.
    pub config: WalConfig,
    /// Numeric id of this instance in the replica set.
    pub instance_id: ReplicaId,
    /// UUID stamped into segment headers.
    pub instance_uuid: Uuid,
    /// Log position recovered at startup.
    pub start_vclock: VClock,
    /// GC notification callback.
    pub on_garbage_collection: OnGarbageCollection,
    /// Checkpoint threshold callback.
    pub on_checkpoint_threshold: OnCheckpointThreshold,
    /// Chunks retained by the in-memory row ring.
    pub ring_chunks: usize,
    /// Rows per ring chunk.
    pub ring_chunk_rows: usize,
}

impl WalOptions {
    /// Options with no-op callbacks and a zero starting vclock.
    pub fn new(config: WalConfig, instance_id: ReplicaId, instance_uuid: Uuid) -> Self {
        Self {
            config,
            instance_id,
            instance_uuid,
            start_vclock: VClock::new(),
            on_garbage_collection: Box::new(|_| {}),
            on_checkpoint_threshold: Box::new(|| {}),
            ring_chunks: crate::ring::RING_CHUNK_COUNT,
            ring_chunk_rows: crate::ring::RING_CHUNK_ROWS,
        }
    }
}

/// State shared between the public handle and the completion dispatcher.
pub(crate) struct TxShared {
    /// The submission-side view of the log position, updated as batches
    /// complete.
    pub vclock: Mutex<VClock>,
    /// The rollback accumulator. Non-empty means the submission valve is
    /// closed: new entries are rejected on arrival.
    pub rollback: Mutex<Vec<JournalEntry>>,
}

/// Handle to the WAL writer.
///
/// Cheap operations (`write`, relay status updates) are fire-and-forget
/// messages; `sync`, checkpointing and GC bounds are blocking calls into
/// the WAL thread.
pub struct Wal {
    mode: WalMode,
    wal_pipe: Pipe<WalRequest>,
    shared: Arc<TxShared>,
    ring: Arc<SharedRing>,
    instance_id: ReplicaId,
    instance_uuid: Uuid,
    wal_dir: PathBuf,
    wal_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
}

impl Wal {
    /// Initialize the writer and spawn its threads.
    pub fn init(opts: WalOptions) -> WalResult<Wal> {
        let WalOptions {
            config,
            instance_id,
            instance_uuid,
            start_vclock,
            on_garbage_collection,
            on_checkpoint_threshold,
            ring_chunks,
            ring_chunk_rows,
        } = opts;

        let dir = XDir::open(&config.dir, instance_uuid)?;
        let dir_lock = DirLock::acquire(dir.dirname())?;
        let wal_dir = dir.dirname().to_path_buf();

        let ring = Arc::new(SharedRing::new(XrowRing::new(ring_chunks, ring_chunk_rows)));
        let (wal_pipe, wal_endpoint) = bus::pipe::<WalRequest>("wal");
        let (tx_pipe, tx_endpoint) = bus::pipe::<TxMessage>("tx_prio");

        let worker = WalWorker::new(
            config.mode,
            config.max_size,
            dir,
            dir_lock,
            instance_id,
            start_vclock.clone(),
            Arc::clone(&ring),
            tx_pipe,
        )?;

        let shared = Arc::new(TxShared {
            vclock: Mutex::new(start_vclock),
            rollback: Mutex::new(Vec::new()),
        });

        let wal_thread = thread::Builder::new()
            .name("wal".to_string())
            .spawn(move || worker.run(wal_endpoint))
            .map_err(|e| WalError::io(format!("failed to spawn the WAL thread: {}", e)))?;

        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher_pipe = wal_pipe.clone();
        let tx_thread = thread::Builder::new()
            .name("wal_tx".to_string())
            .spawn(move || {
                run_dispatcher(
                    tx_endpoint,
                    dispatcher_shared,
                    dispatcher_pipe,
                    on_garbage_collection,
                    on_checkpoint_threshold,
                )
            })
            .map_err(|e| WalError::io(format!("failed to spawn the dispatcher thread: {}", e)))?;

        Ok(Wal {
            mode: config.mode,
            wal_pipe,
            shared,
            ring,
            instance_id,
            instance_uuid,
            wal_dir,
            wal_thread: Some(wal_thread),
            tx_thread: Some(tx_thread),
        })
    }

    /// Durability mode.
    pub fn mode(&self) -> WalMode {
        self.mode
    }

    /// Numeric instance id.
    pub fn instance_id(&self) -> ReplicaId {
        self.instance_id
    }

    /// Instance UUID.
    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// The WAL directory.
    pub fn dir(&self) -> &Path {
        &self.wal_dir
    }

    /// The submission-side log position.
    pub fn vclock(&self) -> VClock {
        self.shared.vclock.lock().unwrap().clone()
    }

    /// Submit one journal entry.
    ///
    /// The entry's completion callback fires exactly once: on this
    /// thread when the entry is rejected synchronously, on the dispatcher
    /// thread otherwise. `Err` means the callback has already run with
    /// -1.
    pub fn write(&self, entry: JournalEntry) -> WalResult<()> {
        let mut entry = entry;
        if fault::is_armed(knobs::WAL_IO) {
            entry.complete_with(JOURNAL_ENTRY_ERR);
            return Err(WalError::injection(knobs::WAL_IO));
        }
        if self.mode == WalMode::None {
            return self.write_wal_mode_none(entry);
        }

        // The valve: checking and pushing under one lock guarantees that
        // every accepted entry is ahead of the rollback bounce in the
        // WAL pipe.
        let valve = self.shared.rollback.lock().unwrap();
        if !valve.is_empty() {
            drop(valve);
            Logger::log_stderr(
                LogSeverity::Error,
                "wal_write_rejected",
                &[("reason", "cascading rollback in progress")],
            );
            entry.complete_with(JOURNAL_ENTRY_ERR);
            return Err(WalError::rollback("aborting transaction during cascading rollback"));
        }
        let result = self.wal_pipe.try_push(WalRequest::Batch(WalBatch::single(entry)));
        drop(valve);
        match result {
            Ok(()) => Ok(()),
            Err(WalRequest::Batch(mut batch)) => {
                if let Some(mut entry) = batch.commit.pop() {
                    entry.complete_with(JOURNAL_ENTRY_ERR);
                }
                Err(WalError::shutdown())
            }
            Err(_) => Err(WalError::shutdown()),
        }
    }

    /// Fast path without a WAL: assign LSNs synchronously against the
    /// submission-side clock and complete inline. No durability.
    fn write_wal_mode_none(&self, mut entry: JournalEntry) -> WalResult<()> {
        let mut vclock = self.shared.vclock.lock().unwrap();
        let mut diff = VClock::new();
        writer::assign_lsn(self.instance_id, &vclock, &mut diff, &mut entry.rows);
        vclock.merge(&diff);
        entry.set_res(vclock.signature());
        drop(vclock);
        entry.complete();
        Ok(())
    }

    /// Block until every previously submitted entry is durable and
    /// return the WAL's vclock.
    pub fn sync(&self) -> WalResult<VClock> {
        if fault::is_armed(knobs::WAL_SYNC) {
            return Err(WalError::injection(knobs::WAL_SYNC));
        }
        if self.mode == WalMode::None {
            return Ok(self.vclock());
        }
        if !self.shared.rollback.lock().unwrap().is_empty() {
            return Err(WalError::rollback("sync during cascading rollback"));
        }
        self.call(|worker| worker.sync_vclock())?
    }

    /// Seal the current segment and report the state a checkpoint taken
    /// now would capture.
    pub fn begin_checkpoint(&self) -> WalResult<WalCheckpoint> {
        if self.mode == WalMode::None {
            return Ok(WalCheckpoint { vclock: self.vclock(), wal_size: 0 });
        }
        if !self.shared.rollback.lock().unwrap().is_empty() {
            // In-memory state may hold changes scheduled for rollback; a
            // checkpoint would persist them.
            return Err(WalError::checkpoint_rollback());
        }
        let inner = self.call(|worker| worker.begin_checkpoint())?;
        inner.map(|(vclock, wal_size)| WalCheckpoint { vclock, wal_size })
    }

    /// Record a completed checkpoint, advancing the deletion floor.
    pub fn commit_checkpoint(&self, checkpoint: WalCheckpoint) {
        if self.mode == WalMode::None {
            return;
        }
        let _ = self.call(move |worker| {
            worker.commit_checkpoint(checkpoint.vclock, checkpoint.wal_size)
        });
    }

    /// Ask for [`OnCheckpointThreshold`] once the WAL grows past
    /// `threshold` bytes since the last checkpoint.
    pub fn set_checkpoint_threshold(&self, threshold: u64) {
        if self.mode == WalMode::None {
            return;
        }
        let threshold = i64::try_from(threshold).unwrap_or(i64::MAX);
        let _ = self.call(move |worker| worker.set_checkpoint_threshold(threshold));
    }

    /// Set the oldest vclock any non-replication consumer still needs.
    pub fn set_gc_first_vclock(&self, vclock: VClock) {
        if self.mode == WalMode::None {
            return;
        }
        let _ = self.call(move |worker| worker.set_gc_first_vclock(vclock));
    }

    /// Attach a watcher. `ROTATE` is delivered immediately so the
    /// subscriber processes the existing segments first.
    pub fn set_watcher(&self, name: impl Into<String>) -> WalResult<WalWatcher> {
        let name = name.into();
        let (pipe, endpoint) = bus::pipe::<u8>("wal_watcher");
        let slot_name = name.clone();
        self.call(move |worker| worker.attach_watcher(slot_name, pipe))?;
        Ok(WalWatcher::new(name, endpoint, self.wal_pipe.clone()))
    }

    /// Detach a watcher.
    pub fn clear_watcher(&self, watcher: WalWatcher) {
        let name = watcher.name().to_string();
        let _ = self.call(move |worker| worker.detach_watcher(&name));
    }

    /// Record a follower acknowledgement for GC purposes.
    pub fn relay_status_update(&self, replica_id: ReplicaId, vclock: VClock) {
        let _ = self.wal_pipe.push(WalRequest::RelayStatus { replica_id, vclock });
    }

    /// Drop a follower's GC pin after it leaves the replica set.
    pub fn relay_delete(&self, replica_id: ReplicaId) {
        let _ = self.wal_pipe.push(WalRequest::RelayDelete { replica_id });
    }

    /// Append rows to the auxiliary metadata log through the WAL thread.
    pub fn write_meta_log(&self, rows: Vec<Row>) -> WalResult<()> {
        self.call(move |worker| worker.write_meta_log(rows))?
    }

    /// Seal the metadata log; the next write starts a fresh one.
    pub fn rotate_meta_log(&self) {
        let _ = self.call(|worker| worker.rotate_meta_log());
    }

    pub(crate) fn ring(&self) -> &Arc<SharedRing> {
        &self.ring
    }

    pub(crate) fn request_pipe(&self) -> Pipe<WalRequest> {
        self.wal_pipe.clone()
    }

    /// Run a closure on the WAL thread and wait for its result.
    fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut WalWorker) -> R + Send + 'static,
    ) -> WalResult<R> {
        bus::call(&self.wal_pipe, |reply| {
            WalRequest::Call(Box::new(move |worker| {
                let _ = reply.send(f(worker));
            }))
        })
        .map_err(|_| WalError::shutdown())
    }

    /// Stop both threads, sealing the log.
    pub fn free(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        let _ = self.wal_pipe.push(WalRequest::Shutdown);
        if let Some(handle) = self.wal_thread.take() {
            if handle.join().is_err() {
                // Nothing can be recovered from a wedged WAL thread.
                Logger::log_stderr(LogSeverity::Fatal, "wal_thread_join_failed", &[]);
            }
        }
        if let Some(handle) = self.tx_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if self.wal_thread.is_some() {
            self.shutdown_impl();
        }
    }
}

/// Completion dispatcher loop. Runs entry completions in submission
/// order, maintains the submission-side vclock, closes the rollback
/// valve, and relays the GC and checkpoint callbacks.
fn run_dispatcher(
    endpoint: Endpoint<TxMessage>,
    shared: Arc<TxShared>,
    wal_pipe: Pipe<WalRequest>,
    on_garbage_collection: OnGarbageCollection,
    on_checkpoint_threshold: OnCheckpointThreshold,
) {
    while let Some(msg) = endpoint.recv() {
        match msg {
            TxMessage::BatchDone(mut batch) => {
                *shared.vclock.lock().unwrap() = batch.vclock.clone();
                if !batch.rollback.is_empty() {
                    // Closes the submission valve.
                    shared.rollback.lock().unwrap().append(&mut batch.rollback);
                }
                for entry in &mut batch.commit {
                    entry.complete();
                }
            }
            TxMessage::GcNotify(vclock) => on_garbage_collection(&vclock),
            TxMessage::CheckpointThreshold => on_checkpoint_threshold(),
            TxMessage::RollbackBounce1 => {
                let _ = wal_pipe.push(WalRequest::RollbackBounce2);
            }
            TxMessage::RollbackBounce3 => {
                // Drain the accumulator and reopen the WAL before the
                // valve reopens, so a submission racing the tail of the
                // rollback lands after the final hop.
                let mut drained: Vec<JournalEntry> = {
                    let mut queue = shared.rollback.lock().unwrap();
                    let drained = queue.drain(..).collect();
                    let _ = wal_pipe.push(WalRequest::RollbackBounce4);
                    drained
                };
                // Complete in reverse submission order: replaying the
                // in-memory state backwards needs the newest change
                // undone first.
                drained.reverse();
                for entry in &mut drained {
                    entry.complete_with(JOURNAL_ENTRY_ERR);
                }
            }
        }
    }
}
