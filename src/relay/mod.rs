//! Replication relay.
//!
//! A relay streams committed rows to one follower. It prefers the WAL's
//! in-memory row ring and falls back to replaying segment files whenever
//! the follower's position has left the ring, alternating between the
//! two until cancellation. A paired reader thread consumes the
//! follower's acknowledgement frames and feeds them to the WAL for
//! garbage-collection accounting.
//!
//! Row policies applied before the user filter:
//!
//! - Instance-local rows never leave as-is: rows signed by an anonymous
//!   instance are dropped, the rest are rewritten into NOPs so the
//!   follower's clock advances without applying data.
//! - On subscribe, rows originating from the follower itself are not
//!   echoed back, unless the follower lost them in a crash (their LSN is
//!   at or below the local clock at subscribe time).

mod errors;
mod filter;
mod reader;

pub use errors::{RelayError, RelayErrorKind, RelayResult};
pub use filter::{pass_all, FilterAction, RowFilter};

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::bus::Pipe;
use crate::clock::{ReplicaId, VClock, REPLICA_ID_NIL};
use crate::config::ReplicationConfig;
use crate::fault::{self, knobs};
use crate::observability::{Logger, Severity};
use crate::recovery::{RecoverStatus, Recovery, RecoveryError};
use crate::ring::RingNext;
use crate::wal::{SharedRing, Wal, WalRequest, WalWatcher};
use crate::xrow::{GroupId, Row};

/// Byte stream to a follower. Implemented by [`TcpStream`]; tests use
/// loopback sockets.
pub trait RelayStream: Read + Write + Send {
    /// Bound blocking reads so disconnect detection and cancellation
    /// stay responsive.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// A second handle to the same stream for the ack reader.
    fn try_clone_stream(&self) -> io::Result<Box<dyn RelayStream>>;
}

impl RelayStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn try_clone_stream(&self) -> io::Result<Box<dyn RelayStream>> {
        Ok(Box::new(self.try_clone()?))
    }
}

/// State shared between the relay thread, the ack reader and the public
/// handle.
pub(crate) struct RelayShared {
    cancelled: AtomicBool,
    /// Last vclock acknowledged by the follower.
    recv_vclock: Mutex<VClock>,
    /// Position of the stream sent so far.
    sent_vclock: Mutex<VClock>,
    /// When the last row or heartbeat went out.
    last_row_time: Mutex<Instant>,
    /// First error observed; preserved across stop for status reporting.
    diag: Mutex<Option<RelayError>>,
}

impl RelayShared {
    pub(crate) fn new(replica_clock: VClock) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            recv_vclock: Mutex::new(replica_clock.clone()),
            sent_vclock: Mutex::new(replica_clock),
            last_row_time: Mutex::new(Instant::now()),
            diag: Mutex::new(None),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Record an error; the first one wins.
    pub(crate) fn set_diag(&self, err: RelayError) {
        let mut diag = self.diag.lock().unwrap();
        if diag.is_none() {
            *diag = Some(err);
        }
    }

    pub(crate) fn take_diag(&self) -> Option<RelayError> {
        self.diag.lock().unwrap().clone()
    }

    pub(crate) fn record_ack(&self, vclock: VClock) {
        *self.recv_vclock.lock().unwrap() = vclock;
    }

    pub(crate) fn acked_vclock(&self) -> VClock {
        self.recv_vclock.lock().unwrap().clone()
    }

    fn record_sent(&self, vclock: VClock) {
        *self.sent_vclock.lock().unwrap() = vclock;
    }

    fn sent_vclock(&self) -> VClock {
        self.sent_vclock.lock().unwrap().clone()
    }

    fn touch_last_row(&self) {
        *self.last_row_time.lock().unwrap() = Instant::now();
    }

    fn last_row_elapsed(&self) -> Duration {
        self.last_row_time.lock().unwrap().elapsed()
    }

    fn last_row_time(&self) -> Instant {
        *self.last_row_time.lock().unwrap()
    }
}

/// End state of one streaming phase.
enum PhaseEnd {
    /// Switch to the other phase.
    Fallthrough,
    /// The stop vclock was reached; the relay is finished.
    Done,
}

/// A running relay for one follower.
pub struct Relay {
    shared: Arc<RelayShared>,
    thread: Option<JoinHandle<()>>,
}

impl Relay {
    /// Start streaming to a subscribed follower.
    ///
    /// `replica` is `None` for an anonymous follower: it gets the stream
    /// but neither a garbage-collection pin nor an ack reader. The
    /// relay streams rows whose LSNs exceed `replica_clock`, open-ended
    /// until cancellation or a stream error.
    pub fn subscribe(
        wal: &Wal,
        stream: Box<dyn RelayStream>,
        replica: Option<ReplicaId>,
        replica_clock: VClock,
        config: ReplicationConfig,
        filter: Option<RowFilter>,
    ) -> RelayResult<Relay> {
        if let Some(replica_id) = replica {
            // Pin garbage collection at the follower's position before
            // anything can be deleted underneath it.
            wal.relay_status_update(replica_id, replica_clock.clone());
        }
        let watcher_name = match replica {
            Some(replica_id) => format!("relay_{}", replica_id),
            None => "relay_anon".to_string(),
        };
        let watcher = wal
            .set_watcher(watcher_name.clone())
            .map_err(|_| RelayError::wal_gone())?;

        let shared = Arc::new(RelayShared::new(replica_clock.clone()));

        let reader_thread = match replica {
            Some(replica_id) => {
                let reader_stream = stream
                    .try_clone_stream()
                    .map_err(|e| RelayError::io("clone follower stream", &e))?;
                let reader_shared = Arc::clone(&shared);
                let reader_pipe = wal.request_pipe();
                let disconnect_timeout = config.disconnect_timeout();
                Some(
                    thread::Builder::new()
                        .name(format!("{}_reader", watcher_name))
                        .spawn(move || {
                            reader::run(
                                reader_stream,
                                reader_shared,
                                reader_pipe,
                                replica_id,
                                disconnect_timeout,
                            )
                        })
                        .map_err(|e| RelayError::io("spawn ack reader", &e))?,
                )
            }
            None => None,
        };

        let ctx = RelayCtx {
            stream,
            shared: Arc::clone(&shared),
            ring: Arc::clone(wal.ring()),
            wal_pipe: wal.request_pipe(),
            watcher,
            wal_dir: wal.dir().to_path_buf(),
            instance_uuid: wal.instance_uuid(),
            instance_id: wal.instance_id(),
            replica_id: replica,
            local_vclock_at_subscribe: wal.vclock(),
            stop_vclock: None,
            clock: replica_clock,
            filter: filter.unwrap_or_else(pass_all),
            timeout: config.timeout(),
        };

        let thread = thread::Builder::new()
            .name(watcher_name)
            .spawn(move || ctx.run_to_completion(reader_thread))
            .map_err(|e| RelayError::io("spawn relay", &e))?;

        Ok(Relay { shared, thread: Some(thread) })
    }

    /// Last vclock the follower acknowledged.
    pub fn acked_vclock(&self) -> VClock {
        self.shared.acked_vclock()
    }

    /// Position of the stream sent so far.
    pub fn sent_vclock(&self) -> VClock {
        self.shared.sent_vclock()
    }

    /// When the last row or heartbeat was sent.
    pub fn last_row_time(&self) -> Instant {
        self.shared.last_row_time()
    }

    /// The relay's preserved error, if any.
    pub fn diag(&self) -> Option<RelayError> {
        self.shared.take_diag()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// True once the relay thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Wait for the relay to stop and return its error, if it stopped
    /// for any reason other than the cancellation the caller requested.
    pub fn join(mut self) -> Option<RelayError> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.shared.take_diag().filter(|e| !e.is_cancelled())
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shared.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Everything the relay thread owns.
struct RelayCtx {
    stream: Box<dyn RelayStream>,
    shared: Arc<RelayShared>,
    ring: Arc<SharedRing>,
    wal_pipe: Pipe<WalRequest>,
    watcher: WalWatcher,
    wal_dir: PathBuf,
    instance_uuid: Uuid,
    instance_id: ReplicaId,
    replica_id: Option<ReplicaId>,
    local_vclock_at_subscribe: VClock,
    stop_vclock: Option<VClock>,
    /// Stream position: everything at or below has been offered.
    clock: VClock,
    filter: RowFilter,
    /// Heartbeat interval.
    timeout: Duration,
}

impl RelayCtx {
    /// Thread body: run the phases, record the outcome, tear down.
    fn run_to_completion(mut self, reader_thread: Option<JoinHandle<()>>) {
        match self.run() {
            Ok(()) => {}
            Err(e) => {
                if !e.is_cancelled() {
                    Logger::log_stderr(Severity::Error, "relay_stopped", &[("error", &e.to_string())]);
                }
                self.shared.set_diag(e);
            }
        }
        // Wake and collect the reader; its reads are bounded by the
        // disconnect timeout.
        self.shared.cancel();
        fault::maybe_sleep(knobs::RELAY_EXIT_DELAY);

        let name = self.watcher.name().to_string();
        let _ = self.wal_pipe.push(WalRequest::Call(Box::new(move |worker| {
            worker.detach_watcher(&name);
        })));
        if let Some(reader) = reader_thread {
            let _ = reader.join();
        }
        Logger::log(
            Severity::Info,
            "relay_exit",
            &[("sent_vclock", &self.clock.to_string())],
        );
    }

    fn run(&mut self) -> RelayResult<()> {
        // An up-to-date follower should learn the replication lag right
        // away instead of waiting out the first timeout.
        self.send_heartbeat()?;
        loop {
            if let PhaseEnd::Done = self.from_memory()? {
                return Ok(());
            }
            if let PhaseEnd::Done = self.from_file()? {
                return Ok(());
            }
        }
    }

    /// Phase 1: serve rows straight from the ring.
    fn from_memory(&mut self) -> RelayResult<PhaseEnd> {
        if fault::is_armed(knobs::RELAY_MEMORY_IGNORE) {
            return Ok(PhaseEnd::Fallthrough);
        }
        let mut cursor = {
            let ring = self.ring.ring.lock().unwrap();
            match ring.cursor(&self.clock) {
                Ok(cursor) => cursor,
                Err(_) => return Ok(PhaseEnd::Fallthrough),
            }
        };
        loop {
            if self.shared.is_cancelled() {
                return Err(self.cancel_error());
            }
            if let Some(stop) = &self.stop_vclock {
                if self.clock.ge(stop) {
                    return Ok(PhaseEnd::Done);
                }
            }
            let seen = self.ring.write_signal.version();
            let next = { self.ring.ring.lock().unwrap().next(&mut cursor) };
            match next {
                RingNext::Row(ring_row) => self.relay_row(&ring_row.row)?,
                RingNext::Empty => {
                    let interval = self.heartbeat_interval();
                    match interval.checked_sub(self.shared.last_row_elapsed()) {
                        Some(remaining) if !remaining.is_zero() => {
                            self.ring.write_signal.wait_newer(seen, remaining);
                        }
                        _ => self.send_heartbeat()?,
                    }
                }
                RingNext::Gone => return Ok(PhaseEnd::Fallthrough),
            }
        }
    }

    /// Phase 2: replay segment files until the follower is back inside
    /// the ring window.
    fn from_file(&mut self) -> RelayResult<PhaseEnd> {
        let stop = match &self.stop_vclock {
            Some(stop) => stop.clone(),
            // For an open-ended subscribe, chase the writer position as
            // of phase entry; newer rows are served from memory after
            // the handoff.
            None => self.ring.ring.lock().unwrap().end_clock().clone(),
        };
        let mut recovery = Recovery::new(&self.wal_dir, self.instance_uuid, self.clock.clone())
            .map_err(|e| RelayError::gap(e.to_string()))?;
        loop {
            if self.shared.is_cancelled() {
                return Err(self.cancel_error());
            }
            let Self { shared, stream, filter, clock, replica_id, local_vclock_at_subscribe, .. } =
                self;
            let status = recovery.recover_remaining(Some(&stop), &mut |row| {
                relay_row(
                    stream,
                    shared,
                    filter,
                    clock,
                    *replica_id,
                    local_vclock_at_subscribe,
                    row,
                )
            });
            match status {
                Ok(RecoverStatus::Done) => {
                    // Skipped rows advanced the replay but not the send
                    // path; align so the ring handoff does not re-read
                    // rows this relay has already decided to drop.
                    self.align_clock(recovery.clock());
                    return Ok(PhaseEnd::Fallthrough);
                }
                Ok(RecoverStatus::Live) => {
                    self.align_clock(recovery.clock());
                    if self.stop_vclock.is_none()
                        && self.ring.ring.lock().unwrap().cursor(&self.clock).is_ok()
                    {
                        // Caught back up into the window mid-chase.
                        return Ok(PhaseEnd::Fallthrough);
                    }
                    let interval = self.heartbeat_interval();
                    match self.watcher.wait_events(interval) {
                        Some(_events) => self.watcher.ack(),
                        None => {
                            if self.watcher.is_closed() {
                                return Err(RelayError::wal_gone());
                            }
                            if self.shared.last_row_elapsed() >= interval {
                                self.send_heartbeat()?;
                            }
                        }
                    }
                }
                Err(RecoveryError::Sink(e)) => return Err(e),
                Err(RecoveryError::Xlog(e)) => return Err(RelayError::gap(e.to_string())),
            }
        }
    }

    fn relay_row(&mut self, row: &Row) -> RelayResult<()> {
        let Self { shared, stream, filter, clock, replica_id, local_vclock_at_subscribe, .. } =
            self;
        relay_row(stream, shared, filter, clock, *replica_id, local_vclock_at_subscribe, row)
    }

    /// Advance the relay position to cover everything a file replay
    /// walked over, including rows it dropped.
    fn align_clock(&mut self, replayed: &VClock) {
        let mut changed = false;
        for (replica_id, lsn) in replayed.iter() {
            if lsn > self.clock.get(replica_id) {
                let _ = self.clock.follow(replica_id, lsn);
                changed = true;
            }
        }
        if changed {
            self.shared.record_sent(self.clock.clone());
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        match fault::param(knobs::RELAY_REPORT_INTERVAL) {
            Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
            _ => self.timeout,
        }
    }

    fn send_heartbeat(&mut self) -> RelayResult<()> {
        let row = Row::heartbeat(self.instance_id);
        row.write_to(&mut self.stream)
            .and_then(|()| self.stream.flush())
            .map_err(|e| RelayError::io("send heartbeat", &e))?;
        self.shared.touch_last_row();
        Ok(())
    }

    fn cancel_error(&self) -> RelayError {
        self.shared.take_diag().unwrap_or_else(RelayError::cancelled)
    }
}

/// Send one row through the policy chain: local-row rewrite, subscribe
/// echo suppression, user filter, wire write. The relay clock follows
/// the *original* row whenever the stream position moves past it.
#[allow(clippy::too_many_arguments)]
fn relay_row(
    stream: &mut Box<dyn RelayStream>,
    shared: &Arc<RelayShared>,
    filter: &mut RowFilter,
    clock: &mut VClock,
    replica_id: Option<ReplicaId>,
    local_vclock_at_subscribe: &VClock,
    orig: &Row,
) -> RelayResult<()> {
    // Local rows never leave the instance as-is.
    let candidate = if orig.group_id == GroupId::Local {
        if orig.replica_id == REPLICA_ID_NIL {
            // Signed while the instance was anonymous; nothing for a
            // follower to count.
            return Ok(());
        }
        orig.to_nop()
    } else {
        orig.clone()
    };

    // Don't echo the follower's own rows back, unless it lost them in a
    // crash: anything at or below the local clock at subscribe time is
    // recovery data the follower asked for.
    if let Some(follower_id) = replica_id {
        if orig.replica_id == follower_id
            && orig.lsn > local_vclock_at_subscribe.get(follower_id)
        {
            follow_row(clock, shared, orig);
            return Ok(());
        }
    }

    let outgoing = match filter(&candidate) {
        FilterAction::Pass => candidate,
        FilterAction::Rewrite(replacement) => replacement,
        FilterAction::Skip => return Ok(()),
        FilterAction::Abort(message) => return Err(RelayError::filter(message)),
    };

    fault::maybe_sleep(knobs::RELAY_SEND_DELAY);
    let mut wire = outgoing;
    if let Some(broken) = fault::maybe_break_lsn(knobs::RELAY_BREAK_LSN, wire.lsn) {
        Logger::log_stderr(
            Severity::Warn,
            "relay_injected_broken_lsn",
            &[("lsn", &broken.to_string())],
        );
        wire.lsn = broken;
    }
    wire.write_to(stream)
        .and_then(|()| stream.flush())
        .map_err(|e| RelayError::io("send row", &e))?;
    shared.touch_last_row();
    follow_row(clock, shared, orig);
    fault::maybe_sleep(knobs::RELAY_TIMEOUT);
    Ok(())
}

fn follow_row(clock: &mut VClock, shared: &Arc<RelayShared>, orig: &Row) {
    if orig.lsn > clock.get(orig.replica_id) {
        let _ = clock.follow(orig.replica_id, orig.lsn);
        shared.record_sent(clock.clone());
    }
}

/// Initial join: send the master's durable vclock, then stream the
/// engine's frozen read view. Local rows are dropped entirely here; the
/// snapshot carries no clock progress for them.
pub fn initial_join<S: Write>(
    wal: &Wal,
    stream: &mut S,
    snapshot_rows: impl IntoIterator<Item = Row>,
) -> RelayResult<VClock> {
    // Make sure everything visible from the read view is durable.
    let vclock = wal
        .sync()
        .map_err(|e| RelayError::new(RelayErrorKind::Io, format!("wal sync: {}", e)))?;
    Row::ack(wal.instance_id(), &vclock)
        .write_to(stream)
        .map_err(|e| RelayError::io("send join vclock", &e))?;
    for row in snapshot_rows {
        if row.group_id == GroupId::Local {
            continue;
        }
        row.write_to(stream).map_err(|e| RelayError::io("send snapshot row", &e))?;
    }
    stream.flush().map_err(|e| RelayError::io("flush join stream", &e))?;
    Ok(vclock)
}

/// Final join: replay the WAL range `(start, stop]` to the follower and
/// return. The range must be durable before the call.
pub fn final_join<S: Write>(
    wal: &Wal,
    stream: &mut S,
    start: VClock,
    stop: &VClock,
) -> RelayResult<()> {
    let mut recovery = Recovery::new(wal.dir(), wal.instance_uuid(), start)
        .map_err(|e| RelayError::gap(e.to_string()))?;
    let status = recovery.recover_remaining(Some(stop), &mut |row| -> RelayResult<()> {
        let outgoing = if row.group_id == GroupId::Local {
            if row.replica_id == REPLICA_ID_NIL {
                return Ok(());
            }
            row.to_nop()
        } else {
            row.clone()
        };
        outgoing.write_to(stream).map_err(|e| RelayError::io("send join row", &e))
    });
    match status {
        Ok(RecoverStatus::Done) => {
            stream.flush().map_err(|e| RelayError::io("flush join stream", &e))?;
            Ok(())
        }
        Ok(RecoverStatus::Live) => {
            Err(RelayError::gap("log ends before the final join target"))
        }
        Err(RecoveryError::Sink(e)) => Err(e),
        Err(RecoveryError::Xlog(e)) => Err(RelayError::gap(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrow::RowType;

    fn local_row(replica_id: ReplicaId, lsn: i64) -> Row {
        let mut row = Row::local(RowType::Insert, vec![9]);
        row.replica_id = replica_id;
        row.lsn = lsn;
        row.tsn = lsn;
        row.is_commit = true;
        row
    }

    fn data_row(replica_id: ReplicaId, lsn: i64) -> Row {
        let mut row = Row::new(RowType::Insert, vec![7]);
        row.replica_id = replica_id;
        row.lsn = lsn;
        row.tsn = lsn;
        row.is_commit = true;
        row
    }

    /// An in-memory sink that satisfies `RelayStream` for policy tests;
    /// the written bytes are visible through a shared buffer.
    #[derive(Clone)]
    struct SinkStream(Arc<Mutex<Vec<u8>>>);

    impl SinkStream {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let buffer = Arc::new(Mutex::new(Vec::new()));
            (Self(Arc::clone(&buffer)), buffer)
        }
    }

    impl Read for SinkStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for SinkStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RelayStream for SinkStream {
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
        fn try_clone_stream(&self) -> io::Result<Box<dyn RelayStream>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn decode_rows(bytes: &[u8]) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut cursor = bytes;
        while !cursor.is_empty() {
            rows.push(Row::read_from(&mut cursor).unwrap());
        }
        rows
    }

    fn send_one(
        row: &Row,
        replica_id: Option<ReplicaId>,
        at_subscribe: &VClock,
        filter: Option<RowFilter>,
    ) -> (Vec<Row>, VClock) {
        let (sink, buffer) = SinkStream::new();
        let mut stream: Box<dyn RelayStream> = Box::new(sink);
        let shared = Arc::new(RelayShared::new(VClock::new()));
        let mut filter = filter.unwrap_or_else(pass_all);
        let mut clock = VClock::new();
        relay_row(
            &mut stream,
            &shared,
            &mut filter,
            &mut clock,
            replica_id,
            at_subscribe,
            row,
        )
        .unwrap();
        let sent = decode_rows(&buffer.lock().unwrap());
        (sent, clock)
    }

    #[test]
    fn test_local_nil_rows_are_dropped() {
        let (sent, clock) = send_one(&local_row(REPLICA_ID_NIL, 5), None, &VClock::new(), None);
        assert!(sent.is_empty());
        assert_eq!(clock.get(REPLICA_ID_NIL), 0);
    }

    #[test]
    fn test_local_rows_become_nops() {
        let (sent, clock) = send_one(&local_row(1, 5), None, &VClock::new(), None);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].rtype, RowType::Nop);
        assert_eq!(sent[0].group_id, GroupId::Default);
        assert_eq!(sent[0].lsn, 5);
        assert!(sent[0].body.is_empty());
        assert_eq!(clock.get(1), 5);
    }

    #[test]
    fn test_echo_suppression_advances_clock() {
        let at_subscribe = VClock::from_components([(2, 3)]);
        let (sent, clock) = send_one(&data_row(2, 7), Some(2), &at_subscribe, None);
        // Suppressed, but the stream position still moves past it.
        assert!(sent.is_empty());
        assert_eq!(clock.get(2), 7);
    }

    #[test]
    fn test_crash_recovery_rows_are_sent_back() {
        // LSN 7 is at or below the local clock at subscribe time: data
        // the follower itself lost before its crash.
        let at_subscribe = VClock::from_components([(2, 10)]);
        let (sent, clock) = send_one(&data_row(2, 7), Some(2), &at_subscribe, None);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].lsn, 7);
        assert_eq!(clock.get(2), 7);
    }

    #[test]
    fn test_foreign_rows_pass_through() {
        let (sent, clock) = send_one(&data_row(3, 4), Some(2), &VClock::new(), None);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].replica_id, 3);
        assert_eq!(clock.get(3), 4);
    }

    #[test]
    fn test_filter_skip_does_not_advance_clock() {
        let filter: RowFilter = Box::new(|_| FilterAction::Skip);
        let (sent, clock) = send_one(&data_row(1, 4), None, &VClock::new(), Some(filter));
        assert!(sent.is_empty());
        assert_eq!(clock.get(1), 0);
    }

    #[test]
    fn test_filter_rewrite_keeps_original_clock() {
        let replacement = data_row(1, 999);
        let filter: RowFilter = Box::new(move |_| FilterAction::Rewrite(replacement.clone()));
        let (sent, clock) = send_one(&data_row(1, 4), None, &VClock::new(), Some(filter));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].lsn, 999);
        // The relay clock follows the original row, not the rewrite.
        assert_eq!(clock.get(1), 4);
    }

    #[test]
    fn test_filter_abort_terminates() {
        let (sink, _buffer) = SinkStream::new();
        let mut stream: Box<dyn RelayStream> = Box::new(sink);
        let shared = Arc::new(RelayShared::new(VClock::new()));
        let mut filter: RowFilter = Box::new(|_| FilterAction::Abort("not replicated".into()));
        let mut clock = VClock::new();
        let err = relay_row(
            &mut stream,
            &shared,
            &mut filter,
            &mut clock,
            None,
            &VClock::new(),
            &data_row(1, 4),
        )
        .unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::Filter);
    }
}
