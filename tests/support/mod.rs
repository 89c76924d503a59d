//! Shared fixtures for the durability and replication scenarios.

#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use uuid::Uuid;

use rilldb::clock::VClock;
use rilldb::config::{WalConfig, WalMode};
use rilldb::wal::{JournalEntry, Wal, WalOptions};
use rilldb::xrow::{Row, RowType};

pub fn wal_config(dir: &Path) -> WalConfig {
    WalConfig::new(WalMode::Write, dir, 256 * 1024 * 1024).unwrap()
}

pub fn init_wal(dir: &Path) -> Wal {
    Wal::init(WalOptions::new(wal_config(dir), 1, Uuid::new_v4())).unwrap()
}

pub fn vclock(pairs: &[(u32, i64)]) -> VClock {
    VClock::from_components(pairs.iter().copied())
}

pub fn insert_row(body: &[u8]) -> Row {
    Row::new(RowType::Insert, body.to_vec())
}

/// Submit one single-row entry and block on its result.
pub fn commit_one(wal: &Wal, body: &[u8]) -> i64 {
    let (entry, rx) = JournalEntry::with_channel(vec![insert_row(body)]);
    wal.write(entry).expect("write accepted");
    rx.recv_timeout(Duration::from_secs(5)).expect("entry completed")
}

/// A connected loopback socket pair: (master side, follower side).
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

/// The follower end of a replication stream.
pub struct Follower {
    pub stream: TcpStream,
}

impl Follower {
    pub fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        Self { stream }
    }

    /// Collect incoming rows until `enough` says stop or the deadline
    /// passes.
    pub fn read_rows(
        &mut self,
        deadline: Duration,
        mut enough: impl FnMut(&[Row]) -> bool,
    ) -> Vec<Row> {
        let start = Instant::now();
        let mut rows = Vec::new();
        while start.elapsed() < deadline && !enough(&rows) {
            match Row::read_from(&mut self.stream) {
                Ok(row) => rows.push(row),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break,
            }
        }
        rows
    }

    /// Acknowledge everything up to `vclock`.
    pub fn ack(&mut self, replica_id: u32, vclock: &VClock) {
        use std::io::Write;
        Row::ack(replica_id, vclock).write_to(&mut self.stream).unwrap();
        self.stream.flush().unwrap();
    }
}

/// Poll until `check` passes or the deadline elapses; panics on timeout.
pub fn wait_until(deadline: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

/// LSNs of the data-modifying rows in a stream, heartbeats excluded.
pub fn dml_lsns(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .filter(|row| row.rtype.is_dml())
        .map(|row| row.lsn)
        .collect()
}
