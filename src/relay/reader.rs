//! The acknowledgement reader.
//!
//! Each relay pairs with a reader thread that consumes frames sent back
//! by the follower. Every ack frame carries the follower's vclock; the
//! reader records it for status reporting and forwards it to the WAL
//! thread, which updates the matrix clock and may unpin segments for
//! garbage collection. Silence past the disconnect timeout takes the
//! whole relay down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::Pipe;
use crate::clock::ReplicaId;
use crate::observability::{Logger, Severity};
use crate::wal::WalRequest;
use crate::xrow::{Row, RowType};

use super::errors::RelayError;
use super::{RelayShared, RelayStream};

pub(crate) fn run(
    mut stream: Box<dyn RelayStream>,
    shared: Arc<RelayShared>,
    wal_pipe: Pipe<WalRequest>,
    replica_id: ReplicaId,
    disconnect_timeout: Duration,
) {
    if stream.set_read_timeout(Some(disconnect_timeout)).is_err() {
        shared.set_diag(RelayError::protocol("ack stream does not support read timeouts"));
        shared.cancel();
        return;
    }
    while !shared.is_cancelled() {
        match Row::read_from(&mut stream) {
            Ok(row) => {
                if row.rtype != RowType::Ack {
                    // Followers may send probes; only acks matter here.
                    continue;
                }
                match row.decode_ack() {
                    Ok(vclock) => {
                        shared.record_ack(vclock.clone());
                        let _ = wal_pipe.push(WalRequest::RelayStatus {
                            replica_id,
                            vclock,
                        });
                    }
                    Err(e) => {
                        shared.set_diag(RelayError::protocol(format!(
                            "malformed ack frame: {}",
                            e
                        )));
                        shared.cancel();
                        return;
                    }
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                if shared.is_cancelled() {
                    // The relay is being torn down; the silence is ours.
                    return;
                }
                shared.set_diag(RelayError::disconnected(format!(
                    "no acknowledgement for {:.1}s",
                    disconnect_timeout.as_secs_f64()
                )));
                shared.cancel();
                return;
            }
            Err(e) => {
                if !shared.is_cancelled() {
                    Logger::log(
                        Severity::Info,
                        "relay_ack_stream_closed",
                        &[("error", &e.to_string())],
                    );
                    shared.set_diag(RelayError::io("ack stream", &e));
                }
                shared.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;
    use crate::clock::VClock;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_ack_updates_shared_state_and_wal() {
        let (client, mut follower) = tcp_pair();
        let shared = Arc::new(RelayShared::new(VClock::new()));
        let (wal_pipe, wal_endpoint) = bus::pipe::<WalRequest>("wal");

        let reader_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run(
                Box::new(client),
                reader_shared,
                wal_pipe,
                7,
                Duration::from_millis(300),
            )
        });

        let vclock = VClock::from_components([(1, 9)]);
        Row::ack(7, &vclock).write_to(&mut follower).unwrap();
        follower.flush().unwrap();

        // The WAL side receives the status update.
        match wal_endpoint.recv() {
            Some(WalRequest::RelayStatus { replica_id, vclock: acked }) => {
                assert_eq!(replica_id, 7);
                assert_eq!(acked, vclock);
            }
            _ => panic!("expected a relay status update"),
        }
        assert_eq!(shared.acked_vclock(), vclock);

        // Timeout after the single ack shuts the reader down.
        handle.join().unwrap();
        assert!(shared.is_cancelled());
    }

    #[test]
    fn test_silence_disconnects() {
        let (client, _follower) = tcp_pair();
        let shared = Arc::new(RelayShared::new(VClock::new()));
        let (wal_pipe, _wal_endpoint) = bus::pipe::<WalRequest>("wal");

        run(
            Box::new(client),
            Arc::clone(&shared),
            wal_pipe,
            7,
            Duration::from_millis(50),
        );
        assert!(shared.is_cancelled());
        let diag = shared.take_diag().unwrap();
        assert_eq!(diag.kind, super::super::RelayErrorKind::Disconnected);
    }
}
