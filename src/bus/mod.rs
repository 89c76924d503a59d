//! Cross-thread message bus.
//!
//! Execution contexts (the TX side, the WAL thread, relay threads) never
//! share mutable state directly; they exchange ownership through typed
//! pipes. A pipe is a named unbounded channel; the receiving end is owned
//! by exactly one thread's event loop. Blocking RPC is layered on top by
//! carrying a reply sender inside the request, and wakeups that do not
//! carry data use a versioned [`Signal`].

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The far endpoint of a pipe is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusError {
    /// Name of the pipe whose endpoint disappeared.
    pub pipe: &'static str,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe '{}' is disconnected", self.pipe)
    }
}

impl std::error::Error for BusError {}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Sending half of a named pipe.
#[derive(Debug)]
pub struct Pipe<T> {
    name: &'static str,
    tx: Sender<T>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, tx: self.tx.clone() }
    }
}

impl<T> Pipe<T> {
    /// Pipe name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a message.
    pub fn push(&self, msg: T) -> BusResult<()> {
        self.tx.send(msg).map_err(|_| BusError { pipe: self.name })
    }

    /// Enqueue a message, handing it back if the endpoint is gone so the
    /// caller can complete or reuse it.
    pub fn try_push(&self, msg: T) -> Result<(), T> {
        self.tx.send(msg).map_err(|e| e.0)
    }
}

/// Receiving half of a named pipe; owned by one event loop.
#[derive(Debug)]
pub struct Endpoint<T> {
    name: &'static str,
    rx: Receiver<T>,
}

/// Outcome of a timed receive.
#[derive(Debug)]
pub enum Recv<T> {
    /// A message arrived.
    Msg(T),
    /// The timeout elapsed first.
    Timeout,
    /// Every sender is gone.
    Closed,
}

impl<T> Endpoint<T> {
    /// Pipe name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until a message arrives; `None` once every sender is gone.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Receive with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Recv<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Recv::Msg(msg),
            Err(RecvTimeoutError::Timeout) => Recv::Timeout,
            Err(RecvTimeoutError::Disconnected) => Recv::Closed,
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create a named pipe.
pub fn pipe<T>(name: &'static str) -> (Pipe<T>, Endpoint<T>) {
    let (tx, rx) = mpsc::channel();
    (Pipe { name, tx }, Endpoint { name, rx })
}

/// Blocking RPC over a pipe: build a request around a one-shot reply
/// sender, push it, and wait for the reply.
pub fn call<T, R>(pipe: &Pipe<T>, make: impl FnOnce(Sender<R>) -> T) -> BusResult<R> {
    let (reply_tx, reply_rx) = mpsc::channel();
    pipe.push(make(reply_tx))?;
    reply_rx.recv().map_err(|_| BusError { pipe: pipe.name })
}

/// A versioned condition: writers bump the version, readers wait for it
/// to move past the value they last observed. The version guards against
/// lost wakeups between checking shared state and going to sleep.
#[derive(Debug, Default)]
pub struct Signal {
    version: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    /// A fresh signal at version zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        *self.version.lock().unwrap()
    }

    /// Bump the version and wake all waiters.
    pub fn notify(&self) {
        let mut version = self.version.lock().unwrap();
        *version += 1;
        self.cond.notify_all();
    }

    /// Wait until the version moves past `seen` or the timeout elapses.
    /// Returns the version observed on wakeup.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
        let mut version = self.version.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *version == seen {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(version, deadline - now)
                .unwrap();
            version = guard;
        }
        *version
    }
}
