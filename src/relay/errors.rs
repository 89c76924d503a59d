//! Relay error types.
//!
//! A relay's last error is preserved across stop so the replication
//! status of a follower can be reported after its stream broke.

use std::fmt;
use std::io;

/// Relay error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Socket read or write failed.
    Io,
    /// The follower sent a malformed frame.
    Protocol,
    /// The follower stopped acknowledging within the disconnect timeout.
    Disconnected,
    /// The relay was cancelled on purpose.
    Cancelled,
    /// The WAL shut down underneath the relay.
    WalGone,
    /// The row filter aborted the stream.
    Filter,
    /// The follower's position is no longer covered by the log.
    LogGap,
}

impl RelayErrorKind {
    /// String code for logs and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            RelayErrorKind::Io => "RILL_RELAY_IO",
            RelayErrorKind::Protocol => "RILL_RELAY_PROTOCOL",
            RelayErrorKind::Disconnected => "RILL_RELAY_DISCONNECTED",
            RelayErrorKind::Cancelled => "RILL_RELAY_CANCELLED",
            RelayErrorKind::WalGone => "RILL_RELAY_WAL_GONE",
            RelayErrorKind::Filter => "RILL_RELAY_FILTER",
            RelayErrorKind::LogGap => "RILL_RELAY_LOG_GAP",
        }
    }
}

/// Relay error.
#[derive(Debug, Clone)]
pub struct RelayError {
    /// Error kind.
    pub kind: RelayErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl RelayError {
    /// Create an error of the given kind.
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Socket failure.
    pub fn io(context: &str, err: &io::Error) -> Self {
        Self::new(RelayErrorKind::Io, format!("{}: {}", context, err))
    }

    /// Malformed follower frame.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Protocol, message)
    }

    /// Ack silence past the disconnect timeout.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Disconnected, message)
    }

    /// Deliberate cancellation.
    pub fn cancelled() -> Self {
        Self::new(RelayErrorKind::Cancelled, "relay cancelled")
    }

    /// The WAL thread is gone.
    pub fn wal_gone() -> Self {
        Self::new(RelayErrorKind::WalGone, "the WAL writer has shut down")
    }

    /// Filter abort.
    pub fn filter(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Filter, message)
    }

    /// Missing log range.
    pub fn gap(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::LogGap, message)
    }

    /// Cancellation is never an error to the caller who requested it.
    pub fn is_cancelled(&self) -> bool {
        self.kind == RelayErrorKind::Cancelled
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for RelayError {}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
