//! WAL error types.
//!
//! Error codes:
//! - RILL_WAL_IO (ERROR severity)
//! - RILL_WAL_NO_SPACE (ERROR severity)
//! - RILL_WAL_ROLLBACK (ERROR severity)
//! - RILL_WAL_CHECKPOINT_ROLLBACK (ERROR severity)
//! - RILL_WAL_CORRUPTION (FATAL severity)
//! - RILL_WAL_SHUTDOWN (ERROR severity)
//! - RILL_WAL_INJECTION (ERROR severity)

use std::fmt;

use crate::xlog::XlogError;

/// Severity levels for WAL errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, the instance continues.
    Error,
    /// The instance must terminate.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// WAL-specific error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalErrorCode {
    /// A segment read or write failed.
    RillWalIo,
    /// The device ran out of space and nothing was left to collect.
    RillWalNoSpace,
    /// The request was rejected because a cascading rollback is active.
    RillWalRollback,
    /// A checkpoint was requested while a rollback is in progress.
    RillWalCheckpointRollback,
    /// A segment failed a structural or checksum check.
    RillWalCorruption,
    /// The WAL thread is gone.
    RillWalShutdown,
    /// A fault-injection knob fired.
    RillWalInjection,
}

impl WalErrorCode {
    /// Returns the string code.
    pub fn code(&self) -> &'static str {
        match self {
            WalErrorCode::RillWalIo => "RILL_WAL_IO",
            WalErrorCode::RillWalNoSpace => "RILL_WAL_NO_SPACE",
            WalErrorCode::RillWalRollback => "RILL_WAL_ROLLBACK",
            WalErrorCode::RillWalCheckpointRollback => "RILL_WAL_CHECKPOINT_ROLLBACK",
            WalErrorCode::RillWalCorruption => "RILL_WAL_CORRUPTION",
            WalErrorCode::RillWalShutdown => "RILL_WAL_SHUTDOWN",
            WalErrorCode::RillWalInjection => "RILL_WAL_INJECTION",
        }
    }

    /// Returns the severity level for this error.
    pub fn severity(&self) -> Severity {
        match self {
            WalErrorCode::RillWalCorruption => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for WalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// WAL error with context.
#[derive(Debug)]
pub struct WalError {
    code: WalErrorCode,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WalError {
    /// An I/O failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self { code: WalErrorCode::RillWalIo, message: message.into(), source: None }
    }

    /// Request rejected during cascading rollback.
    pub fn rollback(message: impl Into<String>) -> Self {
        Self { code: WalErrorCode::RillWalRollback, message: message.into(), source: None }
    }

    /// Checkpoint attempted during cascading rollback.
    pub fn checkpoint_rollback() -> Self {
        Self {
            code: WalErrorCode::RillWalCheckpointRollback,
            message: "cannot checkpoint while a cascading rollback is in progress".into(),
            source: None,
        }
    }

    /// The WAL thread is gone.
    pub fn shutdown() -> Self {
        Self {
            code: WalErrorCode::RillWalShutdown,
            message: "the WAL writer has been shut down".into(),
            source: None,
        }
    }

    /// A fault-injection knob fired.
    pub fn injection(knob: &str) -> Self {
        Self {
            code: WalErrorCode::RillWalInjection,
            message: format!("injected failure: {}", knob),
            source: None,
        }
    }

    /// Returns the error code.
    pub fn code(&self) -> WalErrorCode {
        self.code
    }

    /// Returns the severity level.
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns whether this error requires process termination.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<XlogError> for WalError {
    fn from(err: XlogError) -> Self {
        let code = if err.is_no_space() {
            WalErrorCode::RillWalNoSpace
        } else if err.is_corruption() {
            WalErrorCode::RillWalCorruption
        } else {
            WalErrorCode::RillWalIo
        };
        Self { code, message: err.message().to_string(), source: Some(Box::new(err)) }
    }
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code.code(), self.message)
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(WalErrorCode::RillWalIo.code(), "RILL_WAL_IO");
        assert_eq!(WalErrorCode::RillWalRollback.code(), "RILL_WAL_ROLLBACK");
        assert_eq!(
            WalErrorCode::RillWalCheckpointRollback.code(),
            "RILL_WAL_CHECKPOINT_ROLLBACK"
        );
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err = WalError::from(XlogError::corruption("bad block"));
        assert!(err.is_fatal());
        assert_eq!(err.code(), WalErrorCode::RillWalCorruption);
    }

    #[test]
    fn test_no_space_maps_from_xlog() {
        let err = WalError::from(XlogError::no_space("full"));
        assert_eq!(err.code(), WalErrorCode::RillWalNoSpace);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_display_contains_code_and_severity() {
        let text = format!("{}", WalError::checkpoint_rollback());
        assert!(text.contains("RILL_WAL_CHECKPOINT_ROLLBACK"));
        assert!(text.contains("ERROR"));
    }
}
