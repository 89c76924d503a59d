//! Segment file error types.

use std::fmt;
use std::io;

/// Classification of a segment I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlogErrorKind {
    /// File or directory I/O failed.
    Io,
    /// The device is out of space; the WAL reacts by collecting garbage
    /// and retrying.
    NoSpace,
    /// The file contents are malformed. A corrupted head segment is
    /// renamed `*.corrupted` and skipped at startup.
    Corruption,
}

impl XlogErrorKind {
    /// String code for logs and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            XlogErrorKind::Io => "RILL_XLOG_IO",
            XlogErrorKind::NoSpace => "RILL_XLOG_NO_SPACE",
            XlogErrorKind::Corruption => "RILL_XLOG_CORRUPTION",
        }
    }
}

/// Segment file error.
#[derive(Debug)]
pub struct XlogError {
    kind: XlogErrorKind,
    message: String,
    source: Option<io::Error>,
}

impl XlogError {
    /// Classify an I/O error, mapping out-of-space to its own kind.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        let kind = if source.raw_os_error() == Some(28) {
            // ENOSPC
            XlogErrorKind::NoSpace
        } else {
            XlogErrorKind::Io
        };
        Self { kind, message: message.into(), source: Some(source) }
    }

    /// An out-of-space condition raised without an OS error (injection).
    pub fn no_space(message: impl Into<String>) -> Self {
        Self { kind: XlogErrorKind::NoSpace, message: message.into(), source: None }
    }

    /// Malformed file contents.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self { kind: XlogErrorKind::Corruption, message: message.into(), source: None }
    }

    /// Malformed contents at a known byte offset.
    pub fn corruption_at(offset: u64, message: impl Into<String>) -> Self {
        Self {
            kind: XlogErrorKind::Corruption,
            message: format!("{} (byte offset {})", message.into(), offset),
            source: None,
        }
    }

    /// The error kind.
    pub fn kind(&self) -> XlogErrorKind {
        self.kind
    }

    /// True for out-of-space conditions.
    pub fn is_no_space(&self) -> bool {
        self.kind == XlogErrorKind::NoSpace
    }

    /// True for corruption.
    pub fn is_corruption(&self) -> bool {
        self.kind == XlogErrorKind::Corruption
    }

    /// The error message without code decoration.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for XlogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)?;
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for XlogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for segment operations.
pub type XlogResult<T> = Result<T, XlogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_maps_to_no_space() {
        let err = XlogError::io("prealloc", io::Error::from_raw_os_error(28));
        assert!(err.is_no_space());
        assert_eq!(err.kind().code(), "RILL_XLOG_NO_SPACE");
    }

    #[test]
    fn test_other_io_stays_io() {
        let err = XlogError::io("write", io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), XlogErrorKind::Io);
        assert!(!err.is_no_space());
    }

    #[test]
    fn test_corruption_display_carries_offset() {
        let err = XlogError::corruption_at(128, "bad block magic");
        let text = format!("{}", err);
        assert!(text.contains("RILL_XLOG_CORRUPTION"));
        assert!(text.contains("byte offset 128"));
    }
}
