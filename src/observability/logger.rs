//! Structured JSON-line logger.
//!
//! Every event is one line: the wall-clock timestamp, the level, the
//! event name, then the event's fields in key order. Lines are written
//! synchronously in a single call so events from the WAL thread and the
//! relay threads never interleave mid-line. Key and value escaping is
//! delegated to `serde_json`; this module never builds JSON by hand
//! beyond the line skeleton.
//!
//! The minimum emitted level comes from `RILLDB_LOG_LEVEL`.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};

/// Log levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Developer chatter, off by default.
    Debug = 0,
    /// Lifecycle events: rotations, checkpoints, relay start and stop.
    Info = 1,
    /// Something degraded but the instance carries on.
    Warn = 2,
    /// An operation failed and its caller was told so.
    Error = 3,
    /// The instance cannot continue.
    Fatal = 4,
}

impl Severity {
    /// Level name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        [
            Severity::Debug,
            Severity::Info,
            Severity::Warn,
            Severity::Error,
            Severity::Fatal,
        ]
        .into_iter()
        .find(|level| level.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Minimum level emitted. Defaults to `Info`.
fn floor() -> Severity {
    static FLOOR: OnceLock<Severity> = OnceLock::new();
    *FLOOR.get_or_init(|| {
        std::env::var("RILLDB_LOG_LEVEL")
            .ok()
            .and_then(|value| Severity::parse(&value))
            .unwrap_or(Severity::Info)
    })
}

/// The process logger.
pub struct Logger;

impl Logger {
    /// Emit an event to stdout.
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if severity >= floor() {
            Self::emit(severity, event, fields, &mut io::stdout());
        }
    }

    /// Emit an event to stderr (errors and fatal conditions).
    pub fn log_stderr(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if severity >= floor() {
            Self::emit(severity, event, fields, &mut io::stderr());
        }
    }

    fn emit<W: Write>(severity: Severity, event: &str, fields: &[(&str, &str)], writer: &mut W) {
        let mut line = String::with_capacity(192);
        line.push('{');
        append_field(
            &mut line,
            "ts",
            &Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        line.push(',');
        append_field(&mut line, "level", severity.as_str());
        line.push(',');
        append_field(&mut line, "event", event);

        // Map the fields through a BTreeMap: key order is fixed and a
        // repeated key keeps its last value, so identical events always
        // serialize identically past the timestamp.
        let ordered: BTreeMap<&str, &str> = fields.iter().copied().collect();
        for (key, value) in ordered {
            line.push(',');
            append_field(&mut line, key, value);
        }
        line.push_str("}\n");

        // One write, one flush: the line is the atom.
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }
}

fn append_field(line: &mut String, key: &str, value: &str) {
    line.push_str(&serde_json::to_string(key).expect("strings always encode"));
    line.push(':');
    line.push_str(&serde_json::to_string(value).expect("strings always encode"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut buf = Vec::new();
        Logger::emit(severity, event, fields, &mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_line_shape() {
        let line = render(Severity::Info, "wal_rotate", &[("path", "00000000000000000003.xlog")]);
        assert!(line.starts_with("{\"ts\":\""));
        assert!(line.contains("\"level\":\"INFO\""));
        assert!(line.contains("\"event\":\"wal_rotate\""));
        assert!(line.contains("\"path\":\"00000000000000000003.xlog\""));
        assert!(line.ends_with("}\n"));
        // The whole line is valid JSON.
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["event"], "wal_rotate");
    }

    #[test]
    fn test_fields_come_out_in_key_order() {
        let line = render(Severity::Warn, "e", &[("zulu", "1"), ("alpha", "2")]);
        let alpha = line.find("\"alpha\"").unwrap();
        let zulu = line.find("\"zulu\"").unwrap();
        assert!(alpha < zulu);
    }

    #[test]
    fn test_repeated_key_keeps_last_value() {
        let line = render(Severity::Info, "e", &[("key", "old"), ("key", "new")]);
        assert!(line.contains("\"key\":\"new\""));
        assert!(!line.contains("\"old\""));
    }

    #[test]
    fn test_escaping_is_real_json() {
        let line = render(Severity::Error, "bad \"path\"", &[("p", "a\\b\nc")]);
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["event"], "bad \"path\"");
        assert_eq!(parsed["p"], "a\\b\nc");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("warn"), Some(Severity::Warn));
        assert_eq!(Severity::parse(" FATAL "), Some(Severity::Fatal));
        assert_eq!(Severity::parse("debug"), Some(Severity::Debug));
        assert_eq!(Severity::parse("loud"), None);
    }
}
