//! Observability for the durability core.
//!
//! Logging is structured and synchronous: one timestamped JSON line per
//! event, fields in key order, escaping delegated to the JSON codec.
//! The WAL thread and relay threads log through this module only;
//! nothing here ever blocks on anything but the output stream.

mod logger;

pub use logger::{Logger, Severity};
