//! Log row model and binary codec.
//!
//! A row is one log record: a fixed header (type, origin instance, LSN,
//! transaction id, timestamp, group, commit flag) plus an opaque body that
//! only the storage engines interpret. The same frame encoding is used in
//! segment files and on the replication wire, so a relay can forward bytes
//! it read from disk without re-encoding.

mod row;

pub use row::{now_tm, GroupId, Row, RowType};
