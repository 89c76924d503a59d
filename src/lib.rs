//! rilldb durability core - segmented WAL writer and replication relay
//! for a replicated in-memory database.
//!
//! Three execution contexts cooperate by message passing: the submitting
//! side originates transactions, a dedicated WAL thread owns all log
//! file I/O plus the in-memory row ring, and per-follower relay threads
//! stream committed rows out and read acknowledgements back. Vector
//! clocks order everything; the matrix of follower clocks bounds
//! garbage collection so no segment a follower or checkpoint still
//! needs is ever deleted.

pub mod bus;
pub mod clock;
pub mod config;
pub mod fault;
pub mod observability;
pub mod recovery;
pub mod relay;
pub mod ring;
pub mod wal;
pub mod xlog;
pub mod xrow;
