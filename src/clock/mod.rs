//! Logical clocks.
//!
//! A [`VClock`] maps an instance id to the last log sequence number known
//! for that instance; it induces a partial order on database states. A
//! [`MClock`] keeps one vclock per attached follower so the WAL can compute
//! the garbage-collection horizon as the component-wise minimum over
//! everything any follower still needs.
//!
//! Components never decrease: `follow` rejects a non-monotonic update
//! instead of silently ignoring it, because a backwards LSN always means a
//! corrupted stream or a protocol bug.

mod mclock;
mod vclock;

pub use mclock::MClock;
pub use vclock::{order_crossed, ClockError, ClockResult, VClock};

/// Identifier of an instance in the replica set.
pub type ReplicaId = u32;

/// The nil replica id: rows produced by an anonymous instance carry it
/// until the WAL signs them with the local instance id.
pub const REPLICA_ID_NIL: ReplicaId = 0;
