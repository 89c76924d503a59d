//! Vector clock: instance id → monotonically non-decreasing LSN.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ReplicaId;

/// Error raised on a non-monotonic clock update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockError {
    /// Component that was being advanced.
    pub replica_id: ReplicaId,
    /// Value the component currently holds.
    pub current: i64,
    /// Value the caller tried to move it to.
    pub proposed: i64,
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "non-monotonic vclock update for replica {}: {} -> {}",
            self.replica_id, self.current, self.proposed
        )
    }
}

impl std::error::Error for ClockError {}

/// Result type for clock operations.
pub type ClockResult<T> = Result<T, ClockError>;

/// A vector clock.
///
/// Absent components read as zero. The *signature* is the sum of all
/// components and names a point in the log's total byte order: segment
/// files are keyed by the signature of their starting vclock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VClock {
    components: BTreeMap<ReplicaId, i64>,
}

impl VClock {
    /// The zero clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(replica_id, lsn)` pairs. Zero LSNs are dropped.
    pub fn from_components<I: IntoIterator<Item = (ReplicaId, i64)>>(iter: I) -> Self {
        let mut clock = Self::new();
        for (id, lsn) in iter {
            if lsn != 0 {
                clock.components.insert(id, lsn);
            }
        }
        clock
    }

    /// Component value for `id`, zero when absent.
    pub fn get(&self, id: ReplicaId) -> i64 {
        self.components.get(&id).copied().unwrap_or(0)
    }

    /// True if no component has been advanced yet.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of tracked components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Sum of all components.
    pub fn signature(&self) -> i64 {
        self.components.values().sum()
    }

    /// Increment a component and return its new value.
    pub fn inc(&mut self, id: ReplicaId) -> i64 {
        let slot = self.components.entry(id).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Advance a component to `lsn`. The update must be strictly
    /// monotonic.
    pub fn follow(&mut self, id: ReplicaId, lsn: i64) -> ClockResult<()> {
        let current = self.get(id);
        if lsn <= current {
            return Err(ClockError { replica_id: id, current, proposed: lsn });
        }
        self.components.insert(id, lsn);
        Ok(())
    }

    /// Component-wise addition of a diff clock produced by one WAL batch.
    pub fn merge(&mut self, diff: &VClock) {
        for (&id, &lsn) in &diff.components {
            if lsn != 0 {
                *self.components.entry(id).or_insert(0) += lsn;
            }
        }
    }

    /// Compare two clocks in the component-wise partial order.
    ///
    /// Returns `None` when the clocks are incomparable (each is ahead of
    /// the other on some component).
    pub fn partial_cmp_clock(&self, other: &VClock) -> Option<Ordering> {
        let mut seen_less = false;
        let mut seen_greater = false;
        let ids = self.components.keys().chain(other.components.keys());
        for &id in ids {
            match self.get(id).cmp(&other.get(id)) {
                Ordering::Less => seen_less = true,
                Ordering::Greater => seen_greater = true,
                Ordering::Equal => {}
            }
            if seen_less && seen_greater {
                return None;
            }
        }
        Some(match (seen_less, seen_greater) {
            (false, false) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (true, true) => unreachable!(),
        })
    }

    /// True if `self` dominates or equals `other` on every component.
    pub fn ge(&self, other: &VClock) -> bool {
        matches!(
            self.partial_cmp_clock(other),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )
    }

    /// Iterate over `(replica_id, lsn)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, i64)> + '_ {
        self.components.iter().map(|(&id, &lsn)| (id, lsn))
    }
}

impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (&id, &lsn)) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", id, lsn)?;
        }
        write!(f, "}}")
    }
}

/// True when the horizon has just crossed `target`: `old` was not strictly
/// ahead of `target`, and `new` dominates it. Used to decide when a moved
/// ack or gc lower bound makes a sealed segment collectable.
pub fn order_crossed(old: &VClock, target: &VClock, new: &VClock) -> bool {
    if old.partial_cmp_clock(target) == Some(Ordering::Greater) {
        return false;
    }
    new.ge(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(ReplicaId, i64)]) -> VClock {
        VClock::from_components(pairs.iter().copied())
    }

    #[test]
    fn test_absent_component_reads_zero() {
        let v = VClock::new();
        assert_eq!(v.get(1), 0);
        assert!(v.is_empty());
    }

    #[test]
    fn test_inc_advances_by_one() {
        let mut v = VClock::new();
        assert_eq!(v.inc(1), 1);
        assert_eq!(v.inc(1), 2);
        assert_eq!(v.inc(2), 1);
        assert_eq!(v.signature(), 3);
    }

    #[test]
    fn test_follow_is_strictly_monotonic() {
        let mut v = clock(&[(1, 5)]);
        v.follow(1, 7).unwrap();
        assert_eq!(v.get(1), 7);

        let err = v.follow(1, 7).unwrap_err();
        assert_eq!(err.current, 7);
        assert_eq!(err.proposed, 7);
        assert!(v.follow(1, 3).is_err());
        // A failed follow leaves the clock untouched.
        assert_eq!(v.get(1), 7);
    }

    #[test]
    fn test_merge_adds_components() {
        let mut v = clock(&[(1, 5), (2, 3)]);
        v.merge(&clock(&[(1, 2), (3, 4)]));
        assert_eq!(v.get(1), 7);
        assert_eq!(v.get(2), 3);
        assert_eq!(v.get(3), 4);
    }

    #[test]
    fn test_compare_total_cases() {
        let a = clock(&[(1, 5)]);
        let b = clock(&[(1, 5), (2, 1)]);
        assert_eq!(a.partial_cmp_clock(&b), Some(Ordering::Less));
        assert_eq!(b.partial_cmp_clock(&a), Some(Ordering::Greater));
        assert_eq!(a.partial_cmp_clock(&a), Some(Ordering::Equal));
    }

    #[test]
    fn test_compare_undefined() {
        let a = clock(&[(1, 5), (2, 1)]);
        let b = clock(&[(1, 4), (2, 2)]);
        assert_eq!(a.partial_cmp_clock(&b), None);
        assert!(!a.ge(&b));
        assert!(!b.ge(&a));
    }

    #[test]
    fn test_signature_sums_components() {
        assert_eq!(clock(&[(1, 5), (2, 10)]).signature(), 15);
        assert_eq!(VClock::new().signature(), 0);
    }

    #[test]
    fn test_order_crossed() {
        let target = clock(&[(1, 3)]);
        // Behind -> ahead: crossed.
        assert!(order_crossed(&clock(&[(1, 1)]), &target, &clock(&[(1, 5)])));
        // Behind -> still behind: not crossed.
        assert!(!order_crossed(&clock(&[(1, 1)]), &target, &clock(&[(1, 2)])));
        // Already ahead: not crossed again.
        assert!(!order_crossed(&clock(&[(1, 4)]), &target, &clock(&[(1, 5)])));
    }

    #[test]
    fn test_display_format() {
        let v = clock(&[(1, 5), (2, 10)]);
        assert_eq!(format!("{}", v), "{1: 5, 2: 10}");
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = clock(&[(1, 5), (7, 2)]);
        let json = serde_json::to_string(&v).unwrap();
        let back: VClock = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
