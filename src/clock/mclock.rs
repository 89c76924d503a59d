//! Matrix clock: one vclock per attached follower.

use std::collections::BTreeMap;

use super::{ReplicaId, VClock};

/// Per-follower acknowledgement clocks, owned by the WAL thread.
///
/// Rows are added when a relay attaches and removed when the follower is
/// dropped from the replica set. The component-wise minimum over all rows
/// bounds garbage collection: no segment a follower still needs may be
/// deleted.
#[derive(Debug, Default)]
pub struct MClock {
    rows: BTreeMap<ReplicaId, VClock>,
}

impl MClock {
    /// An empty matrix.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no follower is attached.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of attached followers.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Replace the row for `replica_id` with `vclock`, returning the
    /// previous row if one existed.
    pub fn update(&mut self, replica_id: ReplicaId, vclock: VClock) -> Option<VClock> {
        self.rows.insert(replica_id, vclock)
    }

    /// Drop the row for `replica_id`.
    pub fn remove(&mut self, replica_id: ReplicaId) -> Option<VClock> {
        self.rows.remove(&replica_id)
    }

    /// The row for `replica_id`, if attached.
    pub fn get(&self, replica_id: ReplicaId) -> Option<&VClock> {
        self.rows.get(&replica_id)
    }

    /// Component-wise minimum over all rows, or `None` if no follower is
    /// attached. A component missing from any row reads as zero, so one
    /// fresh follower pins the entire log.
    pub fn min(&self) -> Option<VClock> {
        if self.rows.is_empty() {
            return None;
        }
        let mut ids: Vec<ReplicaId> = Vec::new();
        for row in self.rows.values() {
            for (id, _) in row.iter() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        let mut min = VClock::new();
        for id in ids {
            let lowest = self
                .rows
                .values()
                .map(|row| row.get(id))
                .min()
                .unwrap_or(0);
            if lowest != 0 {
                // follow() from zero always succeeds for positive LSNs.
                min.follow(id, lowest).expect("minimum is positive");
            }
        }
        Some(min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(ReplicaId, i64)]) -> VClock {
        VClock::from_components(pairs.iter().copied())
    }

    #[test]
    fn test_min_of_empty_matrix_is_none() {
        assert_eq!(MClock::new().min(), None);
    }

    #[test]
    fn test_min_single_row() {
        let mut m = MClock::new();
        m.update(2, clock(&[(1, 5)]));
        assert_eq!(m.min(), Some(clock(&[(1, 5)])));
    }

    #[test]
    fn test_min_is_component_wise() {
        let mut m = MClock::new();
        m.update(2, clock(&[(1, 5), (2, 9)]));
        m.update(3, clock(&[(1, 7), (2, 4)]));
        assert_eq!(m.min(), Some(clock(&[(1, 5), (2, 4)])));
    }

    #[test]
    fn test_fresh_follower_pins_everything() {
        let mut m = MClock::new();
        m.update(2, clock(&[(1, 100)]));
        m.update(3, VClock::new());
        // Replica 3 has acked nothing, so the minimum is the zero clock.
        assert_eq!(m.min(), Some(VClock::new()));
    }

    #[test]
    fn test_remove_unpins() {
        let mut m = MClock::new();
        m.update(2, clock(&[(1, 3)]));
        m.update(3, clock(&[(1, 8)]));
        m.remove(2);
        assert_eq!(m.min(), Some(clock(&[(1, 8)])));
        m.remove(3);
        assert_eq!(m.min(), None);
    }

    #[test]
    fn test_update_returns_previous_row() {
        let mut m = MClock::new();
        assert_eq!(m.update(2, clock(&[(1, 3)])), None);
        assert_eq!(m.update(2, clock(&[(1, 6)])), Some(clock(&[(1, 3)])));
    }
}
