use crate::Crdt;
use distlab_core::ParticipantId;
use std::collections::BTreeMap;

/// Grow-only counter: one monotonically increasing slot per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GCounter {
    counts: BTreeMap<ParticipantId, u64>,
}

impl GCounter {
    pub fn increment(&mut self, replica: &ParticipantId, by: u64) {
        *self.counts.entry(replica.clone()).or_insert(0) += by;
    }

    /// This replica's own contribution.
    pub fn count_of(&self, replica: &str) -> u64 {
        self.counts.get(replica).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl Crdt for GCounter {
    type Op = u64;
    type Value = u64;

    const NAME: &'static str = "g-counter";

    fn apply(&mut self, replica: &ParticipantId, by: u64) {
        self.increment(replica, by);
    }

    fn merge(&mut self, other: &Self) {
        for (replica, count) in &other.counts {
            let slot = self.counts.entry(replica.clone()).or_insert(0);
            *slot = (*slot).max(*count);
        }
    }

    fn value(&self) -> u64 {
        self.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(slots: &[(&str, u64)]) -> GCounter {
        let mut c = GCounter::default();
        for (replica, by) in slots {
            c.increment(&ParticipantId::from(*replica), *by);
        }
        c
    }

    #[test]
    fn test_merge_takes_per_replica_max() {
        let mut a = counter(&[("r0", 3), ("r1", 1)]);
        let b = counter(&[("r0", 1), ("r1", 4), ("r2", 2)]);
        a.merge(&b);
        assert_eq!(a.count_of("r0"), 3);
        assert_eq!(a.count_of("r1"), 4);
        assert_eq!(a.value(), 9);
    }

    #[test]
    fn test_merge_laws() {
        let a = counter(&[("r0", 3)]);
        let b = counter(&[("r1", 5), ("r0", 1)]);
        let c = counter(&[("r2", 2)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);

        let mut aa = a.clone();
        aa.merge(&a);
        assert_eq!(aa, a);
    }
}
