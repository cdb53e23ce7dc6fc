use crate::{Crdt, GCounter};
use distlab_core::ParticipantId;
use serde::Deserialize;

/// Scenario data form: `{ "increment": 2 }` or `{ "decrement": 1 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnOp {
    Increment(u64),
    Decrement(u64),
}

/// Counter supporting decrements, built from two grow-only counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PnCounter {
    increments: GCounter,
    decrements: GCounter,
}

impl Crdt for PnCounter {
    type Op = PnOp;
    type Value = i64;

    const NAME: &'static str = "pn-counter";

    fn apply(&mut self, replica: &ParticipantId, op: PnOp) {
        match op {
            PnOp::Increment(by) => self.increments.increment(replica, by),
            PnOp::Decrement(by) => self.decrements.increment(replica, by),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.increments.merge(&other.increments);
        self.decrements.merge(&other.decrements);
    }

    fn value(&self) -> i64 {
        self.increments.total() as i64 - self.decrements.total() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_increment_and_decrement() {
        let (r0, r1) = (ParticipantId::from("r0"), ParticipantId::from("r1"));
        let mut a = PnCounter::default();
        let mut b = PnCounter::default();
        a.apply(&r0, PnOp::Increment(5));
        b.apply(&r1, PnOp::Decrement(7));

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.value(), -2);
        assert_eq!(ab, ba);

        let again = ab.clone();
        ab.merge(&again);
        assert_eq!(ab.value(), -2);
    }
}
