use crate::Crdt;
use distlab_core::ParticipantId;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Scenario data form: `{ "add": "x" }` or `{ "remove": "x" }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrSetOp {
    Add(String),
    Remove(String),
}

/// A unique tag for one add: the adding replica and its add counter.
type Dot = (ParticipantId, u64);

/// Observed-remove set.
///
/// Every add is tagged with a fresh [`Dot`]; a remove tombstones only the
/// dots it has observed, so an add concurrent with a remove survives the
/// merge (add wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrSet {
    entries: BTreeMap<String, BTreeSet<Dot>>,
    tombstones: BTreeSet<Dot>,
    clock: BTreeMap<ParticipantId, u64>,
}

impl OrSet {
    pub fn contains(&self, element: &str) -> bool {
        self.entries
            .get(element)
            .is_some_and(|dots| dots.iter().any(|dot| !self.tombstones.contains(dot)))
    }

    fn add(&mut self, replica: &ParticipantId, element: String) {
        let counter = self.clock.entry(replica.clone()).or_insert(0);
        *counter += 1;
        let dot = (replica.clone(), *counter);
        self.entries.entry(element).or_default().insert(dot);
    }

    fn remove(&mut self, element: &str) {
        if let Some(dots) = self.entries.get(element) {
            self.tombstones.extend(dots.iter().cloned());
        }
    }
}

impl Crdt for OrSet {
    type Op = OrSetOp;
    type Value = BTreeSet<String>;

    const NAME: &'static str = "or-set";

    fn apply(&mut self, replica: &ParticipantId, op: OrSetOp) {
        match op {
            OrSetOp::Add(element) => self.add(replica, element),
            OrSetOp::Remove(element) => self.remove(&element),
        }
    }

    fn merge(&mut self, other: &Self) {
        for (element, dots) in &other.entries {
            self.entries
                .entry(element.clone())
                .or_default()
                .extend(dots.iter().cloned());
        }
        self.tombstones.extend(other.tombstones.iter().cloned());
        for (replica, counter) in &other.clock {
            let slot = self.clock.entry(replica.clone()).or_insert(0);
            *slot = (*slot).max(*counter);
        }
    }

    fn value(&self) -> BTreeSet<String> {
        self.entries
            .keys()
            .filter(|element| self.contains(element))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    #[test]
    fn test_add_then_remove() {
        let mut s = OrSet::default();
        s.apply(&r("r0"), OrSetOp::Add("x".into()));
        assert!(s.contains("x"));
        s.apply(&r("r0"), OrSetOp::Remove("x".into()));
        assert!(!s.contains("x"));
        assert!(s.value().is_empty());
    }

    #[test]
    fn test_concurrent_add_wins_over_remove() {
        let mut base = OrSet::default();
        base.apply(&r("r0"), OrSetOp::Add("x".into()));

        let mut a = base.clone();
        let mut b = base.clone();
        a.apply(&r("r0"), OrSetOp::Remove("x".into()));
        b.apply(&r("r1"), OrSetOp::Add("x".into()));

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert!(ab.contains("x"));
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_merge_is_idempotent_and_associative() {
        let mut a = OrSet::default();
        let mut b = OrSet::default();
        let mut c = OrSet::default();
        a.apply(&r("r0"), OrSetOp::Add("x".into()));
        b.apply(&r("r1"), OrSetOp::Add("y".into()));
        c.apply(&r("r2"), OrSetOp::Add("x".into()));
        c.apply(&r("r2"), OrSetOp::Remove("x".into()));

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);
        assert_eq!(left, right);

        let snapshot = left.clone();
        left.merge(&snapshot);
        assert_eq!(left, snapshot);
        assert_eq!(
            left.value(),
            BTreeSet::from(["x".to_string(), "y".to_string()])
        );
    }
}
