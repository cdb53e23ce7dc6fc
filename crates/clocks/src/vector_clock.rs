//! Vector clock value type.

use distlab_core::ParticipantId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// How two vector clocks relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Every entry is `<=` and at least one is `<`.
    Before,
    After,
    Equal,
    Concurrent,
}

/// A map from node to the number of its events seen. Missing entries are 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ParticipantId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &str) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    pub fn set(&mut self, node: &ParticipantId, value: u64) {
        self.0.insert(node.clone(), value);
    }

    /// Count one more event at `node`.
    pub fn increment(&mut self, node: &ParticipantId) -> u64 {
        let slot = self.0.entry(node.clone()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Entry-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, value) in &other.0 {
            let slot = self.0.entry(node.clone()).or_insert(0);
            *slot = (*slot).max(*value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, u64)> {
        self.0.iter().map(|(node, value)| (node, *value))
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let nodes = self.0.keys().chain(other.0.keys());
        let (mut less, mut greater) = (false, false);
        for node in nodes {
            let (a, b) = (self.get(node), other.get(node));
            less |= a < b;
            greater |= a > b;
        }
        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (node, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{node}:{value}")?;
        }
        f.write_str("]")
    }
}
