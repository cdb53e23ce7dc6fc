//! Network partitions.

use distlab_types::ParticipantId;
use std::collections::BTreeSet;

/// A set of disjoint participant groups that cannot reach each other.
///
/// Participants not named in any group form one implicit group of their own.
/// With no groups the network is whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partitions {
    groups: Vec<BTreeSet<ParticipantId>>,
}

impl Partitions {
    /// A whole network.
    pub fn none() -> Self {
        Self::default()
    }

    /// Split the network into `groups`. Empty groups are ignored.
    pub fn split<G, I>(groups: G) -> Self
    where
        G: IntoIterator<Item = I>,
        I: IntoIterator<Item = ParticipantId>,
    {
        let groups = groups
            .into_iter()
            .map(|group| group.into_iter().collect::<BTreeSet<_>>())
            .filter(|group| !group.is_empty())
            .collect();
        Self { groups }
    }

    /// Remove every partition.
    pub fn heal(&mut self) {
        self.groups.clear();
    }

    /// Check if any partition is in effect.
    pub fn is_partitioned(&self) -> bool {
        !self.groups.is_empty()
    }

    /// The partition groups.
    pub fn groups(&self) -> &[BTreeSet<ParticipantId>] {
        &self.groups
    }

    fn group_of(&self, id: &str) -> Option<usize> {
        self.groups.iter().position(|group| group.contains(id))
    }

    /// Check if `a` can reach `b`.
    pub fn can_communicate(&self, a: &str, b: &str) -> bool {
        a == b || self.group_of(a) == self.group_of(b)
    }
}
