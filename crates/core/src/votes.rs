//! Vote tracker shared by quorum-driven protocols.

use distlab_types::ParticipantId;
use std::collections::{BTreeMap, BTreeSet};

/// Tracks votes from distinct participants, grouped by what they voted for.
///
/// Keys are whatever the protocol votes on: a proposal number (Paxos), a
/// `(sequence, digest)` pair (PBFT), a request id (quorum writes). A voter
/// counts at most once per key, so redelivered or duplicated votes never
/// inflate a tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteTracker<K: Ord> {
    votes: BTreeMap<K, BTreeSet<ParticipantId>>,
}

impl<K: Ord> Default for VoteTracker<K> {
    fn default() -> Self {
        Self {
            votes: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> VoteTracker<K> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote. Returns true if this voter had not yet voted for `key`.
    pub fn add_vote(&mut self, key: K, voter: ParticipantId) -> bool {
        self.votes.entry(key).or_default().insert(voter)
    }

    /// Number of distinct voters for `key`.
    pub fn count(&self, key: &K) -> usize {
        self.votes.get(key).map_or(0, BTreeSet::len)
    }

    /// Check if `voter` voted for `key`.
    pub fn has_voted(&self, key: &K, voter: &str) -> bool {
        self.votes.get(key).is_some_and(|voters| voters.contains(voter))
    }

    /// Voters for `key`, in id order.
    pub fn voters(&self, key: &K) -> impl Iterator<Item = &ParticipantId> {
        self.votes.get(key).into_iter().flatten()
    }

    /// First key (in key order) with at least `threshold` voters.
    ///
    /// Returns `Some((key, count))` if quorum is reached, `None` otherwise.
    pub fn check_quorum(&self, threshold: usize) -> Option<(K, usize)> {
        self.votes
            .iter()
            .find(|(_, voters)| voters.len() >= threshold)
            .map(|(key, voters)| (key.clone(), voters.len()))
    }

    /// Total votes across all keys.
    pub fn total_votes(&self) -> usize {
        self.votes.values().map(BTreeSet::len).sum()
    }

    /// Forget votes whose key fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.votes.retain(|key, _| keep(key));
    }

    /// Forget every vote.
    pub fn clear(&mut self) {
        self.votes.clear();
    }
}
