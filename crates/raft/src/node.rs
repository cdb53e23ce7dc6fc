//! Raft node state.

use distlab_core::{impl_participant, Health, ParticipantId, Position};
use distlab_types::Term;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Raft role. Orthogonal to health: a failed node keeps its role for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

/// A replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: String,
}

/// One Raft node.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftNode {
    pub id: ParticipantId,
    pub role: Role,
    pub health: Health,

    /// Latest term this node has seen.
    pub term: Term,

    /// Candidate voted for in `term`, if any.
    pub voted_for: Option<ParticipantId>,

    /// Granted votes received in `term` while candidate or leader, self included.
    pub votes: BTreeSet<ParticipantId>,

    pub log: Vec<LogEntry>,

    /// Highest log index known committed (1-based, 0 = none).
    pub commit_index: usize,

    /// Leader of `term` as far as this node knows.
    pub leader: Option<ParticipantId>,

    /// Leader only: next log index to send to each follower.
    pub next_index: BTreeMap<ParticipantId, usize>,

    /// Leader only: highest index known replicated on each follower.
    pub match_index: BTreeMap<ParticipantId, usize>,

    pub position: Position,
}

impl_participant!(RaftNode);

impl RaftNode {
    /// Create a follower at term 0 with an empty log.
    pub fn new(id: ParticipantId, position: Position) -> Self {
        Self {
            id,
            role: Role::Follower,
            health: Health::Healthy,
            term: Term::ZERO,
            voted_for: None,
            votes: BTreeSet::new(),
            log: Vec::new(),
            commit_index: 0,
            leader: None,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            position,
        }
    }

    /// Number of granted votes in the current term.
    pub fn tally(&self) -> usize {
        self.votes.len()
    }

    /// Index of the last log entry (0 when empty).
    pub fn last_log_index(&self) -> usize {
        self.log.len()
    }

    /// Term of the entry at a 1-based index. Index 0 has term zero.
    pub fn term_at(&self, index: usize) -> Option<Term> {
        match index {
            0 => Some(Term::ZERO),
            i => self.log.get(i - 1).map(|e| e.term),
        }
    }

    /// Adopt a newer term: clear the vote, forget the leader, step down.
    pub(crate) fn adopt_term(&mut self, term: Term) {
        self.term = term;
        self.voted_for = None;
        self.votes.clear();
        self.leader = None;
        self.role = Role::Follower;
        self.next_index.clear();
        self.match_index.clear();
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}
