//! Raft RPC payloads.

use crate::LogEntry;
use distlab_core::{Payload, ParticipantId};
use distlab_types::Term;

/// Messages exchanged between Raft nodes.
///
/// Log indices are 1-based; index 0 means "before the first entry".
#[derive(Debug, Clone, PartialEq)]
pub enum RaftMessage {
    RequestVote {
        term: Term,
        candidate: ParticipantId,
        last_log_index: usize,
    },
    VoteResponse {
        term: Term,
        granted: bool,
    },
    /// Replicates `entries` after `prev_log_index`. Empty entries = heartbeat.
    AppendEntries {
        term: Term,
        leader: ParticipantId,
        prev_log_index: usize,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: usize,
    },
    AppendEntriesResponse {
        term: Term,
        success: bool,
        /// On success, the last index now matching the leader. On failure,
        /// the follower's log length as a hint for the leader's next retry.
        match_index: usize,
    },
}

impl Payload for RaftMessage {
    fn type_name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::VoteResponse { .. } => "VoteResponse",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendEntriesResponse { .. } => "AppendEntriesResponse",
        }
    }
}
