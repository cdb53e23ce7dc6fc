//! Raft consensus model.
//!
//! A deterministic model of Raft leader election and log replication over
//! an explicit in-flight message pool:
//!
//! - `start_election(id)` → candidate broadcasts `RequestVote`
//! - `RequestVote` → voter grants at most one vote per term
//! - `VoteResponse` → candidate becomes leader on a strict majority of
//!   healthy nodes and sends heartbeats
//! - `add_client_request(leader, cmd)` → leader appends and replicates
//! - `AppendEntriesResponse` → leader advances its commit index
//!
//! Elections are triggered externally: `tick()` advances time only.

mod config;
mod message;
mod node;
mod state;

pub use config::RaftConfig;
pub use message::RaftMessage;
pub use node::{LogEntry, RaftNode, Role};
pub use state::{RaftCluster, RaftStats};
