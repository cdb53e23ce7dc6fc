//! Agreement protocols beyond Raft.
//!
//! - [`PaxosCluster`]: single-decree Paxos, every node both proposer and
//!   acceptor, with a `Chosen` broadcast so every node learns the value.
//! - [`PbftCluster`]: the PBFT normal case (pre-prepare, prepare, commit) over
//!   `n = 3f + 1` replicas, with injectable byzantine replicas.

mod paxos;
mod pbft;

pub use paxos::{
    PaxosCluster, PaxosConfig, PaxosMessage, PaxosNode, PaxosStats, Proposal, ProposalNumber,
    ProposalPhase,
};
pub use pbft::{PbftCluster, PbftConfig, PbftMessage, PbftReplica, PbftStats, Slot};
