//! Replication models.
//!
//! ```text
//!  quorum        write ──Replicate──▶ preference list ──WriteAck──▶ durable at W
//!                read  ──Read──▶ preference list ──newest of R──▶ ReadRepair
//!
//!  isr           followers ──Fetch(offset)──▶ leader ──records──▶ followers
//!                high watermark = min log end offset over the in-sync set
//!
//!  chain         head ──Forward──▶ ... ──▶ tail ──Ack──▶ ... ──▶ head
//!
//!  anti-entropy  Merkle root ──▶ differing subtrees ──▶ differing buckets
//! ```
//!
//! Every model owns its participants and message pool and implements
//! [`distlab_core::ProtocolStateMachine`].

mod anti_entropy;
mod chain;
mod error;
mod isr;
mod quorum;
mod versioned;

pub use anti_entropy::{AntiEntropy, AntiEntropyConfig, AntiEntropyMessage, AntiEntropyStats, Replica};
pub use chain::{ChainConfig, ChainMessage, ChainNode, ChainReplication, ChainStats};
pub use error::QuorumConfigError;
pub use isr::{Broker, IsrConfig, IsrLog, IsrMessage, IsrStats};
pub use quorum::{QuorumConfig, QuorumMessage, QuorumNode, QuorumReplication, QuorumStats, RequestId};
pub use versioned::{Store, Versioned};
