//! Configuration types for the replay runner.

use clap::ValueEnum;
use distlab_clocks::ClockConfig;
use distlab_commit::CommitConfig;
use distlab_consensus::{PaxosConfig, PbftConfig};
use distlab_coordination::{LockConfig, WorkQueueConfig};
use distlab_crdt::CrdtConfig;
use distlab_membership::{GossipConfig, PhiAccrualConfig, ShardingConfig};
use distlab_raft::RaftConfig;
use distlab_replication::{AntiEntropyConfig, ChainConfig, IsrConfig, QuorumConfig};
use distlab_simulation::{DeliveryConfig, HarnessConfig};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Protocols a scenario can be replayed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Raft,
    Paxos,
    Pbft,
    Quorum,
    Isr,
    Chain,
    AntiEntropy,
    TwoPhaseCommit,
    ThreePhaseCommit,
    Gossip,
    PhiAccrual,
    Sharding,
    GCounter,
    PnCounter,
    LwwRegister,
    OrSet,
    Lamport,
    VectorClocks,
    CausalBroadcast,
    LockService,
    WorkQueue,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Raft => "raft",
            Protocol::Paxos => "paxos",
            Protocol::Pbft => "pbft",
            Protocol::Quorum => "quorum",
            Protocol::Isr => "isr",
            Protocol::Chain => "chain",
            Protocol::AntiEntropy => "anti-entropy",
            Protocol::TwoPhaseCommit => "two-phase-commit",
            Protocol::ThreePhaseCommit => "three-phase-commit",
            Protocol::Gossip => "gossip",
            Protocol::PhiAccrual => "phi-accrual",
            Protocol::Sharding => "sharding",
            Protocol::GCounter => "g-counter",
            Protocol::PnCounter => "pn-counter",
            Protocol::LwwRegister => "lww-register",
            Protocol::OrSet => "or-set",
            Protocol::Lamport => "lamport",
            Protocol::VectorClocks => "vector-clocks",
            Protocol::CausalBroadcast => "causal-broadcast",
            Protocol::LockService => "lock-service",
            Protocol::WorkQueue => "work-queue",
        })
    }
}

/// Configuration for a replay run.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub protocol: Protocol,

    /// Participant count. `None` uses the protocol's default.
    pub nodes: Option<usize>,

    /// Timeline speed multiplier.
    pub speed: f64,

    /// Seed for delivery jitter and any protocol randomness.
    pub seed: u64,

    /// Transit delay for every message.
    pub delay: Duration,

    /// Delivery jitter as a fraction of `delay`.
    pub jitter: f64,
}

impl ReplayConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            nodes: None,
            speed: 1.0,
            seed: 42,
            delay: Duration::from_millis(500),
            jitter: 0.0,
        }
    }

    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Host-side settings for the simulation harness.
    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig::default().with_delivery(
            DeliveryConfig::default()
                .with_delay(self.delay)
                .with_jitter(self.jitter)
                .with_seed(self.seed),
        )
    }

    pub fn raft_config(&self) -> RaftConfig {
        self.nodes.map(RaftConfig::new).unwrap_or_default()
    }

    pub fn quorum_config(&self) -> QuorumConfig {
        self.nodes.map(QuorumConfig::new).unwrap_or_default()
    }

    pub fn gossip_config(&self) -> GossipConfig {
        self.nodes
            .map(GossipConfig::new)
            .unwrap_or_default()
            .with_seed(self.seed)
    }

    /// `nodes` counts cohorts; the coordinator is extra.
    pub fn commit_config(&self) -> CommitConfig {
        self.nodes.map(CommitConfig::new).unwrap_or_default()
    }

    pub fn paxos_config(&self) -> PaxosConfig {
        self.nodes.map(PaxosConfig::new).unwrap_or_default()
    }

    /// Largest `f` with `3f + 1 <= nodes`.
    pub fn pbft_config(&self) -> PbftConfig {
        self.nodes
            .map(|n| PbftConfig::new(n.saturating_sub(1) / 3))
            .unwrap_or_default()
    }

    pub fn isr_config(&self) -> IsrConfig {
        self.nodes.map(IsrConfig::new).unwrap_or_default()
    }

    pub fn chain_config(&self) -> ChainConfig {
        self.nodes.map(ChainConfig::new).unwrap_or_default()
    }

    pub fn anti_entropy_config(&self) -> AntiEntropyConfig {
        self.nodes.map(AntiEntropyConfig::new).unwrap_or_default()
    }

    /// `nodes` counts monitored nodes; the monitor is extra.
    pub fn phi_accrual_config(&self) -> PhiAccrualConfig {
        self.nodes.map(PhiAccrualConfig::new).unwrap_or_default()
    }

    pub fn sharding_config(&self) -> ShardingConfig {
        self.nodes.map(ShardingConfig::new).unwrap_or_default()
    }

    pub fn crdt_config(&self) -> CrdtConfig {
        self.nodes.map(CrdtConfig::new).unwrap_or_default()
    }

    pub fn clock_config(&self) -> ClockConfig {
        self.nodes.map(ClockConfig::new).unwrap_or_default()
    }

    /// `nodes` counts clients; the lock server and storage are extra.
    pub fn lock_config(&self) -> LockConfig {
        self.nodes.map(LockConfig::new).unwrap_or_default()
    }

    /// `nodes` counts workers; the broker is extra.
    pub fn work_queue_config(&self) -> WorkQueueConfig {
        self.nodes.map(WorkQueueConfig::new).unwrap_or_default()
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self::new(Protocol::Raft)
    }
}
