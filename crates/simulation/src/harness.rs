//! Ready-bound playbacks for the protocols the replay CLI knows.

use crate::bindings::{
    bind_anti_entropy, bind_causal_broadcast, bind_chain, bind_crdt, bind_gossip, bind_isr,
    bind_lamport, bind_lock_service, bind_paxos, bind_pbft, bind_phi_accrual, bind_quorum,
    bind_raft, bind_sharding, bind_three_phase_commit, bind_two_phase_commit, bind_vector_clocks,
    bind_work_queue,
};
use crate::{ConfigError, DeliveryConfig, Playback};
use distlab_clocks::{CausalBroadcast, ClockConfig, LamportClocks, VectorClocks};
use distlab_commit::{CommitConfig, ThreePhaseCommit, TwoPhaseCommit};
use distlab_consensus::{PaxosCluster, PaxosConfig, PbftCluster, PbftConfig};
use distlab_coordination::{LockConfig, LockService, WorkQueue, WorkQueueConfig};
use distlab_core::ProtocolStateMachine;
use distlab_crdt::{Crdt, CrdtCluster, CrdtConfig};
use distlab_membership::{Gossip, GossipConfig, PhiAccrual, PhiAccrualConfig, Sharding, ShardingConfig};
use distlab_raft::{RaftCluster, RaftConfig};
use distlab_replication::{
    AntiEntropy, AntiEntropyConfig, ChainConfig, ChainReplication, IsrConfig, IsrLog, QuorumConfig,
    QuorumReplication,
};
use distlab_timeline::{Scenario, TimelineConfig, TimelineController};
use tracing::info;

/// Host-side settings shared by every harness.
#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub timeline: TimelineConfig,
    pub delivery: DeliveryConfig,
}

impl HarnessConfig {
    pub fn with_timeline(mut self, timeline: TimelineConfig) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }
}

fn require_nodes(count: usize) -> Result<(), ConfigError> {
    if count == 0 {
        return Err(ConfigError::NoNodes);
    }
    Ok(())
}

fn build<S: ProtocolStateMachine + 'static>(
    state: S,
    scenario: Scenario,
    harness: &HarnessConfig,
    bind: fn(&mut TimelineController<S>),
) -> Result<Playback<S>, ConfigError> {
    harness.delivery.validate()?;
    info!(
        protocol = state.name(),
        scenario = %scenario.name,
        events = scenario.events.len(),
        "Building harness"
    );
    let mut timeline = TimelineController::with_scenario(scenario, harness.timeline.clone());
    bind(&mut timeline);
    Ok(Playback::new(state, timeline, harness.delivery.clone()))
}

pub fn raft(
    config: RaftConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<RaftCluster>, ConfigError> {
    require_nodes(config.node_count)?;
    build(RaftCluster::new(config), scenario, harness, bind_raft)
}

/// Rejects quorum settings that cannot be met, e.g. `W > RF`.
pub fn quorum(
    config: QuorumConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<QuorumReplication>, ConfigError> {
    require_nodes(config.nodes)?;
    config.validate()?;
    build(QuorumReplication::new(config), scenario, harness, bind_quorum)
}

pub fn gossip(
    config: GossipConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<Gossip>, ConfigError> {
    require_nodes(config.nodes)?;
    build(Gossip::new(config), scenario, harness, bind_gossip)
}

pub fn two_phase_commit(
    config: CommitConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<TwoPhaseCommit>, ConfigError> {
    require_nodes(config.cohorts)?;
    build(TwoPhaseCommit::new(config), scenario, harness, bind_two_phase_commit)
}

pub fn three_phase_commit(
    config: CommitConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<ThreePhaseCommit>, ConfigError> {
    require_nodes(config.cohorts)?;
    build(ThreePhaseCommit::new(config), scenario, harness, bind_three_phase_commit)
}

pub fn paxos(
    config: PaxosConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<PaxosCluster>, ConfigError> {
    require_nodes(config.node_count)?;
    build(PaxosCluster::new(config), scenario, harness, bind_paxos)
}

/// `f = 0` is allowed: a single replica tolerates no byzantine faults.
pub fn pbft(
    config: PbftConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<PbftCluster>, ConfigError> {
    build(PbftCluster::new(config), scenario, harness, bind_pbft)
}

pub fn isr(
    config: IsrConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<IsrLog>, ConfigError> {
    require_nodes(config.brokers)?;
    build(IsrLog::new(config), scenario, harness, bind_isr)
}

pub fn chain(
    config: ChainConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<ChainReplication>, ConfigError> {
    require_nodes(config.nodes)?;
    build(ChainReplication::new(config), scenario, harness, bind_chain)
}

pub fn anti_entropy(
    config: AntiEntropyConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<AntiEntropy>, ConfigError> {
    require_nodes(config.replicas)?;
    build(AntiEntropy::new(config), scenario, harness, bind_anti_entropy)
}

pub fn phi_accrual(
    config: PhiAccrualConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<PhiAccrual>, ConfigError> {
    require_nodes(config.nodes)?;
    build(PhiAccrual::new(config), scenario, harness, bind_phi_accrual)
}

pub fn sharding(
    config: ShardingConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<Sharding>, ConfigError> {
    require_nodes(config.nodes)?;
    build(Sharding::new(config), scenario, harness, bind_sharding)
}

pub fn crdt<C: Crdt + 'static>(
    config: CrdtConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<CrdtCluster<C>>, ConfigError> {
    require_nodes(config.replicas)?;
    build(CrdtCluster::new(config), scenario, harness, bind_crdt::<C>)
}

pub fn lamport(
    config: ClockConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<LamportClocks>, ConfigError> {
    require_nodes(config.nodes)?;
    build(LamportClocks::new(config), scenario, harness, bind_lamport)
}

pub fn vector_clocks(
    config: ClockConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<VectorClocks>, ConfigError> {
    require_nodes(config.nodes)?;
    build(VectorClocks::new(config), scenario, harness, bind_vector_clocks)
}

pub fn causal_broadcast(
    config: ClockConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<CausalBroadcast>, ConfigError> {
    require_nodes(config.nodes)?;
    build(CausalBroadcast::new(config), scenario, harness, bind_causal_broadcast)
}

pub fn lock_service(
    config: LockConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<LockService>, ConfigError> {
    require_nodes(config.clients)?;
    build(LockService::new(config), scenario, harness, bind_lock_service)
}

pub fn work_queue(
    config: WorkQueueConfig,
    scenario: Scenario,
    harness: &HarnessConfig,
) -> Result<Playback<WorkQueue>, ConfigError> {
    require_nodes(config.workers)?;
    build(WorkQueue::new(config), scenario, harness, bind_work_queue)
}
