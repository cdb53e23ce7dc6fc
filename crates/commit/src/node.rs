//! Participants and configuration shared by the commit protocols.

use distlab_core::{
    impl_participant, Health, HealthStats, MessageStats, ParticipantId, ParticipantRegistry,
    Position,
};
use serde::Serialize;
use std::time::Duration;

/// Id of the coordinator participant.
pub const COORDINATOR: &str = "coordinator";

/// Configuration for the commit protocols.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitConfig {
    /// Number of cohorts, named `cohort-0` onwards.
    pub cohorts: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,

    /// Ticks a participant waits in a waiting state before timing out.
    pub timeout_ticks: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            cohorts: 3,
            tick_interval: Duration::from_millis(100),
            timeout_ticks: 5,
        }
    }
}

impl CommitConfig {
    pub fn new(cohorts: usize) -> Self {
        Self {
            cohorts,
            ..Default::default()
        }
    }

    pub fn with_timeout_ticks(mut self, ticks: u64) -> Self {
        self.timeout_ticks = ticks;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitRole {
    Coordinator,
    Cohort,
}

/// Transaction state of one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    #[default]
    Idle,
    /// Coordinator: waiting for votes.
    Waiting,
    /// Cohort: voted yes, waiting for the decision.
    Prepared,
    /// Three-phase only: decision is commit, waiting for the final round.
    PreCommitted,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_final(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// Coordinator or cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub role: CommitRole,
    pub state: TxnState,
    /// Transaction the state refers to.
    pub txn: Option<String>,
    /// Cohort: how this cohort will vote on the next prepare.
    pub vote_yes: bool,
    /// Tick at which `state` was entered.
    pub since_tick: u64,
}

impl_participant!(CommitNode);

impl CommitNode {
    fn new(id: ParticipantId, role: CommitRole, position: Position) -> Self {
        Self {
            id,
            health: Health::Healthy,
            position,
            role,
            state: TxnState::Idle,
            txn: None,
            vote_yes: true,
            since_tick: 0,
        }
    }

    pub(crate) fn enter(&mut self, state: TxnState, tick: u64) {
        self.state = state;
        self.since_tick = tick;
    }

    pub(crate) fn timed_out(&self, tick: u64, timeout: u64) -> bool {
        tick.saturating_sub(self.since_tick) >= timeout
    }

    pub(crate) fn is_for(&self, txn: &str) -> bool {
        self.txn.as_deref() == Some(txn)
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == CommitRole::Coordinator
    }
}

/// Build the coordinator and cohorts for a configuration.
pub(crate) fn initial_nodes(config: &CommitConfig) -> ParticipantRegistry<CommitNode> {
    let count = config.cohorts + 1;
    let coordinator = CommitNode::new(
        ParticipantId::from(COORDINATOR),
        CommitRole::Coordinator,
        Position::default(),
    );
    let cohorts = (0..config.cohorts).map(|i| {
        CommitNode::new(
            ParticipantId::indexed("cohort", i),
            CommitRole::Cohort,
            Position::on_ring(i + 1, count, 200.0),
        )
    });
    ParticipantRegistry::from_participants(std::iter::once(coordinator).chain(cohorts))
}

/// Observable summary of a commit protocol run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub coordinator: TxnState,
    pub committed: usize,
    pub aborted: usize,
    /// Cohorts waiting in `Prepared` or `PreCommitted`.
    pub uncertain: usize,
    /// Healthy cohorts stuck waiting while the coordinator is failed.
    pub blocked: usize,
}

impl CommitStats {
    pub(crate) fn collect(nodes: &ParticipantRegistry<CommitNode>, messages: MessageStats) -> Self {
        let cohorts = || nodes.iter().filter(|n| !n.is_coordinator());
        let uncertain =
            |n: &&CommitNode| matches!(n.state, TxnState::Prepared | TxnState::PreCommitted);
        let coordinator_down = !nodes.is_available(COORDINATOR);

        Self {
            health: HealthStats::from_registry(nodes),
            messages,
            coordinator: nodes.get(COORDINATOR).map_or(TxnState::Idle, |c| c.state),
            committed: cohorts().filter(|n| n.state == TxnState::Committed).count(),
            aborted: cohorts().filter(|n| n.state == TxnState::Aborted).count(),
            uncertain: cohorts().filter(uncertain).count(),
            blocked: if coordinator_down {
                cohorts()
                    .filter(|n| n.health.is_healthy())
                    .filter(uncertain)
                    .count()
            } else {
                0
            },
        }
    }
}
