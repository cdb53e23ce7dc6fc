//! Two-phase commit.

use crate::node::{initial_nodes, CommitConfig, CommitNode, CommitStats, TxnState, COORDINATOR};
use distlab_core::{
    Health, Message, MessageId, MessagePool, ParticipantId, ParticipantRegistry, Payload,
    ProtocolStateMachine,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Two-phase commit messages.
#[derive(Debug, Clone, PartialEq)]
pub enum TwoPhaseMessage {
    Prepare { txn: String },
    Vote { txn: String, yes: bool },
    Commit { txn: String },
    Abort { txn: String },
}

impl Payload for TwoPhaseMessage {
    fn type_name(&self) -> &'static str {
        match self {
            TwoPhaseMessage::Prepare { .. } => "Prepare",
            TwoPhaseMessage::Vote { .. } => "Vote",
            TwoPhaseMessage::Commit { .. } => "Commit",
            TwoPhaseMessage::Abort { .. } => "Abort",
        }
    }
}

/// Two-phase commit between one coordinator and its cohorts.
#[derive(Debug, Clone, PartialEq)]
pub struct TwoPhaseCommit {
    config: CommitConfig,
    nodes: ParticipantRegistry<CommitNode>,
    pool: MessagePool<TwoPhaseMessage>,
    /// Coordinator's vote log for the current transaction.
    votes: BTreeMap<ParticipantId, bool>,
    ticks: u64,
    now: Duration,
}

impl TwoPhaseCommit {
    pub fn new(config: CommitConfig) -> Self {
        Self {
            nodes: initial_nodes(&config),
            config,
            pool: MessagePool::new(),
            votes: BTreeMap::new(),
            ticks: 0,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&CommitNode> {
        self.nodes.get(id)
    }

    fn cohort_ids(&self) -> Vec<ParticipantId> {
        self.nodes
            .iter()
            .filter(|n| !n.is_coordinator())
            .map(|n| n.id.clone())
            .collect()
    }

    fn broadcast(&mut self, message: TwoPhaseMessage) {
        let coordinator = ParticipantId::from(COORDINATOR);
        for cohort in self.cohort_ids() {
            self.pool
                .send(&coordinator, &cohort, message.clone(), self.now);
        }
    }

    /// Set how a cohort votes on the next prepare. Unknown ids are ignored.
    pub fn set_vote(&mut self, cohort: &str, yes: bool) {
        if let Some(node) = self.nodes.get_mut(cohort) {
            if !node.is_coordinator() {
                node.vote_yes = yes;
            }
        }
    }

    /// Start a transaction: the coordinator sends `Prepare` to every cohort.
    ///
    /// No-op if the coordinator is failed or still waiting on votes.
    pub fn begin(&mut self, txn: impl Into<String>) {
        let txn = txn.into();
        let tick = self.ticks;
        if !self.nodes.is_available(COORDINATOR) {
            debug!(txn = %txn, "Coordinator unavailable, transaction not started");
            return;
        }
        let Some(coordinator) = self.nodes.get_mut(COORDINATOR) else {
            return;
        };
        if coordinator.state == TxnState::Waiting {
            debug!(txn = %txn, "Coordinator busy, transaction not started");
            return;
        }
        coordinator.txn = Some(txn.clone());
        coordinator.enter(TxnState::Waiting, tick);
        self.votes.clear();

        info!(txn = %txn, "Beginning two-phase commit");
        self.broadcast(TwoPhaseMessage::Prepare { txn });
    }

    fn decide(&mut self, commit: bool) {
        let tick = self.ticks;
        let Some(coordinator) = self.nodes.get_mut(COORDINATOR) else {
            return;
        };
        let Some(txn) = coordinator.txn.clone() else {
            return;
        };
        let state = if commit {
            TxnState::Committed
        } else {
            TxnState::Aborted
        };
        coordinator.enter(state, tick);
        info!(txn = %txn, decision = ?state, "Coordinator decided");

        self.broadcast(if commit {
            TwoPhaseMessage::Commit { txn }
        } else {
            TwoPhaseMessage::Abort { txn }
        });
    }

    fn on_prepare(&mut self, to: &ParticipantId, txn: String) {
        let tick = self.ticks;
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        let yes = node.vote_yes;
        node.txn = Some(txn.clone());
        node.enter(
            if yes {
                TxnState::Prepared
            } else {
                TxnState::Aborted
            },
            tick,
        );
        trace!(cohort = %to, txn = %txn, yes, "Voted");
        self.pool.send(
            to,
            &ParticipantId::from(COORDINATOR),
            TwoPhaseMessage::Vote { txn, yes },
            self.now,
        );
    }

    fn on_vote(&mut self, from: ParticipantId, txn: String, yes: bool) {
        let Some(coordinator) = self.nodes.get(COORDINATOR) else {
            return;
        };
        if coordinator.state != TxnState::Waiting || !coordinator.is_for(&txn) {
            return;
        }
        self.votes.insert(from, yes);

        if !yes {
            self.decide(false);
        } else if self.votes.len() == self.config.cohorts && self.votes.values().all(|v| *v) {
            self.decide(true);
        }
    }

    fn on_decision(&mut self, to: &ParticipantId, txn: &str, state: TxnState) {
        let tick = self.ticks;
        if let Some(node) = self.nodes.get_mut(to) {
            if (node.is_for(txn) && !node.state.is_final()) || node.state == TxnState::Idle {
                node.txn = Some(txn.to_string());
                node.enter(state, tick);
            }
        }
    }
}

impl ProtocolStateMachine for TwoPhaseCommit {
    type Participant = CommitNode;
    type Payload = TwoPhaseMessage;
    type Stats = CommitStats;

    fn name(&self) -> &'static str {
        "two-phase-commit"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<CommitNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<TwoPhaseMessage>> {
        self.pool.messages()
    }

    fn list_in_flight(&self) -> Vec<MessageId> {
        self.pool.list_in_flight()
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let Some(message) = self
            .pool
            .deliver_if(id, |m| nodes.is_available(&m.from) && nodes.is_available(&m.to))
        else {
            return;
        };

        let Message { from, to, payload, .. } = message;
        match payload {
            TwoPhaseMessage::Prepare { txn } => self.on_prepare(&to, txn),
            TwoPhaseMessage::Vote { txn, yes } => self.on_vote(from, txn, yes),
            TwoPhaseMessage::Commit { txn } => self.on_decision(&to, &txn, TxnState::Committed),
            TwoPhaseMessage::Abort { txn } => self.on_decision(&to, &txn, TxnState::Aborted),
        }
    }

    /// The coordinator aborts after `timeout_ticks` without every vote.
    ///
    /// Cohorts never time out: a prepared cohort cannot decide alone.
    fn tick(&mut self) {
        self.now += self.config.tick_interval;
        self.ticks += 1;

        let timed_out = self.nodes.get(COORDINATOR).is_some_and(|c| {
            c.health.is_healthy()
                && c.state == TxnState::Waiting
                && c.timed_out(self.ticks, self.config.timeout_ticks)
        });
        if timed_out {
            debug!(votes = self.votes.len(), "Vote timeout, aborting");
            self.decide(false);
        }
    }

    fn fail_node(&mut self, id: &str) {
        if self.nodes.set_health(id, Health::Failed) {
            info!(node = id, "Node failed");
        }
    }

    fn recover_node(&mut self, id: &str) {
        if self.nodes.set_health(id, Health::Healthy) {
            info!(node = id, "Node recovered");
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn stats(&self) -> CommitStats {
        CommitStats::collect(&self.nodes, self.pool.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn protocol() -> TwoPhaseCommit {
        TwoPhaseCommit::new(CommitConfig::default())
    }

    #[traced_test]
    #[test]
    fn test_all_yes_commits() {
        let mut tpc = protocol();
        tpc.begin("tx-1");
        assert_eq!(tpc.list_in_flight().len(), 3);
        tpc.deliver_all();

        let stats = tpc.stats();
        assert_eq!(stats.coordinator, TxnState::Committed);
        assert_eq!(stats.committed, 3);
        assert!(logs_contain("Coordinator decided"));
    }

    #[test]
    fn test_single_no_aborts() {
        let mut tpc = protocol();
        tpc.set_vote("cohort-1", false);
        tpc.begin("tx-1");
        tpc.deliver_all();

        let stats = tpc.stats();
        assert_eq!(stats.coordinator, TxnState::Aborted);
        assert_eq!(stats.aborted, 3);
        assert_eq!(stats.committed, 0);
    }

    #[test]
    fn test_missing_vote_times_out() {
        let mut tpc = protocol();
        tpc.fail_node("cohort-2");
        tpc.begin("tx-1");
        tpc.deliver_all();
        assert_eq!(tpc.node(COORDINATOR).unwrap().state, TxnState::Waiting);

        for _ in 0..5 {
            tpc.tick();
        }
        tpc.deliver_all();
        assert_eq!(tpc.stats().coordinator, TxnState::Aborted);
        assert_eq!(tpc.node("cohort-0").unwrap().state, TxnState::Aborted);
    }

    #[test]
    fn test_cohorts_block_when_coordinator_fails() {
        let mut tpc = protocol();
        tpc.begin("tx-1");
        // Deliver prepares, then lose the coordinator before it hears back.
        for id in tpc.list_in_flight() {
            tpc.deliver(id);
        }
        tpc.fail_node(COORDINATOR);
        tpc.deliver_all();
        for _ in 0..20 {
            tpc.tick();
        }

        let stats = tpc.stats();
        assert_eq!(stats.uncertain, 3);
        assert_eq!(stats.blocked, 3);
        assert_eq!(stats.committed, 0);
    }

    #[test]
    fn test_failed_coordinator_cannot_begin() {
        let mut tpc = protocol();
        tpc.fail_node(COORDINATOR);
        tpc.begin("tx-1");
        assert!(tpc.list_in_flight().is_empty());
    }

    #[test]
    fn test_sequential_transactions() {
        let mut tpc = protocol();
        tpc.begin("tx-1");
        tpc.deliver_all();
        tpc.set_vote("cohort-0", false);
        tpc.begin("tx-2");
        tpc.deliver_all();

        assert_eq!(tpc.stats().coordinator, TxnState::Aborted);
        assert_eq!(tpc.node("cohort-2").unwrap().txn.as_deref(), Some("tx-2"));
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut tpc = protocol();
        tpc.set_vote("cohort-0", false);
        tpc.begin("tx-1");
        tpc.tick();
        tpc.reset();
        assert_eq!(tpc, protocol());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut tpc = protocol();
        tpc.begin("tx-1");
        let id = tpc.list_in_flight()[0];

        tpc.deliver(id);
        let after_first = tpc.clone();
        tpc.deliver(id);
        assert_eq!(tpc, after_first);
    }
}
