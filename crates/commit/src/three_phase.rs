//! Three-phase commit.
//!
//! ```text
//! coordinator ──CanCommit──▶ cohorts ──Vote──▶ coordinator
//!             ──PreCommit──▶ cohorts ──Ack───▶ coordinator
//!             ──DoCommit───▶ cohorts
//! ```
//!
//! Cohorts time out independently: one still `Prepared` aborts, one already
//! `PreCommitted` commits. Nobody blocks on a failed coordinator.

use crate::node::{initial_nodes, CommitConfig, CommitNode, CommitStats, TxnState, COORDINATOR};
use distlab_core::{
    Health, Message, MessageId, MessagePool, ParticipantId, ParticipantRegistry, Payload,
    ProtocolStateMachine,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Three-phase commit messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreePhaseMessage {
    CanCommit { txn: String },
    Vote { txn: String, yes: bool },
    PreCommit { txn: String },
    Ack { txn: String },
    DoCommit { txn: String },
    Abort { txn: String },
}

impl Payload for ThreePhaseMessage {
    fn type_name(&self) -> &'static str {
        match self {
            ThreePhaseMessage::CanCommit { .. } => "CanCommit",
            ThreePhaseMessage::Vote { .. } => "Vote",
            ThreePhaseMessage::PreCommit { .. } => "PreCommit",
            ThreePhaseMessage::Ack { .. } => "Ack",
            ThreePhaseMessage::DoCommit { .. } => "DoCommit",
            ThreePhaseMessage::Abort { .. } => "Abort",
        }
    }
}

/// Three-phase commit between one coordinator and its cohorts.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreePhaseCommit {
    config: CommitConfig,
    nodes: ParticipantRegistry<CommitNode>,
    pool: MessagePool<ThreePhaseMessage>,
    votes: BTreeMap<ParticipantId, bool>,
    acks: BTreeSet<ParticipantId>,
    ticks: u64,
    now: Duration,
}

impl ThreePhaseCommit {
    pub fn new(config: CommitConfig) -> Self {
        Self {
            nodes: initial_nodes(&config),
            config,
            pool: MessagePool::new(),
            votes: BTreeMap::new(),
            acks: BTreeSet::new(),
            ticks: 0,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&CommitNode> {
        self.nodes.get(id)
    }

    fn broadcast(&mut self, message: ThreePhaseMessage) {
        let coordinator = ParticipantId::from(COORDINATOR);
        let cohorts: Vec<ParticipantId> = self
            .nodes
            .iter()
            .filter(|n| !n.is_coordinator())
            .map(|n| n.id.clone())
            .collect();
        for cohort in cohorts {
            self.pool
                .send(&coordinator, &cohort, message.clone(), self.now);
        }
    }

    fn reply(&mut self, from: &ParticipantId, message: ThreePhaseMessage) {
        self.pool
            .send(from, &ParticipantId::from(COORDINATOR), message, self.now);
    }

    /// Set how a cohort votes on the next `CanCommit`.
    pub fn set_vote(&mut self, cohort: &str, yes: bool) {
        if let Some(node) = self.nodes.get_mut(cohort) {
            if !node.is_coordinator() {
                node.vote_yes = yes;
            }
        }
    }

    /// Start a transaction. No-op if the coordinator is failed or busy.
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
        if matches!(coordinator.state, TxnState::Waiting | TxnState::PreCommitted) {
            debug!(txn = %txn, "Coordinator busy, transaction not started");
            return;
        }
        coordinator.txn = Some(txn.clone());
        coordinator.enter(TxnState::Waiting, tick);
        self.votes.clear();
        self.acks.clear();

        info!(txn = %txn, "Beginning three-phase commit");
        self.broadcast(ThreePhaseMessage::CanCommit { txn });
    }

    fn coordinator_txn(&self, state: TxnState) -> Option<String> {
        self.nodes
            .get(COORDINATOR)
            .filter(|c| c.state == state)
            .and_then(|c| c.txn.clone())
    }

    fn coordinator_enter(&mut self, state: TxnState) {
        let tick = self.ticks;
        if let Some(coordinator) = self.nodes.get_mut(COORDINATOR) {
            coordinator.enter(state, tick);
        }
    }

    fn abort(&mut self, txn: String) {
        info!(txn = %txn, "Coordinator aborting");
        self.coordinator_enter(TxnState::Aborted);
        self.broadcast(ThreePhaseMessage::Abort { txn });
    }

    fn commit(&mut self, txn: String) {
        info!(txn = %txn, acks = self.acks.len(), "Coordinator committing");
        self.coordinator_enter(TxnState::Committed);
        self.broadcast(ThreePhaseMessage::DoCommit { txn });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Coordinator handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_vote(&mut self, from: ParticipantId, txn: String, yes: bool) {
        if self.coordinator_txn(TxnState::Waiting).as_deref() != Some(txn.as_str()) {
            return;
        }
        self.votes.insert(from, yes);

        if !yes {
            self.abort(txn);
        } else if self.votes.len() == self.config.cohorts && self.votes.values().all(|v| *v) {
            debug!(txn = %txn, "All cohorts voted yes, pre-committing");
            self.coordinator_enter(TxnState::PreCommitted);
            self.broadcast(ThreePhaseMessage::PreCommit { txn });
        }
    }

    fn on_ack(&mut self, from: ParticipantId, txn: String) {
        if self.coordinator_txn(TxnState::PreCommitted).as_deref() != Some(txn.as_str()) {
            return;
        }
        self.acks.insert(from);
        if self.acks.len() == self.config.cohorts {
            self.commit(txn);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cohort handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_can_commit(&mut self, to: &ParticipantId, txn: String) {
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
        self.reply(to, ThreePhaseMessage::Vote { txn, yes });
    }

    fn on_pre_commit(&mut self, to: &ParticipantId, txn: String) {
        let tick = self.ticks;
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        if !node.is_for(&txn) || node.state != TxnState::Prepared {
            return;
        }
        node.enter(TxnState::PreCommitted, tick);
        self.reply(to, ThreePhaseMessage::Ack { txn });
    }

    fn on_final(&mut self, to: &ParticipantId, txn: &str, state: TxnState) {
        let tick = self.ticks;
        if let Some(node) = self.nodes.get_mut(to) {
            if node.is_for(txn) && !node.state.is_final() {
                node.enter(state, tick);
            }
        }
    }
}

impl ProtocolStateMachine for ThreePhaseCommit {
    type Participant = CommitNode;
    type Payload = ThreePhaseMessage;
    type Stats = CommitStats;

    fn name(&self) -> &'static str {
        "three-phase-commit"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<CommitNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<ThreePhaseMessage>> {
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
            ThreePhaseMessage::CanCommit { txn } => self.on_can_commit(&to, txn),
            ThreePhaseMessage::Vote { txn, yes } => self.on_vote(from, txn, yes),
            ThreePhaseMessage::PreCommit { txn } => self.on_pre_commit(&to, txn),
            ThreePhaseMessage::Ack { txn } => self.on_ack(from, txn),
            ThreePhaseMessage::DoCommit { txn } => self.on_final(&to, &txn, TxnState::Committed),
            ThreePhaseMessage::Abort { txn } => self.on_final(&to, &txn, TxnState::Aborted),
        }
    }

    /// Timeouts, for healthy participants only:
    /// - coordinator waiting on votes aborts
    /// - coordinator waiting on acks commits
    /// - cohort `Prepared` aborts, cohort `PreCommitted` commits
    fn tick(&mut self) {
        self.now += self.config.tick_interval;
        self.ticks += 1;
        let (tick, timeout) = (self.ticks, self.config.timeout_ticks);

        let coordinator = self
            .nodes
            .get(COORDINATOR)
            .filter(|c| c.health.is_healthy() && c.timed_out(tick, timeout))
            .and_then(|c| c.txn.clone().map(|txn| (c.state, txn)));
        match coordinator {
            Some((TxnState::Waiting, txn)) => self.abort(txn),
            Some((TxnState::PreCommitted, txn)) => self.commit(txn),
            _ => {}
        }

        for node in self.nodes.iter_mut() {
            if node.is_coordinator() || !node.health.is_healthy() || !node.timed_out(tick, timeout) {
                continue;
            }
            let next = match node.state {
                TxnState::Prepared => TxnState::Aborted,
                TxnState::PreCommitted => TxnState::Committed,
                _ => continue,
            };
            debug!(cohort = %node.id, from = ?node.state, to = ?next, "Cohort timed out");
            node.enter(next, tick);
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
