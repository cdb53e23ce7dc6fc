//! Single-decree Paxos.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine, VoteTracker,
};
use distlab_types::has_majority;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for a [`PaxosCluster`].
#[derive(Debug, Clone, PartialEq)]
pub struct PaxosConfig {
    pub node_count: usize,
    pub tick_interval: Duration,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl PaxosConfig {
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ..Default::default()
        }
    }
}

/// Proposal number, unique per proposer.
///
/// Ordered by round first, then proposer index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProposalNumber {
    pub round: u64,
    pub proposer: usize,
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.proposer)
    }
}

/// Where a proposer's current proposal stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalPhase {
    /// Waiting for a majority of promises.
    Preparing,
    /// Waiting for a majority of accepts.
    Accepting,
    Chosen,
}

/// A proposer's in-progress proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub number: ProposalNumber,
    /// The value this proposer wants chosen.
    pub own_value: String,
    /// Value sent in `Accept`, fixed once the prepare phase completes.
    pub value: Option<String>,
    pub phase: ProposalPhase,
    /// Highest accepted proposal reported by promisers.
    pub highest_accepted: Option<(ProposalNumber, String)>,
}

/// A Paxos node: proposer, acceptor and learner.
#[derive(Debug, Clone, PartialEq)]
pub struct PaxosNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    /// Index in the cluster, used in proposal numbers.
    pub index: usize,

    /// Acceptor: highest proposal promised.
    pub promised: Option<ProposalNumber>,
    /// Acceptor: highest proposal accepted, with its value.
    pub accepted: Option<(ProposalNumber, String)>,

    /// Proposer: last round used.
    pub round: u64,
    /// Proposer: current proposal.
    pub proposal: Option<Proposal>,

    /// Learner: the chosen value, once known.
    pub chosen: Option<String>,
}

impl_participant!(PaxosNode);

impl PaxosNode {
    fn new(index: usize, count: usize) -> Self {
        Self {
            id: ParticipantId::indexed("node", index),
            health: Health::Healthy,
            position: Position::on_ring(index, count, 200.0),
            index,
            promised: None,
            accepted: None,
            round: 0,
            proposal: None,
            chosen: None,
        }
    }

    /// Promise `n` if it is higher than anything promised. Returns the
    /// previously accepted proposal on success.
    fn promise(&mut self, n: ProposalNumber) -> Option<Option<(ProposalNumber, String)>> {
        if self.promised.is_some_and(|p| n <= p) {
            return None;
        }
        self.promised = Some(n);
        Some(self.accepted.clone())
    }

    /// Accept `(n, value)` unless a higher proposal was promised.
    fn accept(&mut self, n: ProposalNumber, value: &str) -> bool {
        if self.promised.is_some_and(|p| n < p) {
            return false;
        }
        self.promised = Some(n);
        self.accepted = Some((n, value.to_string()));
        true
    }
}

/// Paxos messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PaxosMessage {
    Prepare {
        number: ProposalNumber,
    },
    Promise {
        number: ProposalNumber,
        accepted: Option<(ProposalNumber, String)>,
    },
    Accept {
        number: ProposalNumber,
        value: String,
    },
    Accepted {
        number: ProposalNumber,
    },
    /// Learner notification once a proposer sees a majority of accepts.
    Chosen {
        value: String,
    },
}

impl Payload for PaxosMessage {
    fn type_name(&self) -> &'static str {
        match self {
            PaxosMessage::Prepare { .. } => "Prepare",
            PaxosMessage::Promise { .. } => "Promise",
            PaxosMessage::Accept { .. } => "Accept",
            PaxosMessage::Accepted { .. } => "Accepted",
            PaxosMessage::Chosen { .. } => "Chosen",
        }
    }
}

/// Observable summary of a Paxos cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaxosStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub chosen: Option<String>,
    /// Nodes that learned the chosen value.
    pub learned: usize,
    pub highest_promised: Option<ProposalNumber>,
}

/// A single-decree Paxos cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct PaxosCluster {
    config: PaxosConfig,
    nodes: ParticipantRegistry<PaxosNode>,
    pool: MessagePool<PaxosMessage>,
    /// Promises and accepts per proposal, keyed by proposal number.
    promises: VoteTracker<ProposalNumber>,
    accepts: VoteTracker<ProposalNumber>,
    now: Duration,
}

impl PaxosCluster {
    pub fn new(config: PaxosConfig) -> Self {
        let count = config.node_count;
        Self {
            nodes: ParticipantRegistry::from_participants((0..count).map(|i| PaxosNode::new(i, count))),
            config,
            pool: MessagePool::new(),
            promises: VoteTracker::new(),
            accepts: VoteTracker::new(),
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&PaxosNode> {
        self.nodes.get(id)
    }

    /// Values chosen by any proposer. More than one entry would be a safety
    /// violation.
    pub fn chosen_values(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|n| n.chosen.clone())
            .collect();
        values.sort();
        values.dedup();
        values
    }

    fn is_majority(&self, votes: usize) -> bool {
        has_majority(votes, self.nodes.len())
    }

    fn broadcast(&mut self, from: &ParticipantId, message: PaxosMessage) {
        for peer in self.nodes.ids() {
            if peer != *from {
                self.pool.send(from, &peer, message.clone(), self.now);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposer
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a new proposal for `value` at `proposer`.
    ///
    /// The proposer promises to itself locally, then sends `Prepare` to every
    /// other acceptor. No-op for unknown or failed nodes.
    pub fn propose(&mut self, proposer: &str, value: impl Into<String>) {
        if !self.nodes.is_available(proposer) {
            debug!(node = proposer, "Ignoring proposal on unavailable node");
            return;
        }
        let Some(node) = self.nodes.get_mut(proposer) else {
            return;
        };
        node.round += 1;
        let number = ProposalNumber {
            round: node.round,
            proposer: node.index,
        };
        node.proposal = Some(Proposal {
            number,
            own_value: value.into(),
            value: None,
            phase: ProposalPhase::Preparing,
            highest_accepted: None,
        });
        let id = node.id.clone();
        info!(proposer = %id, number = %number, "Proposing");

        self.broadcast(&id, PaxosMessage::Prepare { number });

        // Local acceptor.
        let local = self
            .nodes
            .get_mut(proposer)
            .and_then(|node| node.promise(number));
        if let Some(accepted) = local {
            self.on_promise(&id, id.clone(), number, accepted);
        }
    }

    fn on_promise(
        &mut self,
        to: &ParticipantId,
        from: ParticipantId,
        number: ProposalNumber,
        accepted: Option<(ProposalNumber, String)>,
    ) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        let Some(proposal) = node.proposal.as_mut() else {
            return;
        };
        if proposal.number != number || proposal.phase != ProposalPhase::Preparing {
            return;
        }
        if let Some((n, v)) = accepted {
            let higher = proposal
                .highest_accepted
                .as_ref()
                .map_or(true, |(current, _)| *current < n);
            if higher {
                proposal.highest_accepted = Some((n, v));
            }
        }

        self.promises.add_vote(number, from);
        if self.is_majority(self.promises.count(&number)) {
            self.start_accept(to, number);
        }
    }

    fn start_accept(&mut self, proposer: &ParticipantId, number: ProposalNumber) {
        let Some(node) = self.nodes.get_mut(proposer) else {
            return;
        };
        let Some(proposal) = node.proposal.as_mut() else {
            return;
        };
        let value = proposal
            .highest_accepted
            .as_ref()
            .map_or_else(|| proposal.own_value.clone(), |(_, v)| v.clone());
        proposal.value = Some(value.clone());
        proposal.phase = ProposalPhase::Accepting;
        debug!(proposer = %proposer, number = %number, value = %value, "Promised by majority");

        self.broadcast(
            proposer,
            PaxosMessage::Accept {
                number,
                value: value.clone(),
            },
        );

        let accepted_locally = self
            .nodes
            .get_mut(proposer)
            .is_some_and(|node| node.accept(number, &value));
        if accepted_locally {
            self.on_accepted(proposer, proposer.clone(), number);
        }
    }

    fn on_accepted(&mut self, to: &ParticipantId, from: ParticipantId, number: ProposalNumber) {
        let is_current = self
            .nodes
            .get(to)
            .and_then(|n| n.proposal.as_ref())
            .is_some_and(|p| p.number == number && p.phase == ProposalPhase::Accepting);
        if !is_current {
            return;
        }

        self.accepts.add_vote(number, from);
        if !self.is_majority(self.accepts.count(&number)) {
            return;
        }

        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        let Some(proposal) = node.proposal.as_mut() else {
            return;
        };
        proposal.phase = ProposalPhase::Chosen;
        let Some(value) = proposal.value.clone() else {
            return;
        };
        node.chosen = Some(value.clone());
        info!(proposer = %to, number = %number, value = %value, "Value chosen");
        self.broadcast(to, PaxosMessage::Chosen { value });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Acceptor / learner
    // ═══════════════════════════════════════════════════════════════════════

    fn on_prepare(&mut self, to: &ParticipantId, from: &ParticipantId, number: ProposalNumber) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        match node.promise(number) {
            Some(accepted) => {
                trace!(acceptor = %to, number = %number, "Promised");
                self.pool.send(
                    to,
                    from,
                    PaxosMessage::Promise { number, accepted },
                    self.now,
                );
            }
            None => trace!(acceptor = %to, number = %number, "Prepare rejected"),
        }
    }

    fn on_accept(&mut self, to: &ParticipantId, from: &ParticipantId, number: ProposalNumber, value: &str) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        if node.accept(number, value) {
            trace!(acceptor = %to, number = %number, "Accepted");
            self.pool
                .send(to, from, PaxosMessage::Accepted { number }, self.now);
        } else {
            trace!(acceptor = %to, number = %number, "Accept rejected");
        }
    }
}

impl ProtocolStateMachine for PaxosCluster {
    type Participant = PaxosNode;
    type Payload = PaxosMessage;
    type Stats = PaxosStats;

    fn name(&self) -> &'static str {
        "paxos"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<PaxosNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<PaxosMessage>> {
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
            PaxosMessage::Prepare { number } => self.on_prepare(&to, &from, number),
            PaxosMessage::Promise { number, accepted } => {
                self.on_promise(&to, from, number, accepted)
            }
            PaxosMessage::Accept { number, value } => self.on_accept(&to, &from, number, &value),
            PaxosMessage::Accepted { number } => self.on_accepted(&to, from, number),
            PaxosMessage::Chosen { value } => {
                if let Some(node) = self.nodes.get_mut(&to) {
                    node.chosen = Some(value);
                }
            }
        }
    }

    fn tick(&mut self) {
        self.now += self.config.tick_interval;
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

    fn stats(&self) -> PaxosStats {
        PaxosStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            chosen: self.chosen_values().into_iter().next(),
            learned: self.nodes.iter().filter(|n| n.chosen.is_some()).count(),
            highest_promised: self.nodes.iter().filter_map(|n| n.promised).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn cluster() -> PaxosCluster {
        PaxosCluster::new(PaxosConfig::default())
    }

    #[traced_test]
    #[test]
    fn test_single_proposer_chooses_value() {
        let mut cluster = cluster();
        cluster.propose("node-0", "blue");
        assert_eq!(cluster.list_in_flight().len(), 4);

        cluster.deliver_all();
        let stats = cluster.stats();
        assert_eq!(stats.chosen.as_deref(), Some("blue"));
        assert_eq!(stats.learned, 5);
        assert!(logs_contain("Value chosen"));
    }

    #[test]
    fn test_proposal_numbers_are_unique_and_ordered() {
        let mut cluster = cluster();
        cluster.propose("node-1", "a");
        cluster.propose("node-0", "b");
        cluster.propose("node-0", "c");

        let n1 = cluster.node("node-1").unwrap().proposal.as_ref().unwrap().number;
        let n0 = cluster.node("node-0").unwrap().proposal.as_ref().unwrap().number;
        assert_eq!(n1, ProposalNumber { round: 1, proposer: 1 });
        assert_eq!(n0, ProposalNumber { round: 2, proposer: 0 });
        assert!(n0 > n1);
    }

    #[test]
    fn test_later_proposal_adopts_chosen_value() {
        let mut cluster = cluster();
        cluster.propose("node-0", "blue");
        cluster.deliver_all();

        cluster.propose("node-4", "red");
        cluster.deliver_all();

        assert_eq!(cluster.chosen_values(), vec!["blue".to_string()]);
        let proposal = cluster.node("node-4").unwrap().proposal.clone().unwrap();
        assert_eq!(proposal.value.as_deref(), Some("blue"));
    }

    #[test]
    fn test_competing_proposers_agree() {
        let mut cluster = cluster();
        cluster.propose("node-0", "blue");
        cluster.propose("node-4", "red");
        cluster.deliver_all();
        cluster.propose("node-2", "green");
        cluster.deliver_all();

        assert!(cluster.chosen_values().len() <= 1);
    }

    #[test]
    fn test_stale_prepare_is_rejected_silently() {
        let mut cluster = cluster();
        cluster.propose("node-4", "red");
        cluster.propose("node-4", "red");
        cluster.deliver_all();
        let promised = cluster.node("node-1").unwrap().promised;

        cluster.propose("node-0", "blue");
        let prepares = cluster.list_in_flight();
        for id in prepares {
            cluster.deliver(id);
        }
        // node-0's round 1 is lower than node-4's round 2: no promises back.
        assert!(cluster.list_in_flight().is_empty());
        assert_eq!(cluster.node("node-1").unwrap().promised, promised);
    }

    #[test]
    fn test_minority_cannot_choose() {
        let mut cluster = cluster();
        cluster.fail_node("node-2");
        cluster.fail_node("node-3");
        cluster.fail_node("node-4");
        cluster.propose("node-0", "blue");
        cluster.deliver_all();
        assert!(cluster.chosen_values().is_empty());

        let proposal = cluster.node("node-0").unwrap().proposal.clone().unwrap();
        assert_eq!(proposal.phase, ProposalPhase::Preparing);
    }

    #[test]
    fn test_majority_survives_failures() {
        let mut cluster = cluster();
        cluster.fail_node("node-3");
        cluster.fail_node("node-4");
        cluster.propose("node-0", "blue");
        cluster.deliver_all();
        assert_eq!(cluster.stats().chosen.as_deref(), Some("blue"));
        assert_eq!(cluster.stats().learned, 3);
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut cluster = cluster();
        cluster.propose("node-0", "blue");
        cluster.deliver_all();
        cluster.reset();
        assert_eq!(cluster, PaxosCluster::new(PaxosConfig::default()));
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut cluster = cluster();
        cluster.propose("node-0", "blue");
        let id = cluster.list_in_flight()[0];

        cluster.deliver(id);
        let after_first = cluster.clone();
        cluster.deliver(id);
        assert_eq!(cluster, after_first);
    }
}
