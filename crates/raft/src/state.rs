//! Raft cluster state machine.

use crate::{LogEntry, RaftConfig, RaftMessage, RaftNode, Role};
use distlab_core::{
    Health, HealthStats, Message, MessageId, MessagePool, MessageStats, ParticipantId,
    ParticipantRegistry, Partitions, Position, ProtocolStateMachine,
};
use distlab_types::{has_majority, Term};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Observable summary of a Raft cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaftStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    /// Highest term seen by any node.
    pub term: Term,
    /// Healthy leader of the highest term that has one.
    pub leader: Option<ParticipantId>,
    /// Nodes currently in the leader role, failed ones included.
    pub leader_count: usize,
    /// Highest commit index on any node.
    pub committed: usize,
}

/// A Raft cluster: nodes, in-flight messages and partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftCluster {
    config: RaftConfig,
    nodes: ParticipantRegistry<RaftNode>,
    pool: MessagePool<RaftMessage>,
    partitions: Partitions,
    now: Duration,
}

impl RaftCluster {
    /// Create a cluster of followers at term 0.
    pub fn new(config: RaftConfig) -> Self {
        let nodes = ParticipantRegistry::from_participants(Self::initial_nodes(&config));
        Self {
            config,
            nodes,
            pool: MessagePool::new(),
            partitions: Partitions::none(),
            now: Duration::ZERO,
        }
    }

    fn initial_nodes(config: &RaftConfig) -> Vec<RaftNode> {
        (0..config.node_count)
            .map(|i| {
                RaftNode::new(
                    ParticipantId::indexed(&config.id_prefix, i),
                    Position::on_ring(i, config.node_count, 200.0),
                )
            })
            .collect()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Look up a node.
    pub fn node(&self, id: &str) -> Option<&RaftNode> {
        self.nodes.get(id)
    }

    /// Look up an in-flight or resolved message.
    pub fn message(&self, id: MessageId) -> Option<&Message<RaftMessage>> {
        self.pool.get(id)
    }

    /// In-flight message ids whose payload has the given type tag.
    pub fn in_flight_of_type(&self, type_name: &str) -> Vec<MessageId> {
        self.pool
            .in_flight()
            .filter(|m| m.type_name() == type_name)
            .map(|m| m.id)
            .collect()
    }

    /// Every node currently in the leader role, with its term.
    pub fn leaders(&self) -> Vec<(Term, ParticipantId)> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader())
            .map(|n| (n.term, n.id.clone()))
            .collect()
    }

    fn healthy_count(&self) -> usize {
        self.nodes.available_count()
    }

    fn send(&mut self, from: &ParticipantId, to: &ParticipantId, message: RaftMessage) {
        self.pool.send(from, to, message, self.now);
    }

    /// Ids of healthy nodes other than `id`.
    fn healthy_peers(&self, id: &str) -> Vec<ParticipantId> {
        self.nodes
            .available_ids()
            .into_iter()
            .filter(|peer| peer != id)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Elections
    // ═══════════════════════════════════════════════════════════════════════

    /// Make `id` a candidate for the next term and request votes.
    ///
    /// No-op for unknown or failed nodes.
    pub fn start_election(&mut self, id: &str) {
        if !self.nodes.is_available(id) {
            debug!(node = id, "Ignoring election on unavailable node");
            return;
        }
        let healthy = self.healthy_count();
        let peers = self.healthy_peers(id);

        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let term = node.term.next();
        node.adopt_term(term);
        node.role = Role::Candidate;
        node.voted_for = Some(node.id.clone());
        node.votes.insert(node.id.clone());

        let candidate = node.id.clone();
        let request = RaftMessage::RequestVote {
            term,
            candidate: candidate.clone(),
            last_log_index: node.last_log_index(),
        };

        info!(node = %candidate, term = term.0, "Starting election");

        for peer in &peers {
            self.send(&candidate, peer, request.clone());
        }

        // A lone healthy node wins with its own vote.
        if has_majority(1, healthy) {
            self.become_leader(&candidate);
        }
    }

    fn on_request_vote(
        &mut self,
        to: &ParticipantId,
        term: Term,
        candidate: ParticipantId,
        last_log_index: usize,
    ) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        if term > node.term {
            node.adopt_term(term);
        }

        let vote_free = node
            .voted_for
            .as_ref()
            .map_or(true, |voted| *voted == candidate);
        let granted = term == node.term && vote_free;
        if granted {
            node.voted_for = Some(candidate.clone());
        }

        trace!(
            voter = %to,
            candidate = %candidate,
            term = term.0,
            last_log_index,
            granted,
            "Vote decided"
        );

        let response = RaftMessage::VoteResponse {
            term: node.term,
            granted,
        };
        self.send(to, &candidate, response);
    }

    fn on_vote_response(&mut self, to: &ParticipantId, from: ParticipantId, term: Term, granted: bool) {
        let healthy = self.healthy_count();
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };

        if term > node.term {
            debug!(node = %to, term = term.0, "Higher term in vote response, stepping down");
            node.adopt_term(term);
            return;
        }
        if term != node.term || node.role == Role::Follower || !granted {
            return;
        }

        node.votes.insert(from);
        if node.role == Role::Candidate && has_majority(node.tally(), healthy) {
            self.become_leader(to);
        }
    }

    fn become_leader(&mut self, id: &ParticipantId) {
        let peers: Vec<ParticipantId> = self.nodes.ids().into_iter().filter(|p| p != id).collect();
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.role = Role::Leader;
        node.leader = Some(node.id.clone());
        let next = node.last_log_index() + 1;
        node.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        node.match_index = peers.iter().map(|p| (p.clone(), 0)).collect();

        info!(node = %id, term = node.term.0, tally = node.tally(), "Became leader");
        self.heartbeat(id);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replication
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a command to a healthy leader's log and replicate it.
    ///
    /// No-op unless `leader` is a healthy leader.
    pub fn add_client_request(&mut self, leader: &str, command: impl Into<String>) {
        if !self.nodes.is_available(leader) {
            debug!(node = leader, "Ignoring client request on unavailable node");
            return;
        }
        let Some(node) = self.nodes.get_mut(leader) else {
            return;
        };
        if !node.is_leader() {
            debug!(node = leader, role = ?node.role, "Ignoring client request on non-leader");
            return;
        }
        let entry = LogEntry {
            term: node.term,
            command: command.into(),
        };
        node.log.push(entry);
        let id = node.id.clone();
        debug!(leader = %id, index = node.log.len(), "Appended client request");

        // Single-node cluster commits immediately.
        self.advance_commit(&id);
        self.heartbeat(&id);
    }

    /// Send `AppendEntries` from a healthy leader to every other healthy
    /// node, carrying whatever each follower is missing.
    pub fn heartbeat(&mut self, leader: &str) {
        if !self.nodes.is_available(leader) {
            return;
        }
        let peers = self.healthy_peers(leader);
        let Some(node) = self.nodes.get(leader) else {
            return;
        };
        if !node.is_leader() {
            return;
        }

        let mut outbound = Vec::with_capacity(peers.len());
        for peer in peers {
            let next = node
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(node.log.len() + 1)
                .clamp(1, node.log.len() + 1);
            let prev_log_index = next - 1;
            let message = RaftMessage::AppendEntries {
                term: node.term,
                leader: node.id.clone(),
                prev_log_index,
                prev_log_term: node.term_at(prev_log_index).unwrap_or(Term::ZERO),
                entries: node.log[prev_log_index..].to_vec(),
                leader_commit: node.commit_index,
            };
            outbound.push((peer, message));
        }

        let from = node.id.clone();
        for (peer, message) in outbound {
            self.send(&from, &peer, message);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_entries(
        &mut self,
        to: &ParticipantId,
        term: Term,
        leader: ParticipantId,
        prev_log_index: usize,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: usize,
    ) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        if term < node.term {
            trace!(node = %to, term = term.0, own = node.term.0, "Stale AppendEntries ignored");
            return;
        }
        if term > node.term {
            node.adopt_term(term);
        }
        node.role = Role::Follower;
        node.votes.clear();
        node.leader = Some(leader.clone());

        if node.term_at(prev_log_index) != Some(prev_log_term) {
            trace!(node = %to, prev_log_index, "Log mismatch, rejecting AppendEntries");
            let response = RaftMessage::AppendEntriesResponse {
                term: node.term,
                success: false,
                match_index: node.log.len().min(prev_log_index.saturating_sub(1)),
            };
            self.send(to, &leader, response);
            return;
        }

        let entry_count = entries.len();
        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_log_index + offset + 1;
            match node.term_at(index) {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    node.log.truncate(index - 1);
                    node.log.push(entry);
                }
                None => node.log.push(entry),
            }
        }

        let commit = leader_commit.min(node.log.len());
        if commit > node.commit_index {
            node.commit_index = commit;
        }

        let response = RaftMessage::AppendEntriesResponse {
            term: node.term,
            success: true,
            match_index: prev_log_index + entry_count,
        };
        self.send(to, &leader, response);
    }

    fn on_append_entries_response(
        &mut self,
        to: &ParticipantId,
        from: ParticipantId,
        term: Term,
        success: bool,
        match_index: usize,
    ) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        if term > node.term {
            debug!(node = %to, term = term.0, "Higher term in append response, stepping down");
            node.adopt_term(term);
            return;
        }
        if term != node.term || !node.is_leader() {
            return;
        }

        if success {
            let matched = node.match_index.entry(from.clone()).or_insert(0);
            *matched = (*matched).max(match_index);
            let matched = *matched;
            node.next_index.insert(from, matched + 1);
            self.advance_commit(to);
        } else {
            let next = node.next_index.entry(from).or_insert(1);
            *next = next.saturating_sub(1).min(match_index + 1).max(1);
        }
    }

    /// Commit the highest own-term index replicated on a strict majority of
    /// healthy nodes.
    fn advance_commit(&mut self, leader: &ParticipantId) {
        let healthy: Vec<ParticipantId> = self.nodes.available_ids();
        let Some(node) = self.nodes.get_mut(leader) else {
            return;
        };

        for index in (node.commit_index + 1..=node.log.len()).rev() {
            if node.term_at(index) != Some(node.term) {
                continue;
            }
            let replicated = healthy
                .iter()
                .filter(|id| {
                    *id == leader || node.match_index.get(*id).is_some_and(|m| *m >= index)
                })
                .count();
            if has_majority(replicated, healthy.len()) {
                debug!(leader = %leader, index, "Advanced commit index");
                node.commit_index = index;
                break;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Partitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Split the network. Messages crossing groups are dropped on delivery.
    pub fn partition(&mut self, groups: Vec<Vec<ParticipantId>>) {
        info!(groups = groups.len(), "Partitioning network");
        self.partitions = Partitions::split(groups);
    }

    /// Remove every partition.
    pub fn heal(&mut self) {
        info!("Healing network");
        self.partitions.heal();
    }

    pub fn partitions(&self) -> &Partitions {
        &self.partitions
    }
}

impl ProtocolStateMachine for RaftCluster {
    type Participant = RaftNode;
    type Payload = RaftMessage;
    type Stats = RaftStats;

    fn name(&self) -> &'static str {
        "raft"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<RaftNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<RaftMessage>> {
        self.pool.messages()
    }

    fn list_in_flight(&self) -> Vec<MessageId> {
        self.pool.list_in_flight()
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let partitions = &self.partitions;
        let Some(message) = self.pool.deliver_if(id, |m| {
            nodes.is_available(&m.from)
                && nodes.is_available(&m.to)
                && partitions.can_communicate(&m.from, &m.to)
        }) else {
            return;
        };

        trace!(id = %id, kind = message.type_name(), to = %message.to, "Delivering");
        let Message { from, to, payload, .. } = message;
        match payload {
            RaftMessage::RequestVote {
                term,
                candidate,
                last_log_index,
            } => self.on_request_vote(&to, term, candidate, last_log_index),
            RaftMessage::VoteResponse { term, granted } => {
                self.on_vote_response(&to, from, term, granted)
            }
            RaftMessage::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append_entries(
                &to,
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => self.on_append_entries_response(&to, from, term, success, match_index),
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
        self.nodes.reset(Self::initial_nodes(&self.config));
        self.pool.reset();
        self.partitions = Partitions::none();
        self.now = Duration::ZERO;
    }

    fn stats(&self) -> RaftStats {
        let leaders: BTreeMap<Term, ParticipantId> = self
            .nodes
            .iter()
            .filter(|n| n.is_leader() && n.health.is_healthy())
            .map(|n| (n.term, n.id.clone()))
            .collect();

        RaftStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            term: self.nodes.iter().map(|n| n.term).max().unwrap_or(Term::ZERO),
            leader: leaders.into_values().next_back(),
            leader_count: self.nodes.iter().filter(|n| n.is_leader()).count(),
            committed: self.nodes.iter().map(|n| n.commit_index).max().unwrap_or(0),
        }
    }
}
