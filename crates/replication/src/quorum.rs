//! Leaderless quorum replication.
//!
//! Each key lives on `replication_factor` consecutive nodes starting at the
//! key's hash modulo the node count (its preference list). Any node may
//! coordinate a request. Writes are durable after `write_quorum` acks and
//! reads return the newest of the first `read_quorum` responses, repairing
//! responders that returned an older version.

use crate::error::QuorumConfigError;
use crate::versioned::{apply_newer, Store, Versioned};
use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use distlab_types::Hash;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Identifier of one client request, unique per model instance.
pub type RequestId = u64;

/// Configuration for [`QuorumReplication`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumConfig {
    /// Number of nodes, named `node-0` onwards.
    pub nodes: usize,

    /// Replicas per key (RF).
    pub replication_factor: usize,

    /// Acks needed before a write is durable (W).
    pub write_quorum: usize,

    /// Responses needed before a read completes (R).
    pub read_quorum: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            replication_factor: 3,
            write_quorum: 2,
            read_quorum: 2,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl QuorumConfig {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_write_quorum(mut self, w: usize) -> Self {
        self.write_quorum = w;
        self
    }

    pub fn with_read_quorum(mut self, r: usize) -> Self {
        self.read_quorum = r;
        self
    }

    /// Check that RF fits the cluster and both quorums fit RF.
    pub fn validate(&self) -> Result<(), QuorumConfigError> {
        let rf = self.replication_factor;
        if rf == 0 || rf > self.nodes {
            return Err(QuorumConfigError::ReplicationFactorTooLarge {
                replication_factor: rf,
                nodes: self.nodes,
            });
        }
        if self.write_quorum == 0 || self.write_quorum > rf {
            return Err(QuorumConfigError::WriteQuorum {
                w: self.write_quorum,
                replication_factor: rf,
            });
        }
        if self.read_quorum == 0 || self.read_quorum > rf {
            return Err(QuorumConfigError::ReadQuorum {
                r: self.read_quorum,
                replication_factor: rf,
            });
        }
        Ok(())
    }

    /// Whether every read quorum overlaps every write quorum (R + W > RF).
    pub fn is_strongly_consistent(&self) -> bool {
        self.read_quorum + self.write_quorum > self.replication_factor
    }
}

/// Quorum replication messages.
#[derive(Debug, Clone, PartialEq)]
pub enum QuorumMessage {
    Replicate {
        request: RequestId,
        key: String,
        value: Versioned,
    },
    WriteAck {
        request: RequestId,
    },
    Read {
        request: RequestId,
        key: String,
    },
    ReadResponse {
        request: RequestId,
        value: Option<Versioned>,
    },
    ReadRepair {
        key: String,
        value: Versioned,
    },
}

impl Payload for QuorumMessage {
    fn type_name(&self) -> &'static str {
        match self {
            QuorumMessage::Replicate { .. } => "Replicate",
            QuorumMessage::WriteAck { .. } => "WriteAck",
            QuorumMessage::Read { .. } => "Read",
            QuorumMessage::ReadResponse { .. } => "ReadResponse",
            QuorumMessage::ReadRepair { .. } => "ReadRepair",
        }
    }
}

/// A storage node.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub store: Store,
    /// Lagging nodes drop `Replicate` messages on the floor.
    pub lagging: bool,
}

impl_participant!(QuorumNode);

#[derive(Debug, Clone, PartialEq)]
struct PendingWrite {
    coordinator: ParticipantId,
    key: String,
    version: u64,
    acks: BTreeSet<ParticipantId>,
    durable: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingRead {
    coordinator: ParticipantId,
    key: String,
    responses: BTreeMap<ParticipantId, Option<Versioned>>,
    /// Set once `read_quorum` responses arrived.
    result: Option<Option<Versioned>>,
}

/// Observable summary of a quorum replication run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuorumStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub writes: usize,
    pub durable_writes: usize,
    pub reads: usize,
    pub completed_reads: usize,
    pub read_repairs: usize,
    pub lagging: Vec<ParticipantId>,
}

/// Dynamo-style replication with tunable read and write quorums.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumReplication {
    config: QuorumConfig,
    nodes: ParticipantRegistry<QuorumNode>,
    pool: MessagePool<QuorumMessage>,
    writes: BTreeMap<RequestId, PendingWrite>,
    reads: BTreeMap<RequestId, PendingRead>,
    next_request: RequestId,
    next_version: u64,
    read_repairs: usize,
    now: Duration,
}

impl QuorumReplication {
    pub fn new(config: QuorumConfig) -> Self {
        let nodes = (0..config.nodes).map(|i| QuorumNode {
            id: ParticipantId::indexed("node", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.nodes, 200.0),
            store: Store::new(),
            lagging: false,
        });

        Self {
            nodes: ParticipantRegistry::from_participants(nodes),
            config,
            pool: MessagePool::new(),
            writes: BTreeMap::new(),
            reads: BTreeMap::new(),
            next_request: 0,
            next_version: 0,
            read_repairs: 0,
            now: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    pub fn node(&self, id: &str) -> Option<&QuorumNode> {
        self.nodes.get(id)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message<QuorumMessage>> {
        self.pool.get(id)
    }

    /// Nodes holding `key`, in order. Failed nodes are not skipped.
    pub fn preference_list(&self, key: &str) -> Vec<ParticipantId> {
        let n = self.nodes.len();
        if n == 0 {
            return Vec::new();
        }
        let start = (Hash::from_bytes(key.as_bytes()).as_u64() % n as u64) as usize;
        (0..self.config.replication_factor.min(n))
            .filter_map(|offset| self.nodes.get_index((start + offset) % n))
            .map(|node| node.id.clone())
            .collect()
    }

    /// Make a node ignore (or stop ignoring) `Replicate` messages.
    pub fn set_lagging(&mut self, id: &str, lagging: bool) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.lagging = lagging;
            debug!(node = id, lagging, "Lagging flag set");
        }
    }

    /// Start a write coordinated by `coordinator`.
    ///
    /// Returns the request id, or `None` if the coordinator is unavailable.
    pub fn write(
        &mut self,
        coordinator: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<RequestId> {
        if !self.nodes.is_available(coordinator) {
            debug!(coordinator, "Coordinator unavailable, write ignored");
            return None;
        }
        let coordinator = ParticipantId::from(coordinator);
        let key = key.into();

        self.next_version += 1;
        let value = Versioned::new(value, self.next_version);
        let request = self.next_request();

        info!(
            request,
            key = %key,
            version = value.version,
            coordinator = %coordinator,
            "Write started"
        );

        for replica in self.preference_list(&key) {
            self.pool.send(
                &coordinator,
                &replica,
                QuorumMessage::Replicate {
                    request,
                    key: key.clone(),
                    value: value.clone(),
                },
                self.now,
            );
        }

        self.writes.insert(
            request,
            PendingWrite {
                coordinator,
                key,
                version: value.version,
                acks: BTreeSet::new(),
                durable: false,
            },
        );
        Some(request)
    }

    /// Start a read coordinated by `coordinator`.
    ///
    /// Returns the request id, or `None` if the coordinator is unavailable.
    pub fn read(&mut self, coordinator: &str, key: impl Into<String>) -> Option<RequestId> {
        if !self.nodes.is_available(coordinator) {
            debug!(coordinator, "Coordinator unavailable, read ignored");
            return None;
        }
        let coordinator = ParticipantId::from(coordinator);
        let key = key.into();
        let request = self.next_request();

        debug!(request, key = %key, coordinator = %coordinator, "Read started");

        for replica in self.preference_list(&key) {
            self.pool.send(
                &coordinator,
                &replica,
                QuorumMessage::Read {
                    request,
                    key: key.clone(),
                },
                self.now,
            );
        }

        self.reads.insert(
            request,
            PendingRead {
                coordinator,
                key,
                responses: BTreeMap::new(),
                result: None,
            },
        );
        Some(request)
    }

    /// Whether a write has reached its write quorum.
    pub fn is_durable(&self, request: RequestId) -> bool {
        self.writes.get(&request).is_some_and(|w| w.durable)
    }

    /// Acks received for a write so far.
    pub fn write_acks(&self, request: RequestId) -> usize {
        self.writes.get(&request).map_or(0, |w| w.acks.len())
    }

    /// Result of a completed read: `Some(None)` means the key was absent on
    /// every responder. `None` while the read is still waiting.
    pub fn read_result(&self, request: RequestId) -> Option<Option<&Versioned>> {
        self.reads
            .get(&request)
            .and_then(|r| r.result.as_ref())
            .map(Option::as_ref)
    }

    fn next_request(&mut self) -> RequestId {
        let request = self.next_request;
        self.next_request += 1;
        request
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_replicate(
        &mut self,
        from: ParticipantId,
        to: ParticipantId,
        request: RequestId,
        key: String,
        value: Versioned,
    ) {
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if node.lagging {
            trace!(node = %to, request, "Lagging replica ignored replicate");
            return;
        }
        apply_newer(&mut node.store, &key, &value);
        self.pool
            .send(&to, &from, QuorumMessage::WriteAck { request }, self.now);
    }

    fn on_write_ack(&mut self, from: ParticipantId, request: RequestId) {
        let w = self.config.write_quorum;
        let Some(write) = self.writes.get_mut(&request) else {
            return;
        };
        write.acks.insert(from);
        if !write.durable && write.acks.len() >= w {
            write.durable = true;
            info!(
                request,
                key = %write.key,
                version = write.version,
                coordinator = %write.coordinator,
                acks = write.acks.len(),
                "Write durable"
            );
        }
    }

    fn on_read(&mut self, from: ParticipantId, to: ParticipantId, request: RequestId, key: String) {
        let Some(node) = self.nodes.get(&to) else {
            return;
        };
        let value = node.store.get(&key).cloned();
        self.pool.send(
            &to,
            &from,
            QuorumMessage::ReadResponse { request, value },
            self.now,
        );
    }

    fn on_read_response(
        &mut self,
        from: ParticipantId,
        request: RequestId,
        value: Option<Versioned>,
    ) {
        let r = self.config.read_quorum;
        let Some(read) = self.reads.get_mut(&request) else {
            return;
        };
        read.responses.insert(from.clone(), value.clone());

        let mut stale = Vec::new();
        if read.result.is_none() {
            if read.responses.len() < r {
                return;
            }
            let newest = read
                .responses
                .values()
                .flatten()
                .max_by_key(|v| v.version)
                .cloned();
            debug!(
                request,
                key = %read.key,
                version = newest.as_ref().map(|v| v.version),
                "Read complete"
            );
            read.result = Some(newest);
            stale.extend(read.responses.iter().map(|(id, v)| (id.clone(), v.clone())));
        } else {
            // Late responder: repair against the result already returned.
            stale.push((from, value));
        }

        let Some(Some(newest)) = read.result.clone() else {
            return;
        };
        let coordinator = read.coordinator.clone();
        let key = read.key.clone();

        for (replica, held) in stale {
            if held.map_or(true, |v| v.version < newest.version) {
                debug!(request, replica = %replica, key = %key, "Sending read repair");
                self.read_repairs += 1;
                self.pool.send(
                    &coordinator,
                    &replica,
                    QuorumMessage::ReadRepair {
                        key: key.clone(),
                        value: newest.clone(),
                    },
                    self.now,
                );
            }
        }
    }

    fn on_read_repair(&mut self, to: ParticipantId, key: String, value: Versioned) {
        if let Some(node) = self.nodes.get_mut(&to) {
            if apply_newer(&mut node.store, &key, &value) {
                info!(node = %to, key = %key, version = value.version, "Read repair applied");
            }
        }
    }
}

impl ProtocolStateMachine for QuorumReplication {
    type Participant = QuorumNode;
    type Payload = QuorumMessage;
    type Stats = QuorumStats;

    fn name(&self) -> &'static str {
        "quorum"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<QuorumNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<QuorumMessage>> {
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
            QuorumMessage::Replicate {
                request,
                key,
                value,
            } => self.on_replicate(from, to, request, key, value),
            QuorumMessage::WriteAck { request } => self.on_write_ack(from, request),
            QuorumMessage::Read { request, key } => self.on_read(from, to, request, key),
            QuorumMessage::ReadResponse { request, value } => {
                self.on_read_response(from, request, value)
            }
            QuorumMessage::ReadRepair { key, value } => self.on_read_repair(to, key, value),
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

    fn stats(&self) -> QuorumStats {
        QuorumStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            writes: self.writes.len(),
            durable_writes: self.writes.values().filter(|w| w.durable).count(),
            reads: self.reads.len(),
            completed_reads: self.reads.values().filter(|r| r.result.is_some()).count(),
            read_repairs: self.read_repairs,
            lagging: self
                .nodes
                .iter()
                .filter(|n| n.lagging)
                .map(|n| n.id.clone())
                .collect(),
        }
    }
}
