//! Chain replication.
//!
//! Nodes form a chain. Writes enter at the head and are forwarded node by
//! node to the tail; the tail acknowledges back up the chain and serves all
//! reads, so a read never observes a write that is not on every node.
//!
//! A failed node is spliced out: its predecessor resends every write it has
//! not yet seen acknowledged to its new successor. A recovered node rejoins
//! as the new tail after copying the old tail's store.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use im::OrdMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for [`ChainReplication`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    /// Chain length, nodes named `node-0` (head) onwards.
    pub nodes: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl ChainConfig {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }
}

/// Chain replication messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainMessage {
    Forward {
        seq: u64,
        key: String,
        value: String,
    },
    Ack {
        seq: u64,
    },
}

impl Payload for ChainMessage {
    fn type_name(&self) -> &'static str {
        match self {
            ChainMessage::Forward { .. } => "Forward",
            ChainMessage::Ack { .. } => "Ack",
        }
    }
}

/// A node in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub store: OrdMap<String, String>,
    /// Writes applied here but not yet acknowledged by the tail, by sequence.
    pub pending: BTreeMap<u64, (String, String)>,
}

impl_participant!(ChainNode);

/// Observable summary of a chain replication run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub chain: Vec<ParticipantId>,
    pub head: Option<ParticipantId>,
    pub tail: Option<ParticipantId>,
    pub writes: u64,
    pub acknowledged: usize,
    /// Writes the head still waits on.
    pub pending: usize,
}

/// Chain replication over a fixed set of nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainReplication {
    config: ChainConfig,
    nodes: ParticipantRegistry<ChainNode>,
    pool: MessagePool<ChainMessage>,
    /// Current chain order, head first.
    chain: Vec<ParticipantId>,
    next_seq: u64,
    acknowledged: usize,
    now: Duration,
}

impl ChainReplication {
    pub fn new(config: ChainConfig) -> Self {
        let nodes: Vec<ChainNode> = (0..config.nodes)
            .map(|i| ChainNode {
                id: ParticipantId::indexed("node", i),
                health: Health::Healthy,
                position: Position::new(
                    (i as f64 - (config.nodes as f64 - 1.0) / 2.0) * 120.0,
                    0.0,
                ),
                store: OrdMap::new(),
                pending: BTreeMap::new(),
            })
            .collect();
        let chain = nodes.iter().map(|n| n.id.clone()).collect();

        Self {
            nodes: ParticipantRegistry::from_participants(nodes),
            config,
            pool: MessagePool::new(),
            chain,
            next_seq: 0,
            acknowledged: 0,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&ChainNode> {
        self.nodes.get(id)
    }

    pub fn chain(&self) -> &[ParticipantId] {
        &self.chain
    }

    pub fn head(&self) -> Option<&ParticipantId> {
        self.chain.first()
    }

    pub fn tail(&self) -> Option<&ParticipantId> {
        self.chain.last()
    }

    fn successor(&self, id: &str) -> Option<ParticipantId> {
        let index = self.chain.iter().position(|n| n == id)?;
        self.chain.get(index + 1).cloned()
    }

    fn predecessor(&self, id: &str) -> Option<ParticipantId> {
        let index = self.chain.iter().position(|n| n == id)?;
        index.checked_sub(1).and_then(|i| self.chain.get(i)).cloned()
    }

    /// Write at the head. Returns the write's sequence number, or `None` if
    /// the head is unavailable.
    pub fn write(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<u64> {
        let head = self.head()?.clone();
        if !self.nodes.is_available(&head) {
            debug!(head = %head, "Head unavailable, write ignored");
            return None;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let (key, value) = (key.into(), value.into());

        info!(seq, key = %key, head = %head, "Write entered chain");
        self.apply(&head, seq, key, value);
        Some(seq)
    }

    /// Read from the tail.
    pub fn read(&self, key: &str) -> Option<&str> {
        let tail = self.tail()?;
        self.nodes
            .get(tail)
            .filter(|n| n.health.is_healthy())
            .and_then(|n| n.store.get(key))
            .map(String::as_str)
    }

    /// Apply a write at `at`, then forward it or, at the tail, acknowledge it.
    fn apply(&mut self, at: &ParticipantId, seq: u64, key: String, value: String) {
        let Some(node) = self.nodes.get_mut(at) else {
            return;
        };
        node.store.insert(key.clone(), value.clone());
        node.pending.insert(seq, (key.clone(), value.clone()));

        match self.successor(at) {
            Some(next) => {
                self.pool
                    .send(at, &next, ChainMessage::Forward { seq, key, value }, self.now);
            }
            None => self.acknowledge(at, seq),
        }
    }

    /// Clear `seq` at `at` and pass the ack to its predecessor.
    fn acknowledge(&mut self, at: &ParticipantId, seq: u64) {
        let Some(node) = self.nodes.get_mut(at) else {
            return;
        };
        if node.pending.remove(&seq).is_none() {
            return;
        }
        match self.predecessor(at) {
            Some(prev) => {
                self.pool.send(at, &prev, ChainMessage::Ack { seq }, self.now);
            }
            None => {
                self.acknowledged += 1;
                debug!(seq, "Write acknowledged at head");
            }
        }
    }

    /// Remove a failed node from the chain and repair around it.
    fn splice_out(&mut self, id: &str) {
        let Some(index) = self.chain.iter().position(|n| n == id) else {
            return;
        };
        self.chain.remove(index);
        info!(node = id, chain = ?self.chain, "Node spliced out of chain");

        let Some(prev) = index.checked_sub(1).and_then(|i| self.chain.get(i)).cloned() else {
            // New head: nothing upstream to resend.
            return;
        };
        let unacked: Vec<(u64, (String, String))> = self
            .nodes
            .get(&prev)
            .map(|n| n.pending.iter().map(|(s, kv)| (*s, kv.clone())).collect())
            .unwrap_or_default();

        match self.chain.get(index).cloned() {
            Some(next) => {
                for (seq, (key, value)) in unacked {
                    debug!(seq, from = %prev, to = %next, "Resending unacknowledged write");
                    self.pool
                        .send(&prev, &next, ChainMessage::Forward { seq, key, value }, self.now);
                }
            }
            // The predecessor is the new tail and acknowledges what it holds.
            None => {
                for (seq, _) in unacked {
                    self.acknowledge(&prev, seq);
                }
            }
        }
    }

    /// Re-add a recovered node as the new tail with a copy of the tail's store.
    fn rejoin(&mut self, id: &str) {
        if self.chain.iter().any(|n| n == id) {
            return;
        }
        let store = self
            .tail()
            .and_then(|tail| self.nodes.get(tail))
            .map(|n| n.store.clone())
            .unwrap_or_default();
        if let Some(node) = self.nodes.get_mut(id) {
            node.store = store;
            node.pending.clear();
            self.chain.push(node.id.clone());
            info!(node = id, "Node rejoined as tail");
        }
    }
}

impl ProtocolStateMachine for ChainReplication {
    type Participant = ChainNode;
    type Payload = ChainMessage;
    type Stats = ChainStats;

    fn name(&self) -> &'static str {
        "chain"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<ChainNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<ChainMessage>> {
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

        let Message { to, payload, .. } = message;
        match payload {
            ChainMessage::Forward { seq, key, value } => {
                trace!(seq, node = %to, "Forward received");
                self.apply(&to, seq, key, value);
            }
            ChainMessage::Ack { seq } => self.acknowledge(&to, seq),
        }
    }

    fn tick(&mut self) {
        self.now += self.config.tick_interval;
    }

    fn fail_node(&mut self, id: &str) {
        if self.nodes.set_health(id, Health::Failed) {
            info!(node = id, "Node failed");
            self.splice_out(id);
        }
    }

    fn recover_node(&mut self, id: &str) {
        if self.nodes.set_health(id, Health::Healthy) {
            info!(node = id, "Node recovered");
            self.rejoin(id);
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn stats(&self) -> ChainStats {
        ChainStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            chain: self.chain.clone(),
            head: self.head().cloned(),
            tail: self.tail().cloned(),
            writes: self.next_seq,
            acknowledged: self.acknowledged,
            pending: self
                .head()
                .and_then(|h| self.nodes.get(h))
                .map_or(0, |n| n.pending.len()),
        }
    }
}
