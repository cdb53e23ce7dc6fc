//! Causal broadcast with a holdback queue.

use crate::lamport::ClockConfig;
use crate::vector_clock::VectorClock;
use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum CausalMessage {
    Broadcast { body: String, stamp: VectorClock },
}

impl Payload for CausalMessage {
    fn type_name(&self) -> &'static str {
        match self {
            CausalMessage::Broadcast { .. } => "Broadcast",
        }
    }
}

/// A received broadcast that is not yet causally deliverable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeldMessage {
    pub from: ParticipantId,
    pub stamp: VectorClock,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CausalNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    /// Broadcasts delivered from each sender.
    pub clock: VectorClock,
    pub holdback: Vec<HeldMessage>,
    /// Bodies in delivery order.
    pub delivered: Vec<String>,
}

impl_participant!(CausalNode);

impl CausalNode {
    /// Whether `held` is the next message from its sender and everything
    /// it depends on has been delivered here.
    fn can_deliver(&self, held: &HeldMessage) -> bool {
        held.stamp.get(&held.from) == self.clock.get(&held.from) + 1
            && held
                .stamp
                .iter()
                .filter(|(node, _)| **node != held.from)
                .all(|(node, count)| count <= self.clock.get(node))
    }

    /// Deliver held messages until none is ready. Returns how many were delivered.
    fn drain_holdback(&mut self) -> usize {
        let mut count = 0;
        while let Some(index) = self.holdback.iter().position(|h| self.can_deliver(h)) {
            let held = self.holdback.remove(index);
            self.clock.set(&held.from, held.stamp.get(&held.from));
            trace!(node = %self.id, from = %held.from, body = %held.body, "Delivered");
            self.delivered.push(held.body);
            count += 1;
        }
        count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub broadcasts: usize,
    /// Messages currently held back, summed over nodes.
    pub held: usize,
    /// Times a message had to wait in a holdback queue.
    pub deferred: usize,
}

/// Vector-stamped broadcast delivered in causal order.
#[derive(Debug, Clone, PartialEq)]
pub struct CausalBroadcast {
    config: ClockConfig,
    nodes: ParticipantRegistry<CausalNode>,
    pool: MessagePool<CausalMessage>,
    broadcasts: usize,
    deferred: usize,
    now: Duration,
}

impl CausalBroadcast {
    pub fn new(config: ClockConfig) -> Self {
        let nodes = (0..config.nodes).map(|i| CausalNode {
            id: ParticipantId::indexed("node", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.nodes, 200.0),
            clock: VectorClock::new(),
            holdback: Vec::new(),
            delivered: Vec::new(),
        });

        Self {
            nodes: ParticipantRegistry::from_participants(nodes),
            config,
            pool: MessagePool::new(),
            broadcasts: 0,
            deferred: 0,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&CausalNode> {
        self.nodes.get(id)
    }

    pub fn delivered(&self, id: &str) -> Option<&[String]> {
        self.nodes.get(id).map(|n| n.delivered.as_slice())
    }

    /// Deliver `body` locally at `from` and send it to every other node.
    pub fn broadcast(&mut self, from: &str, body: impl Into<String>) {
        if !self.nodes.is_available(from) {
            debug!(node = from, "Broadcast from unavailable node ignored");
            return;
        }
        let body = body.into();
        let ids = self.nodes.ids();
        let Some(node) = self.nodes.get_mut(from) else {
            return;
        };
        let sender = node.id.clone();
        node.clock.increment(&sender);
        node.delivered.push(body.clone());
        let stamp = node.clock.clone();
        self.broadcasts += 1;
        debug!(node = from, stamp = %stamp, body = %body, "Broadcast");

        for to in ids.iter().filter(|id| **id != sender) {
            self.pool.send(
                &sender,
                to,
                CausalMessage::Broadcast {
                    body: body.clone(),
                    stamp: stamp.clone(),
                },
                self.now,
            );
        }
    }
}

impl ProtocolStateMachine for CausalBroadcast {
    type Participant = CausalNode;
    type Payload = CausalMessage;
    type Stats = CausalStats;

    fn name(&self) -> &'static str {
        "causal-broadcast"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<CausalNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<CausalMessage>> {
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
        let CausalMessage::Broadcast { body, stamp } = payload;
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if stamp.get(&from) <= node.clock.get(&from) {
            trace!(node = %to, from = %from, "Duplicate broadcast ignored");
            return;
        }

        node.holdback.push(HeldMessage { from, stamp, body });
        if node.drain_holdback() == 0 {
            self.deferred += 1;
            debug!(node = %to, held = node.holdback.len(), "Broadcast held back");
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

    fn stats(&self) -> CausalStats {
        CausalStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            broadcasts: self.broadcasts,
            held: self.nodes.iter().map(|n| n.holdback.len()).sum(),
            deferred: self.deferred,
        }
    }
}
