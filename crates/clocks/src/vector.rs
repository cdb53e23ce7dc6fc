//! Vector clocks.

use crate::lamport::{ClockConfig, EventKind};
use crate::vector_clock::{ClockOrdering, VectorClock};
use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum VectorMessage {
    Stamped { clock: VectorClock },
}

impl Payload for VectorMessage {
    fn type_name(&self) -> &'static str {
        match self {
            VectorMessage::Stamped { .. } => "Stamped",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub clock: VectorClock,
    /// Clock value after each of this node's events.
    pub history: Vec<(EventKind, VectorClock)>,
}

impl_participant!(VectorNode);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub clocks: Vec<(ParticipantId, VectorClock)>,
    /// Pairs of nodes whose current clocks are concurrent.
    pub concurrent_pairs: usize,
}

/// Nodes with vector clocks.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorClocks {
    config: ClockConfig,
    nodes: ParticipantRegistry<VectorNode>,
    pool: MessagePool<VectorMessage>,
    now: Duration,
}

impl VectorClocks {
    pub fn new(config: ClockConfig) -> Self {
        let nodes = (0..config.nodes).map(|i| VectorNode {
            id: ParticipantId::indexed("node", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.nodes, 200.0),
            clock: VectorClock::new(),
            history: Vec::new(),
        });

        Self {
            nodes: ParticipantRegistry::from_participants(nodes),
            config,
            pool: MessagePool::new(),
            now: Duration::ZERO,
        }
    }

    pub fn clock(&self, id: &str) -> Option<&VectorClock> {
        self.nodes.get(id).map(|n| &n.clock)
    }

    pub fn node(&self, id: &str) -> Option<&VectorNode> {
        self.nodes.get(id)
    }

    /// How the current clocks of two nodes relate.
    pub fn compare(&self, a: &str, b: &str) -> Option<ClockOrdering> {
        Some(self.clock(a)?.compare(self.clock(b)?))
    }

    fn advance(&mut self, id: &str, kind: EventKind, seen: Option<&VectorClock>) -> Option<VectorClock> {
        let node = self.nodes.get_mut(id)?;
        if let Some(seen) = seen {
            node.clock.merge(seen);
        }
        let own = node.id.clone();
        node.clock.increment(&own);
        trace!(node = id, kind = ?kind, clock = %node.clock, "Clock advanced");
        node.history.push((kind, node.clock.clone()));
        Some(node.clock.clone())
    }

    pub fn local_event(&mut self, id: &str) {
        if !self.nodes.is_available(id) {
            debug!(node = id, "Local event on unavailable node ignored");
            return;
        }
        self.advance(id, EventKind::Local, None);
    }

    pub fn send(&mut self, from: &str, to: &str) {
        if from == to || !self.nodes.is_available(from) || !self.nodes.contains(to) {
            debug!(from, to, "Send ignored");
            return;
        }
        let Some(clock) = self.advance(from, EventKind::Send, None) else {
            return;
        };
        self.pool.send(
            &ParticipantId::from(from),
            &ParticipantId::from(to),
            VectorMessage::Stamped { clock },
            self.now,
        );
    }

    fn concurrent_pairs(&self) -> usize {
        let nodes: Vec<&VectorNode> = self.nodes.iter().collect();
        let mut count = 0;
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                if a.clock.compare(&b.clock) == ClockOrdering::Concurrent {
                    count += 1;
                }
            }
        }
        count
    }
}

impl ProtocolStateMachine for VectorClocks {
    type Participant = VectorNode;
    type Payload = VectorMessage;
    type Stats = VectorStats;

    fn name(&self) -> &'static str {
        "vector-clocks"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<VectorNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<VectorMessage>> {
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
            VectorMessage::Stamped { clock } => {
                self.advance(&to, EventKind::Receive, Some(&clock));
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

    fn stats(&self) -> VectorStats {
        VectorStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            clocks: self
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.clock.clone()))
                .collect(),
            concurrent_pairs: self.concurrent_pairs(),
        }
    }
}
