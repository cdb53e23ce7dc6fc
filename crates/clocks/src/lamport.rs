//! Lamport logical clocks.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration shared by the clock models.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockConfig {
    /// Number of nodes, named `node-0` onwards.
    pub nodes: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl ClockConfig {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Local,
    Send,
    Receive,
}

/// One clock-advancing event and the timestamp it was assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockEvent {
    pub node: ParticipantId,
    pub kind: EventKind,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LamportMessage {
    Stamped { timestamp: u64 },
}

impl Payload for LamportMessage {
    fn type_name(&self) -> &'static str {
        match self {
            LamportMessage::Stamped { .. } => "Stamped",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LamportNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub clock: u64,
}

impl_participant!(LamportNode);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LamportStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub clocks: Vec<(ParticipantId, u64)>,
    pub events: usize,
}

/// Nodes with scalar Lamport clocks.
#[derive(Debug, Clone, PartialEq)]
pub struct LamportClocks {
    config: ClockConfig,
    nodes: ParticipantRegistry<LamportNode>,
    pool: MessagePool<LamportMessage>,
    /// Every event in the order it happened.
    events: Vec<ClockEvent>,
    now: Duration,
}

impl LamportClocks {
    pub fn new(config: ClockConfig) -> Self {
        let nodes = (0..config.nodes).map(|i| LamportNode {
            id: ParticipantId::indexed("node", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.nodes, 200.0),
            clock: 0,
        });

        Self {
            nodes: ParticipantRegistry::from_participants(nodes),
            config,
            pool: MessagePool::new(),
            events: Vec::new(),
            now: Duration::ZERO,
        }
    }

    pub fn clock(&self, id: &str) -> Option<u64> {
        self.nodes.get(id).map(|n| n.clock)
    }

    pub fn events(&self) -> &[ClockEvent] {
        &self.events
    }

    fn advance(&mut self, id: &str, kind: EventKind, seen: u64) -> Option<u64> {
        let node = self.nodes.get_mut(id)?;
        node.clock = node.clock.max(seen) + 1;
        let time = node.clock;
        trace!(node = id, kind = ?kind, time, "Clock advanced");
        self.events.push(ClockEvent {
            node: node.id.clone(),
            kind,
            time,
        });
        Some(time)
    }

    /// An internal event at `id`.
    pub fn local_event(&mut self, id: &str) {
        if !self.nodes.is_available(id) {
            debug!(node = id, "Local event on unavailable node ignored");
            return;
        }
        self.advance(id, EventKind::Local, 0);
    }

    /// Send a stamped message from `from` to `to`.
    pub fn send(&mut self, from: &str, to: &str) {
        if from == to || !self.nodes.is_available(from) || !self.nodes.contains(to) {
            debug!(from, to, "Send ignored");
            return;
        }
        let Some(timestamp) = self.advance(from, EventKind::Send, 0) else {
            return;
        };
        self.pool.send(
            &ParticipantId::from(from),
            &ParticipantId::from(to),
            LamportMessage::Stamped { timestamp },
            self.now,
        );
    }
}

impl ProtocolStateMachine for LamportClocks {
    type Participant = LamportNode;
    type Payload = LamportMessage;
    type Stats = LamportStats;

    fn name(&self) -> &'static str {
        "lamport"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<LamportNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<LamportMessage>> {
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
            LamportMessage::Stamped { timestamp } => {
                self.advance(&to, EventKind::Receive, timestamp);
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

    fn stats(&self) -> LamportStats {
        LamportStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            clocks: self.nodes.iter().map(|n| (n.id.clone(), n.clock)).collect(),
            events: self.events.len(),
        }
    }
}
