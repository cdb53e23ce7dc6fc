//! Replicas of one CRDT exchanging full state.

use crate::Crdt;
use distlab_core::{
    Health, HealthStats, Message, MessageId, MessagePool, MessageStats, Participant,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for [`CrdtCluster`].
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtConfig {
    /// Number of replicas, named `replica-0` onwards.
    pub replicas: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl CrdtConfig {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrdtMessage<C> {
    /// A full copy of the sender's state.
    State(C),
}

impl<C: Crdt> Payload for CrdtMessage<C> {
    fn type_name(&self) -> &'static str {
        match self {
            CrdtMessage::State(_) => "State",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrdtReplica<C> {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub state: C,
}

impl<C: Clone> Participant for CrdtReplica<C> {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    fn health(&self) -> Health {
        self.health
    }

    fn set_health(&mut self, health: Health) {
        self.health = health;
    }

    fn position(&self) -> Position {
        self.position
    }

    fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

/// Observable summary of a CRDT run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrdtStats<V> {
    pub health: HealthStats,
    pub messages: MessageStats,
    /// Value at each replica, in registry order.
    pub values: Vec<(ParticipantId, V)>,
    /// Whether every healthy replica holds the same value.
    pub converged: bool,
    pub merges: usize,
}

/// A set of replicas of one state-based CRDT.
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtCluster<C: Crdt> {
    config: CrdtConfig,
    nodes: ParticipantRegistry<CrdtReplica<C>>,
    pool: MessagePool<CrdtMessage<C>>,
    merges: usize,
    now: Duration,
}

impl<C: Crdt> CrdtCluster<C> {
    pub fn new(config: CrdtConfig) -> Self {
        let replicas = (0..config.replicas).map(|i| CrdtReplica {
            id: ParticipantId::indexed("replica", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.replicas, 200.0),
            state: C::default(),
        });

        Self {
            nodes: ParticipantRegistry::from_participants(replicas),
            config,
            pool: MessagePool::new(),
            merges: 0,
            now: Duration::ZERO,
        }
    }

    pub fn replica(&self, id: &str) -> Option<&CrdtReplica<C>> {
        self.nodes.get(id)
    }

    pub fn value(&self, id: &str) -> Option<C::Value> {
        self.nodes.get(id).map(|r| r.state.value())
    }

    /// Apply a local operation at a replica. No-op if it is unavailable.
    pub fn apply(&mut self, id: &str, op: C::Op) {
        if !self.nodes.is_available(id) {
            debug!(replica = id, "Replica unavailable, operation ignored");
            return;
        }
        if let Some(replica) = self.nodes.get_mut(id) {
            trace!(replica = id, op = ?op, "Local operation");
            let replica_id = replica.id.clone();
            replica.state.apply(&replica_id, op);
        }
    }

    /// Send `from`'s current state to `to`.
    pub fn sync(&mut self, from: &str, to: &str) {
        if from == to || !self.nodes.contains(to) {
            return;
        }
        let Some(replica) = self.nodes.get(from).filter(|r| r.health.is_healthy()) else {
            debug!(from, to, "Sync from unavailable replica ignored");
            return;
        };
        let message = CrdtMessage::State(replica.state.clone());
        let sender = replica.id.clone();
        self.pool
            .send(&sender, &ParticipantId::from(to), message, self.now);
    }

    /// Send `from`'s state to every other replica.
    pub fn broadcast(&mut self, from: &str) {
        for to in self.nodes.ids() {
            self.sync(from, &to);
        }
    }

    /// Whether every healthy replica holds the same value.
    pub fn converged(&self) -> bool {
        let mut values = self
            .nodes
            .iter()
            .filter(|r| r.health.is_healthy())
            .map(|r| r.state.value());
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }
}

impl<C: Crdt> ProtocolStateMachine for CrdtCluster<C> {
    type Participant = CrdtReplica<C>;
    type Payload = CrdtMessage<C>;
    type Stats = CrdtStats<C::Value>;

    fn name(&self) -> &'static str {
        C::NAME
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<CrdtReplica<C>> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<CrdtMessage<C>>> {
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
            CrdtMessage::State(state) => {
                if let Some(replica) = self.nodes.get_mut(&to) {
                    replica.state.merge(&state);
                    self.merges += 1;
                    trace!(from = %from, to = %to, "State merged");
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

    fn stats(&self) -> CrdtStats<C::Value> {
        CrdtStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            values: self
                .nodes
                .iter()
                .map(|r| (r.id.clone(), r.state.value()))
                .collect(),
            converged: self.converged(),
            merges: self.merges,
        }
    }
}
