//! Consistent-hash sharding.
//!
//! Every physical node owns `vnodes` positions on a 64-bit hash ring. A key
//! belongs to the first virtual node at or clockwise from the key's hash,
//! so adding or removing a node only moves the keys in the arcs it gains or
//! loses. The ring is an `im::OrdMap`, so snapshots for time travel are
//! structural clones.
//!
//! Ownership changes immediately; the data follows in `Transfer` messages
//! from the previous owner to the new one.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use distlab_types::Hash;
use im::OrdMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for [`Sharding`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShardingConfig {
    /// Initial nodes, named `node-0` onwards.
    pub nodes: usize,

    /// Ring positions per physical node.
    pub vnodes: usize,

    /// Number of tracked keys, named `key-0` onwards.
    pub keys: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            vnodes: 16,
            keys: 100,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl ShardingConfig {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_vnodes(mut self, vnodes: usize) -> Self {
        self.vnodes = vnodes.max(1);
        self
    }

    pub fn with_keys(mut self, keys: usize) -> Self {
        self.keys = keys;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShardingMessage {
    /// Hand keys over to their new owner.
    Transfer { keys: Vec<String> },
}

impl Payload for ShardingMessage {
    fn type_name(&self) -> &'static str {
        match self {
            ShardingMessage::Transfer { .. } => "Transfer",
        }
    }
}

/// A key whose owner changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyMove {
    pub key: String,
    pub from: ParticipantId,
    pub to: ParticipantId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    /// Keys whose data this node holds.
    pub keys: BTreeSet<String>,
}

impl_participant!(ShardNode);

/// Observable summary of the ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub ring_size: usize,
    /// Keys owned per node.
    pub load: BTreeMap<ParticipantId, usize>,
    /// Keys moved by the most recent membership change.
    pub last_moved: usize,
    /// Keys whose owner is currently failed.
    pub unavailable_keys: usize,
}

/// A consistent-hash ring over a changing set of nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Sharding {
    config: ShardingConfig,
    nodes: ParticipantRegistry<ShardNode>,
    pool: MessagePool<ShardingMessage>,
    ring: OrdMap<u64, ParticipantId>,
    /// Tracked key -> current owner.
    owners: BTreeMap<String, ParticipantId>,
    last_moved: usize,
    now: Duration,
}

/// Ring position of a node's `index`-th virtual node.
fn vnode_position(id: &str, index: usize) -> u64 {
    Hash::from_parts(&[id.as_bytes(), b"#", &index.to_le_bytes()]).as_u64()
}

fn key_position(key: &str) -> u64 {
    Hash::from_bytes(key.as_bytes()).as_u64()
}

impl Sharding {
    pub fn new(config: ShardingConfig) -> Self {
        let mut sharding = Self {
            nodes: ParticipantRegistry::new(),
            pool: MessagePool::new(),
            ring: OrdMap::new(),
            owners: BTreeMap::new(),
            last_moved: 0,
            now: Duration::ZERO,
            config,
        };

        for i in 0..sharding.config.nodes {
            let id = ParticipantId::indexed("node", i);
            sharding.insert_node(id);
        }
        sharding.layout();

        let keys: Vec<String> = (0..sharding.config.keys).map(|i| format!("key-{i}")).collect();
        for key in keys {
            if let Some(owner) = sharding.owner(&key) {
                if let Some(node) = sharding.nodes.get_mut(&owner) {
                    node.keys.insert(key.clone());
                }
                sharding.owners.insert(key, owner);
            }
        }
        sharding
    }

    pub fn node(&self, id: &str) -> Option<&ShardNode> {
        self.nodes.get(id)
    }

    /// Owner of `key`: the first virtual node at or after its hash, wrapping.
    pub fn owner(&self, key: &str) -> Option<ParticipantId> {
        let position = key_position(key);
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| id.clone())
    }

    /// Current owner map of the tracked keys.
    pub fn owners(&self) -> &BTreeMap<String, ParticipantId> {
        &self.owners
    }

    fn insert_node(&mut self, id: ParticipantId) {
        for index in 0..self.config.vnodes {
            self.ring.insert(vnode_position(&id, index), id.clone());
        }
        self.nodes.upsert(ShardNode {
            id,
            health: Health::Healthy,
            position: Position::default(),
            keys: BTreeSet::new(),
        });
    }

    /// Spread nodes evenly on the display ring.
    fn layout(&mut self) {
        let count = self.nodes.len();
        for (i, id) in self.nodes.ids().into_iter().enumerate() {
            self.nodes
                .set_position(&id, Position::on_ring(i, count, 200.0));
        }
    }

    /// Recompute owners for every tracked key, send transfers for the keys
    /// that changed hands and return the moves.
    fn rebalance(&mut self) -> Vec<KeyMove> {
        let mut moves = Vec::new();
        let keys: Vec<String> = self.owners.keys().cloned().collect();
        for key in keys {
            let Some(to) = self.owner(&key) else {
                continue;
            };
            if let Some(from) = self.owners.insert(key.clone(), to.clone()) {
                if from != to {
                    moves.push(KeyMove { key, from, to });
                }
            }
        }

        let mut batches: BTreeMap<(ParticipantId, ParticipantId), Vec<String>> = BTreeMap::new();
        for m in &moves {
            batches
                .entry((m.from.clone(), m.to.clone()))
                .or_default()
                .push(m.key.clone());
        }
        for ((from, to), keys) in batches {
            trace!(from = %from, to = %to, count = keys.len(), "Transferring keys");
            self.pool
                .send(&from, &to, ShardingMessage::Transfer { keys }, self.now);
        }

        self.last_moved = moves.len();
        moves
    }

    /// Join a node to the ring. Returns the keys it took over.
    ///
    /// Existing ids are ignored.
    pub fn add_node(&mut self, id: &str) -> Vec<KeyMove> {
        if self.nodes.contains(id) {
            debug!(node = id, "Node already on ring");
            return Vec::new();
        }
        self.insert_node(ParticipantId::from(id));
        self.layout();
        let moves = self.rebalance();
        info!(node = id, moved = moves.len(), "Node added to ring");
        moves
    }

    /// Remove a node from the ring. Returns the keys that moved off it.
    ///
    /// The departing node stays registered until its transfers are
    /// delivered, then disappears from the participant list.
    pub fn remove_node(&mut self, id: &str) -> Vec<KeyMove> {
        if !self.nodes.contains(id) || !self.on_ring(id) {
            debug!(node = id, "Node not on ring");
            return Vec::new();
        }
        let positions: Vec<u64> = self
            .ring
            .iter()
            .filter(|(_, owner)| *owner == id)
            .map(|(position, _)| *position)
            .collect();
        for position in positions {
            self.ring.remove(&position);
        }
        let moves = self.rebalance();
        info!(node = id, moved = moves.len(), "Node removed from ring");
        self.retire_if_drained(id);
        moves
    }

    fn on_ring(&self, id: &str) -> bool {
        self.ring.values().any(|owner| owner == id)
    }

    /// Drop a node that left the ring once it holds no more data.
    fn retire_if_drained(&mut self, id: &str) {
        let drained = self.nodes.get(id).is_some_and(|n| n.keys.is_empty());
        if drained && !self.on_ring(id) {
            self.nodes.remove(id);
            self.layout();
            debug!(node = id, "Node retired");
        }
    }

    fn on_transfer(&mut self, from: &ParticipantId, to: &ParticipantId, keys: Vec<String>) {
        if let Some(source) = self.nodes.get_mut(from) {
            for key in &keys {
                source.keys.remove(key);
            }
        }
        if let Some(target) = self.nodes.get_mut(to) {
            target.keys.extend(keys);
        }
        self.retire_if_drained(from);
    }
}

impl ProtocolStateMachine for Sharding {
    type Participant = ShardNode;
    type Payload = ShardingMessage;
    type Stats = ShardingStats;

    fn name(&self) -> &'static str {
        "sharding"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<ShardNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<ShardingMessage>> {
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
            ShardingMessage::Transfer { keys } => self.on_transfer(&from, &to, keys),
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

    fn stats(&self) -> ShardingStats {
        let mut load: BTreeMap<ParticipantId, usize> = self
            .nodes
            .iter()
            .filter(|n| self.on_ring(&n.id))
            .map(|n| (n.id.clone(), 0))
            .collect();
        for owner in self.owners.values() {
            *load.entry(owner.clone()).or_insert(0) += 1;
        }

        ShardingStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            ring_size: self.ring.len(),
            load,
            last_moved: self.last_moved,
            unavailable_keys: self
                .owners
                .values()
                .filter(|owner| !self.nodes.is_available(owner))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn ring() -> Sharding {
        Sharding::new(ShardingConfig::default())
    }

    #[test]
    fn test_every_key_has_an_owner() {
        let s = ring();
        assert_eq!(s.stats().ring_size, 48);
        assert_eq!(s.owners().len(), 100);

        let held: usize = s.participants().iter().map(|n| n.keys.len()).sum();
        assert_eq!(held, 100);
        for (key, owner) in s.owners() {
            assert!(s.node(owner).unwrap().keys.contains(key));
        }
    }

    #[test]
    fn test_ring_shape_follows_config() {
        let s = Sharding::new(ShardingConfig::new(2).with_vnodes(4).with_keys(10));
        assert_eq!(s.stats().ring_size, 8);
        assert_eq!(s.owners().len(), 10);
    }

    #[test]
    fn test_owner_is_deterministic() {
        let a = ring();
        let b = ring();
        assert_eq!(a.owner("user:42"), b.owner("user:42"));
        assert_eq!(a.owners(), b.owners());
    }

    #[traced_test]
    #[test]
    fn test_add_node_only_moves_keys_to_newcomer() {
        let mut s = ring();
        let before = s.owners().clone();
        let moves = s.add_node("node-3");

        assert!(!moves.is_empty());
        assert!(moves.len() < 100);
        for m in &moves {
            assert_eq!(m.to, "node-3");
            assert_eq!(before.get(&m.key), Some(&m.from));
        }
        let unchanged = before
            .iter()
            .filter(|(key, owner)| s.owners().get(*key) == Some(*owner))
            .count();
        assert_eq!(unchanged + moves.len(), 100);
        assert!(logs_contain("Node added to ring"));

        s.deliver_all();
        assert_eq!(s.node("node-3").unwrap().keys.len(), moves.len());
    }

    #[test]
    fn test_remove_node_moves_only_its_keys() {
        let mut s = ring();
        let owned: BTreeSet<String> = s.node("node-1").unwrap().keys.clone();
        let moves = s.remove_node("node-1");

        assert_eq!(moves.len(), owned.len());
        assert!(moves.iter().all(|m| m.from == "node-1" && m.to != "node-1"));
        assert_eq!(s.stats().ring_size, 32);

        s.deliver_all();
        assert!(s.node("node-1").is_none());
        assert_eq!(s.participants().len(), 2);
    }

    #[test]
    fn test_add_then_remove_restores_ownership() {
        let mut s = ring();
        let before = s.owners().clone();
        s.add_node("node-9");
        s.deliver_all();
        s.remove_node("node-9");
        s.deliver_all();
        assert_eq!(s.owners(), &before);
    }

    #[test]
    fn test_failed_owner_makes_keys_unavailable() {
        let mut s = ring();
        let owned = s.node("node-0").unwrap().keys.len();
        s.fail_node("node-0");
        assert_eq!(s.stats().unavailable_keys, owned);
    }

    #[test]
    fn test_duplicate_add_and_unknown_remove_are_noops() {
        let mut s = ring();
        assert!(s.add_node("node-0").is_empty());
        assert!(s.remove_node("node-7").is_empty());
        assert!(s.list_in_flight().is_empty());
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut s = ring();
        s.add_node("node-3");
        s.reset();
        assert_eq!(s, ring());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut s = ring();
        s.add_node("node-3");
        let id = s.list_in_flight()[0];

        s.deliver(id);
        let after_first = s.clone();
        s.deliver(id);
        assert_eq!(s, after_first);
    }
}
