//! Merkle-tree anti-entropy.
//!
//! Each replica summarises its key space as `buckets` leaf hashes. A sync
//! starts with the root; each side answers with the child hashes of every
//! node that differs, descending one level per message, until the differing
//! leaves are known. Only those buckets' entries are exchanged, and both
//! sides keep the newest version of each key.

use crate::versioned::{apply_newer, Store, Versioned};
use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use distlab_types::{Hash, MerkleTree};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for [`AntiEntropy`].
#[derive(Debug, Clone, PartialEq)]
pub struct AntiEntropyConfig {
    /// Number of replicas, named `replica-0` onwards.
    pub replicas: usize,

    /// Leaf buckets per tree.
    pub buckets: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            buckets: 8,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl AntiEntropyConfig {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            ..Default::default()
        }
    }

    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets.max(1);
        self
    }
}

/// Anti-entropy messages.
#[derive(Debug, Clone, PartialEq)]
pub enum AntiEntropyMessage {
    /// Hashes of `(index, hash)` nodes on `level` that the receiver should
    /// compare against its own tree.
    Compare {
        level: usize,
        nodes: Vec<(usize, Hash)>,
    },
    /// Entries of the given buckets. `reply` asks the receiver to send its
    /// own entries for the same buckets back.
    Entries {
        buckets: Vec<usize>,
        entries: Vec<(String, Versioned)>,
        reply: bool,
    },
}

impl Payload for AntiEntropyMessage {
    fn type_name(&self) -> &'static str {
        match self {
            AntiEntropyMessage::Compare { .. } => "Compare",
            AntiEntropyMessage::Entries { .. } => "Entries",
        }
    }
}

/// A replica holding a key/value store.
#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub store: Store,
}

impl_participant!(Replica);

/// Observable summary of an anti-entropy run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AntiEntropyStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub syncs: usize,
    /// Buckets whose entries were shipped, summed over all exchanges.
    pub buckets_exchanged: usize,
    /// Replica pairs whose Merkle roots differ.
    pub divergent_pairs: usize,
}

/// Replicas that reconcile by comparing Merkle trees.
#[derive(Debug, Clone, PartialEq)]
pub struct AntiEntropy {
    config: AntiEntropyConfig,
    nodes: ParticipantRegistry<Replica>,
    pool: MessagePool<AntiEntropyMessage>,
    next_version: u64,
    syncs: usize,
    buckets_exchanged: usize,
    now: Duration,
}

impl AntiEntropy {
    pub fn new(config: AntiEntropyConfig) -> Self {
        let replicas = (0..config.replicas).map(|i| Replica {
            id: ParticipantId::indexed("replica", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.replicas, 200.0),
            store: Store::new(),
        });

        Self {
            nodes: ParticipantRegistry::from_participants(replicas),
            config,
            pool: MessagePool::new(),
            next_version: 0,
            syncs: 0,
            buckets_exchanged: 0,
            now: Duration::ZERO,
        }
    }

    pub fn replica(&self, id: &str) -> Option<&Replica> {
        self.nodes.get(id)
    }

    /// Bucket a key falls into.
    pub fn bucket_of(&self, key: &str) -> usize {
        (Hash::from_bytes(key.as_bytes()).as_u64() % self.config.buckets.max(1) as u64) as usize
    }

    /// Write directly to one replica with a fresh version.
    pub fn put(&mut self, replica: &str, key: impl Into<String>, value: impl Into<String>) {
        if !self.nodes.is_available(replica) {
            debug!(replica, "Replica unavailable, put ignored");
            return;
        }
        self.next_version += 1;
        let value = Versioned::new(value, self.next_version);
        let key = key.into();
        if let Some(node) = self.nodes.get_mut(replica) {
            trace!(replica, key = %key, version = value.version, "Local put");
            node.store.insert(key, value);
        }
    }

    /// Merkle tree over a replica's buckets.
    pub fn build_tree(&self, replica: &str) -> Option<MerkleTree> {
        let node = self.nodes.get(replica)?;
        Some(self.tree_of(&node.store))
    }

    fn tree_of(&self, store: &Store) -> MerkleTree {
        let mut buckets: Vec<Vec<(&String, &Versioned)>> =
            vec![Vec::new(); self.config.buckets.max(1)];
        for (key, value) in store.iter() {
            buckets[self.bucket_of(key)].push((key, value));
        }
        let leaves: Vec<Hash> = buckets
            .iter()
            .map(|entries| {
                if entries.is_empty() {
                    return Hash::ZERO;
                }
                let mut parts: Vec<Vec<u8>> = Vec::with_capacity(entries.len() * 3);
                for (key, value) in entries {
                    parts.push(key.as_bytes().to_vec());
                    parts.push(value.version.to_le_bytes().to_vec());
                    parts.push(value.value.as_bytes().to_vec());
                }
                let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                Hash::from_parts(&slices)
            })
            .collect();
        MerkleTree::build(&leaves)
    }

    fn entries_in(&self, replica: &str, buckets: &BTreeSet<usize>) -> Vec<(String, Versioned)> {
        self.nodes
            .get(replica)
            .map(|node| {
                node.store
                    .iter()
                    .filter(|(key, _)| buckets.contains(&self.bucket_of(key)))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Start reconciling `a` with `b` by sending `a`'s root.
    pub fn sync(&mut self, a: &str, b: &str) {
        if a == b || !self.nodes.is_available(a) || !self.nodes.is_available(b) {
            debug!(a, b, "Sync ignored");
            return;
        }
        let Some(tree) = self.build_tree(a) else {
            return;
        };
        self.syncs += 1;
        info!(from = a, to = b, root = %tree.root(), "Anti-entropy sync started");
        self.pool.send(
            &ParticipantId::from(a),
            &ParticipantId::from(b),
            AntiEntropyMessage::Compare {
                level: 0,
                nodes: vec![(0, tree.root())],
            },
            self.now,
        );
    }

    /// Whether two replicas have equal Merkle roots.
    pub fn in_sync(&self, a: &str, b: &str) -> bool {
        match (self.build_tree(a), self.build_tree(b)) {
            (Some(x), Some(y)) => x.root() == y.root(),
            _ => false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_compare(
        &mut self,
        from: ParticipantId,
        to: ParticipantId,
        level: usize,
        nodes: Vec<(usize, Hash)>,
    ) {
        let Some(tree) = self.build_tree(&to) else {
            return;
        };
        let differing: Vec<usize> = nodes
            .into_iter()
            .filter(|(index, hash)| tree.node(level, *index) != Some(*hash))
            .map(|(index, _)| index)
            .collect();

        if differing.is_empty() {
            debug!(from = %from, to = %to, level, "Subtrees match");
            return;
        }

        if level >= tree.depth() {
            // Leaf level: ship our entries and ask for theirs.
            let buckets: BTreeSet<usize> = differing
                .into_iter()
                .filter(|b| *b < self.config.buckets)
                .collect();
            let entries = self.entries_in(&to, &buckets);
            self.buckets_exchanged += buckets.len();
            debug!(from = %to, to = %from, buckets = ?buckets, "Exchanging buckets");
            self.pool.send(
                &to,
                &from,
                AntiEntropyMessage::Entries {
                    buckets: buckets.into_iter().collect(),
                    entries,
                    reply: true,
                },
                self.now,
            );
            return;
        }

        let children: Vec<(usize, Hash)> = differing
            .iter()
            .filter_map(|index| tree.children(level, *index))
            .flatten()
            .filter_map(|child| tree.node(level + 1, child).map(|hash| (child, hash)))
            .collect();
        trace!(from = %to, to = %from, level = level + 1, count = children.len(), "Descending");
        self.pool.send(
            &to,
            &from,
            AntiEntropyMessage::Compare {
                level: level + 1,
                nodes: children,
            },
            self.now,
        );
    }

    fn on_entries(
        &mut self,
        from: ParticipantId,
        to: ParticipantId,
        buckets: Vec<usize>,
        entries: Vec<(String, Versioned)>,
        reply: bool,
    ) {
        let buckets: BTreeSet<usize> = buckets.into_iter().collect();
        // Capture our side before merging so the reply carries what we held.
        let ours = if reply {
            Some(self.entries_in(&to, &buckets))
        } else {
            None
        };

        if let Some(node) = self.nodes.get_mut(&to) {
            let applied = entries
                .iter()
                .filter(|(key, value)| apply_newer(&mut node.store, key, value))
                .count();
            debug!(replica = %to, applied, "Merged bucket entries");
        }

        if let Some(entries) = ours {
            self.buckets_exchanged += buckets.len();
            self.pool.send(
                &to,
                &from,
                AntiEntropyMessage::Entries {
                    buckets: buckets.into_iter().collect(),
                    entries,
                    reply: false,
                },
                self.now,
            );
        }
    }
}

impl ProtocolStateMachine for AntiEntropy {
    type Participant = Replica;
    type Payload = AntiEntropyMessage;
    type Stats = AntiEntropyStats;

    fn name(&self) -> &'static str {
        "anti-entropy"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<Replica> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<AntiEntropyMessage>> {
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
            AntiEntropyMessage::Compare { level, nodes } => {
                self.on_compare(from, to, level, nodes)
            }
            AntiEntropyMessage::Entries {
                buckets,
                entries,
                reply,
            } => self.on_entries(from, to, buckets, entries, reply),
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

    fn stats(&self) -> AntiEntropyStats {
        let roots: Vec<Hash> = self
            .nodes
            .iter()
            .map(|n| self.tree_of(&n.store).root())
            .collect();
        let divergent_pairs = roots
            .iter()
            .enumerate()
            .flat_map(|(i, a)| roots[i + 1..].iter().map(move |b| a != b))
            .filter(|differs| *differs)
            .count();

        AntiEntropyStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            syncs: self.syncs,
            buckets_exchanged: self.buckets_exchanged,
            divergent_pairs,
        }
    }
}
