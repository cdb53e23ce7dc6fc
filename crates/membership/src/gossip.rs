//! Push gossip (rumor spreading).

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for [`Gossip`].
#[derive(Debug, Clone, PartialEq)]
pub struct GossipConfig {
    /// Number of nodes, named `node-0` onwards.
    pub nodes: usize,

    /// Peers each informed node pushes to per tick.
    pub fanout: usize,

    /// Seed for peer selection.
    pub seed: u64,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            nodes: 10,
            fanout: 2,
            seed: 42,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl GossipConfig {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Gossip messages.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipMessage {
    Rumor { rumor: String },
}

impl Payload for GossipMessage {
    fn type_name(&self) -> &'static str {
        match self {
            GossipMessage::Rumor { .. } => "Rumor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GossipNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub rumor: Option<String>,
    /// Round in which the rumor first reached this node.
    pub informed_at: Option<u64>,
}

impl_participant!(GossipNode);

impl GossipNode {
    pub fn is_informed(&self) -> bool {
        self.rumor.is_some()
    }
}

/// Observable summary of a gossip run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GossipStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub rounds: u64,
    pub informed: usize,
    /// Fraction of nodes informed, in `[0, 1]`.
    pub coverage: f64,
    /// First round after which every node was informed.
    pub complete_at: Option<u64>,
}

/// Push gossip over a full mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Gossip {
    config: GossipConfig,
    nodes: ParticipantRegistry<GossipNode>,
    pool: MessagePool<GossipMessage>,
    rng: ChaCha8Rng,
    rounds: u64,
    complete_at: Option<u64>,
    now: Duration,
}

impl Gossip {
    pub fn new(config: GossipConfig) -> Self {
        let nodes = (0..config.nodes).map(|i| GossipNode {
            id: ParticipantId::indexed("node", i),
            health: Health::Healthy,
            position: Position::on_ring(i, config.nodes, 200.0),
            rumor: None,
            informed_at: None,
        });

        Self {
            nodes: ParticipantRegistry::from_participants(nodes),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            pool: MessagePool::new(),
            rounds: 0,
            complete_at: None,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&GossipNode> {
        self.nodes.get(id)
    }

    /// Inform `node` directly. No-op for unknown or failed nodes.
    pub fn seed_rumor(&mut self, node: &str, rumor: impl Into<String>) {
        if !self.nodes.is_available(node) {
            debug!(node, "Cannot seed rumor on unavailable node");
            return;
        }
        let rumor = rumor.into();
        info!(node, rumor = %rumor, "Rumor seeded");
        self.inform(node, rumor);
    }

    fn inform(&mut self, id: &str, rumor: String) {
        let round = self.rounds;
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.is_informed() {
            return;
        }
        node.rumor = Some(rumor);
        node.informed_at = Some(round);
        trace!(node = id, round, "Node informed");

        if self.complete_at.is_none() && self.nodes.iter().all(GossipNode::is_informed) {
            self.complete_at = Some(round);
            info!(round, "Rumor reached every node");
        }
    }

    /// Nodes informed so far.
    pub fn informed_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_informed()).count()
    }
}

impl ProtocolStateMachine for Gossip {
    type Participant = GossipNode;
    type Payload = GossipMessage;
    type Stats = GossipStats;

    fn name(&self) -> &'static str {
        "gossip"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<GossipNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<GossipMessage>> {
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
            GossipMessage::Rumor { rumor } => self.inform(&to, rumor),
        }
    }

    /// One gossip round: every informed healthy node pushes to `fanout`
    /// peers, visited in registry order so the draw sequence is stable.
    fn tick(&mut self) {
        self.now += self.config.tick_interval;
        self.rounds += 1;

        let ids = self.nodes.ids();
        let senders: Vec<(ParticipantId, String)> = self
            .nodes
            .iter()
            .filter(|n| n.health.is_healthy())
            .filter_map(|n| n.rumor.clone().map(|r| (n.id.clone(), r)))
            .collect();

        for (sender, rumor) in senders {
            let peers: Vec<&ParticipantId> = ids.iter().filter(|id| **id != sender).collect();
            let targets: Vec<ParticipantId> = peers
                .choose_multiple(&mut self.rng, self.config.fanout)
                .map(|id| (*id).clone())
                .collect();
            for target in targets {
                self.pool.send(
                    &sender,
                    &target,
                    GossipMessage::Rumor {
                        rumor: rumor.clone(),
                    },
                    self.now,
                );
            }
        }
        debug!(round = self.rounds, in_flight = self.pool.in_flight().count(), "Gossip round");
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

    fn stats(&self) -> GossipStats {
        let informed = self.informed_count();
        GossipStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            rounds: self.rounds,
            informed,
            coverage: if self.nodes.is_empty() {
                0.0
            } else {
                informed as f64 / self.nodes.len() as f64
            },
            complete_at: self.complete_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn gossip() -> Gossip {
        Gossip::new(GossipConfig::default())
    }

    fn run(g: &mut Gossip, rounds: usize) {
        for _ in 0..rounds {
            g.tick();
            g.deliver_all();
        }
    }

    #[test]
    fn test_seed_informs_one_node() {
        let mut g = gossip();
        g.seed_rumor("node-3", "hello");
        assert_eq!(g.informed_count(), 1);
        assert_eq!(g.node("node-3").unwrap().informed_at, Some(0));
    }

    #[test]
    fn test_each_informed_node_pushes_fanout_messages() {
        let mut g = gossip();
        g.seed_rumor("node-0", "hello");
        g.tick();
        assert_eq!(g.list_in_flight().len(), 2);

        let mut wide = Gossip::new(GossipConfig::new(5).with_fanout(3));
        wide.seed_rumor("node-0", "hello");
        wide.tick();
        assert_eq!(wide.list_in_flight().len(), 3);

        for message in g.messages() {
            assert_eq!(message.from, "node-0");
            assert_ne!(message.to, "node-0");
        }
    }

    #[traced_test]
    #[test]
    fn test_rumor_reaches_everyone() {
        let mut g = gossip();
        g.seed_rumor("node-0", "hello");
        run(&mut g, 20);

        let stats = g.stats();
        assert_eq!(stats.informed, 10);
        assert_eq!(stats.coverage, 1.0);
        assert!(stats.complete_at.is_some());
        assert!(logs_contain("Rumor reached every node"));
    }

    #[test]
    fn test_same_seed_same_spread() {
        let mut a = gossip();
        let mut b = gossip();
        for g in [&mut a, &mut b] {
            g.seed_rumor("node-0", "hello");
            run(g, 3);
        }
        assert_eq!(a.participants(), b.participants());
        assert_eq!(a.messages(), b.messages());

        let mut c = Gossip::new(GossipConfig::default().with_seed(7));
        c.seed_rumor("node-0", "hello");
        run(&mut c, 3);
        assert_ne!(a.messages(), c.messages());
    }

    #[test]
    fn test_failed_nodes_neither_push_nor_learn() {
        let mut g = gossip();
        g.seed_rumor("node-0", "hello");
        g.fail_node("node-5");
        run(&mut g, 20);

        assert!(!g.node("node-5").unwrap().is_informed());
        assert_eq!(g.stats().informed, 9);
        assert_eq!(g.stats().complete_at, None);

        g.recover_node("node-5");
        run(&mut g, 20);
        assert!(g.node("node-5").unwrap().is_informed());
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut g = gossip();
        g.seed_rumor("node-0", "hello");
        run(&mut g, 2);
        g.reset();
        assert_eq!(g, gossip());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut g = gossip();
        g.seed_rumor("node-0", "hello");
        g.tick();
        let id = g.list_in_flight()[0];

        g.deliver(id);
        let after_first = g.clone();
        g.deliver(id);
        assert_eq!(g, after_first);
    }
}
