//! Phi-accrual failure detection.
//!
//! Monitored nodes heartbeat the monitor every tick. For each node the
//! monitor keeps a bounded window of heartbeat inter-arrival times and turns
//! the time since the last heartbeat into a suspicion level
//!
//! ```text
//! phi = elapsed / (mean_interval * ln 10)
//! ```
//!
//! using the exponential approximation of the arrival distribution, so phi
//! grows by one for every `mean * ln 10` of silence.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::f64::consts::LN_10;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Id of the monitoring participant.
pub const MONITOR: &str = "monitor";

/// Configuration for [`PhiAccrual`].
#[derive(Debug, Clone, PartialEq)]
pub struct PhiAccrualConfig {
    /// Number of monitored nodes, named `node-0` onwards.
    pub nodes: usize,

    /// Inter-arrival samples kept per node.
    pub window_size: usize,

    /// Phi above which a node is suspected.
    pub suspect_threshold: f64,

    /// Phi above which a node is declared failed.
    pub failure_threshold: f64,

    /// Logical time added by each `tick()`, also the heartbeat period.
    pub tick_interval: Duration,
}

impl Default for PhiAccrualConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            window_size: 10,
            suspect_threshold: 3.0,
            failure_threshold: 8.0,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl PhiAccrualConfig {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    pub fn with_thresholds(mut self, suspect: f64, failure: f64) -> Self {
        self.suspect_threshold = suspect;
        self.failure_threshold = failure;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhiMessage {
    Heartbeat { seq: u64 },
}

impl Payload for PhiMessage {
    fn type_name(&self) -> &'static str {
        match self {
            PhiMessage::Heartbeat { .. } => "Heartbeat",
        }
    }
}

/// The monitor's verdict on a node, ordered by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Alive,
    Suspect,
    Failed,
}

/// A participant together with the monitor's detector state for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub liveness: Liveness,
    pub phi: f64,
    pub last_heartbeat: Option<Duration>,
    pub intervals: VecDeque<Duration>,
    /// Heartbeats sent by this node.
    pub sent: u64,
}

impl_participant!(MonitoredNode);

impl MonitoredNode {
    fn new(id: ParticipantId, position: Position) -> Self {
        Self {
            id,
            health: Health::Healthy,
            position,
            liveness: Liveness::Alive,
            phi: 0.0,
            last_heartbeat: None,
            intervals: VecDeque::new(),
            sent: 0,
        }
    }

    fn mean_interval(&self) -> Option<Duration> {
        let count = u32::try_from(self.intervals.len()).ok().filter(|c| *c > 0)?;
        Some(self.intervals.iter().sum::<Duration>() / count)
    }
}

/// Observable summary of a failure-detector run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhiStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub alive: usize,
    pub suspect: usize,
    pub failed: usize,
    pub max_phi: f64,
}

/// One monitor watching a set of heartbeating nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiAccrual {
    config: PhiAccrualConfig,
    nodes: ParticipantRegistry<MonitoredNode>,
    pool: MessagePool<PhiMessage>,
    now: Duration,
}

impl PhiAccrual {
    pub fn new(config: PhiAccrualConfig) -> Self {
        let monitor = MonitoredNode::new(ParticipantId::from(MONITOR), Position::default());
        let nodes = (0..config.nodes).map(|i| {
            MonitoredNode::new(
                ParticipantId::indexed("node", i),
                Position::on_ring(i, config.nodes, 200.0),
            )
        });

        Self {
            nodes: ParticipantRegistry::from_participants(std::iter::once(monitor).chain(nodes)),
            config,
            pool: MessagePool::new(),
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&MonitoredNode> {
        self.nodes.get(id).filter(|n| n.id != MONITOR)
    }

    /// Current suspicion level of a node.
    pub fn phi(&self, id: &str) -> Option<f64> {
        self.node(id).map(|n| n.phi)
    }

    pub fn liveness(&self, id: &str) -> Option<Liveness> {
        self.node(id).map(|n| n.liveness)
    }

    fn monitored(&self) -> impl Iterator<Item = &MonitoredNode> {
        self.nodes.iter().filter(|n| n.id != MONITOR)
    }

    /// Recompute phi and liveness for every node that has heartbeated.
    fn evaluate(&mut self) {
        if !self.nodes.is_available(MONITOR) {
            return;
        }
        let now = self.now;
        let fallback = self.config.tick_interval;
        let (suspect, failure) = (self.config.suspect_threshold, self.config.failure_threshold);

        for node in self.nodes.iter_mut().filter(|n| n.id != MONITOR) {
            let Some(last) = node.last_heartbeat else {
                continue;
            };
            let mean = node.mean_interval().unwrap_or(fallback).as_secs_f64();
            let elapsed = now.saturating_sub(last).as_secs_f64();
            node.phi = if mean > 0.0 {
                elapsed / (mean * LN_10)
            } else {
                0.0
            };

            let verdict = if node.phi > failure {
                Liveness::Failed
            } else if node.phi > suspect {
                Liveness::Suspect
            } else {
                Liveness::Alive
            };
            // A node only becomes alive again on a fresh heartbeat.
            if verdict > node.liveness {
                if verdict == Liveness::Failed {
                    warn!(node = %node.id, phi = node.phi, "Node declared failed");
                } else {
                    info!(node = %node.id, phi = node.phi, "Node suspected");
                }
                node.liveness = verdict;
            }
        }
    }

    fn on_heartbeat(&mut self, from: &ParticipantId, seq: u64) {
        let now = self.now;
        let window = self.config.window_size;
        let Some(node) = self.nodes.get_mut(from) else {
            return;
        };
        if let Some(last) = node.last_heartbeat {
            let interval = now.saturating_sub(last);
            if !interval.is_zero() {
                node.intervals.push_back(interval);
                while node.intervals.len() > window {
                    node.intervals.pop_front();
                }
            }
        }
        node.last_heartbeat = Some(now);
        node.phi = 0.0;
        if node.liveness != Liveness::Alive {
            info!(node = %from, seq, "Heartbeat restored node to alive");
            node.liveness = Liveness::Alive;
        }
    }
}

impl ProtocolStateMachine for PhiAccrual {
    type Participant = MonitoredNode;
    type Payload = PhiMessage;
    type Stats = PhiStats;

    fn name(&self) -> &'static str {
        "phi-accrual"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<MonitoredNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<PhiMessage>> {
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

        let Message { from, payload, .. } = message;
        match payload {
            PhiMessage::Heartbeat { seq } => self.on_heartbeat(&from, seq),
        }
    }

    /// Healthy nodes heartbeat, then the monitor re-evaluates phi.
    fn tick(&mut self) {
        self.now += self.config.tick_interval;

        let monitor = ParticipantId::from(MONITOR);
        let mut beats = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.id != MONITOR) {
            if node.health.is_healthy() {
                node.sent += 1;
                beats.push((node.id.clone(), node.sent));
            }
        }
        for (from, seq) in beats {
            self.pool
                .send(&from, &monitor, PhiMessage::Heartbeat { seq }, self.now);
        }

        self.evaluate();
        debug!(now = ?self.now, "Failure detector evaluated");
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

    fn stats(&self) -> PhiStats {
        let count = |l: Liveness| self.monitored().filter(|n| n.liveness == l).count();
        PhiStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            alive: count(Liveness::Alive),
            suspect: count(Liveness::Suspect),
            failed: count(Liveness::Failed),
            max_phi: self.monitored().map(|n| n.phi).fold(0.0, f64::max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn detector() -> PhiAccrual {
        PhiAccrual::new(PhiAccrualConfig::default())
    }

    fn run(d: &mut PhiAccrual, ticks: usize) {
        for _ in 0..ticks {
            d.tick();
            d.deliver_all();
        }
    }

    #[test]
    fn test_steady_heartbeats_stay_alive() {
        let mut d = detector();
        run(&mut d, 20);

        let stats = d.stats();
        assert_eq!(stats.alive, 3);
        assert_eq!(stats.health.total, 4);
        assert_eq!(d.node("node-0").unwrap().intervals.len(), 10);
        assert_eq!(d.phi("node-0"), Some(0.0));
    }

    #[test]
    fn test_phi_grows_with_silence() {
        let mut d = detector();
        run(&mut d, 5);
        d.fail_node("node-1");

        d.tick();
        let one = d.phi("node-1").unwrap();
        d.tick();
        let two = d.phi("node-1").unwrap();

        assert!((one - 1.0 / LN_10).abs() < 1e-9);
        assert!((two - 2.0 / LN_10).abs() < 1e-9);
    }

    #[traced_test]
    #[test]
    fn test_silent_node_suspected_then_failed() {
        let mut d = detector();
        run(&mut d, 5);
        d.fail_node("node-1");

        run(&mut d, 8);
        assert_eq!(d.liveness("node-1"), Some(Liveness::Suspect));
        assert_eq!(d.liveness("node-0"), Some(Liveness::Alive));
        assert!(logs_contain("Node suspected"));

        run(&mut d, 12);
        assert_eq!(d.liveness("node-1"), Some(Liveness::Failed));
        assert_eq!(d.stats().failed, 1);
        assert!(logs_contain("Node declared failed"));
    }

    #[test]
    fn test_lower_thresholds_react_sooner() {
        let mut d = PhiAccrual::new(PhiAccrualConfig::default().with_thresholds(1.0, 2.0));
        run(&mut d, 5);
        d.fail_node("node-1");

        run(&mut d, 3);
        assert_eq!(d.liveness("node-1"), Some(Liveness::Suspect));
        run(&mut d, 2);
        assert_eq!(d.liveness("node-1"), Some(Liveness::Failed));
    }

    #[traced_test]
    #[test]
    fn test_heartbeat_restores_alive() {
        let mut d = detector();
        run(&mut d, 5);
        d.fail_node("node-1");
        run(&mut d, 20);
        assert_eq!(d.liveness("node-1"), Some(Liveness::Failed));

        d.recover_node("node-1");
        run(&mut d, 1);
        assert_eq!(d.liveness("node-1"), Some(Liveness::Alive));
        assert!(logs_contain("Heartbeat restored node to alive"));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut d = PhiAccrual::new(PhiAccrualConfig::default().with_window_size(3));
        run(&mut d, 10);
        assert_eq!(d.node("node-2").unwrap().intervals.len(), 3);
    }

    #[test]
    fn test_monitor_is_not_a_monitored_node() {
        let d = detector();
        assert!(d.node(MONITOR).is_none());
        assert_eq!(d.phi(MONITOR), None);
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut d = detector();
        run(&mut d, 3);
        d.fail_node("node-0");
        d.reset();
        assert_eq!(d, detector());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut d = detector();
        d.tick();
        let id = d.list_in_flight()[0];

        d.deliver(id);
        let after_first = d.clone();
        d.deliver(id);
        assert_eq!(d, after_first);
    }
}
