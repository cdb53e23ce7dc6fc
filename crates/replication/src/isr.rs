//! Leader-based log replication with an in-sync replica set.
//!
//! Followers pull from the leader with `Fetch(offset)` on every tick. The
//! leader tracks each follower's log end offset and keeps the in-sync set
//! (ISR): followers that fall more than `max_lag` records behind for
//! `lag_ticks` consecutive ticks, or that fail, are removed and rejoin once
//! they catch up. A record is committed when every ISR member has it; the
//! high watermark is the minimum log end offset across the ISR.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for [`IsrLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct IsrConfig {
    /// Number of brokers, named `broker-0` onwards. `broker-0` starts as leader.
    pub brokers: usize,

    /// Records a follower may trail the leader by and still count as in sync.
    pub max_lag: usize,

    /// Consecutive lagging ticks before a follower is removed from the ISR.
    pub lag_ticks: u64,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for IsrConfig {
    fn default() -> Self {
        Self {
            brokers: 3,
            max_lag: 2,
            lag_ticks: 3,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl IsrConfig {
    pub fn new(brokers: usize) -> Self {
        Self {
            brokers,
            ..Default::default()
        }
    }

    pub fn with_max_lag(mut self, max_lag: usize) -> Self {
        self.max_lag = max_lag;
        self
    }

    pub fn with_lag_ticks(mut self, lag_ticks: u64) -> Self {
        self.lag_ticks = lag_ticks;
        self
    }
}

/// ISR log messages.
#[derive(Debug, Clone, PartialEq)]
pub enum IsrMessage {
    /// Follower asks for records from `offset` onwards.
    ///
    /// `epoch` is the leader epoch the follower last replicated from; a
    /// stale epoch makes the leader resend from the follower's
    /// `high_watermark` so any divergent suffix is overwritten.
    Fetch {
        offset: usize,
        epoch: u64,
        high_watermark: usize,
    },
    /// Records starting at `offset`, plus the leader's high watermark.
    FetchResponse {
        offset: usize,
        records: Vec<String>,
        high_watermark: usize,
        epoch: u64,
    },
}

impl Payload for IsrMessage {
    fn type_name(&self) -> &'static str {
        match self {
            IsrMessage::Fetch { .. } => "Fetch",
            IsrMessage::FetchResponse { .. } => "FetchResponse",
        }
    }
}

/// A broker holding one replica of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Broker {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub log: Vec<String>,
    /// This broker's view of the committed prefix.
    pub high_watermark: usize,
    /// Leader epoch this broker last replicated under.
    pub epoch: u64,
}

impl_participant!(Broker);

impl Broker {
    pub fn log_end_offset(&self) -> usize {
        self.log.len()
    }
}

/// Observable summary of an ISR log run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsrStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub leader: Option<ParticipantId>,
    pub isr: Vec<ParticipantId>,
    pub high_watermark: usize,
    pub log_end_offset: usize,
}

/// A replicated log with a single leader and an in-sync replica set.
#[derive(Debug, Clone, PartialEq)]
pub struct IsrLog {
    config: IsrConfig,
    nodes: ParticipantRegistry<Broker>,
    pool: MessagePool<IsrMessage>,
    leader: Option<ParticipantId>,
    /// Bumped on every leader change.
    epoch: u64,
    isr: BTreeSet<ParticipantId>,
    /// Leader's view of each follower's log end offset.
    follower_offsets: BTreeMap<ParticipantId, usize>,
    /// Consecutive ticks each ISR follower has been beyond `max_lag`.
    lagging_for: BTreeMap<ParticipantId, u64>,
    now: Duration,
}

impl IsrLog {
    pub fn new(config: IsrConfig) -> Self {
        let brokers: Vec<Broker> = (0..config.brokers)
            .map(|i| Broker {
                id: ParticipantId::indexed("broker", i),
                health: Health::Healthy,
                position: Position::on_ring(i, config.brokers, 200.0),
                log: Vec::new(),
                high_watermark: 0,
                epoch: 0,
            })
            .collect();
        let leader = brokers.first().map(|b| b.id.clone());
        let isr = brokers.iter().map(|b| b.id.clone()).collect();
        let follower_offsets = brokers.iter().skip(1).map(|b| (b.id.clone(), 0)).collect();

        Self {
            nodes: ParticipantRegistry::from_participants(brokers),
            config,
            pool: MessagePool::new(),
            leader,
            epoch: 0,
            isr,
            follower_offsets,
            lagging_for: BTreeMap::new(),
            now: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &IsrConfig {
        &self.config
    }

    pub fn broker(&self, id: &str) -> Option<&Broker> {
        self.nodes.get(id)
    }

    pub fn leader(&self) -> Option<&ParticipantId> {
        self.leader.as_ref()
    }

    pub fn isr(&self) -> &BTreeSet<ParticipantId> {
        &self.isr
    }

    /// Leader's high watermark, 0 without a leader.
    pub fn high_watermark(&self) -> usize {
        self.leader
            .as_deref()
            .and_then(|id| self.nodes.get(id))
            .map_or(0, |b| b.high_watermark)
    }

    /// Records every ISR member holds.
    pub fn committed(&self) -> Vec<String> {
        let hw = self.high_watermark();
        self.leader
            .as_deref()
            .and_then(|id| self.nodes.get(id))
            .map(|b| b.log[..hw.min(b.log.len())].to_vec())
            .unwrap_or_default()
    }

    /// Append a record to the leader's log.
    ///
    /// No-op without an available leader.
    pub fn produce(&mut self, record: impl Into<String>) {
        let Some(leader) = self.available_leader() else {
            debug!("No available leader, record dropped");
            return;
        };
        let record = record.into();
        if let Some(broker) = self.nodes.get_mut(&leader) {
            broker.log.push(record);
            debug!(leader = %leader, offset = broker.log.len() - 1, "Record produced");
        }
        self.advance_high_watermark();
    }

    fn available_leader(&self) -> Option<ParticipantId> {
        self.leader
            .clone()
            .filter(|id| self.nodes.is_available(id))
    }

    fn leader_log_end(&self) -> usize {
        self.leader
            .as_deref()
            .and_then(|id| self.nodes.get(id))
            .map_or(0, Broker::log_end_offset)
    }

    /// Recompute the leader's high watermark from the ISR offsets.
    fn advance_high_watermark(&mut self) {
        let Some(leader) = self.leader.clone() else {
            return;
        };
        let leader_end = self.leader_log_end();
        let hw = self
            .isr
            .iter()
            .filter(|id| **id != leader)
            .map(|id| self.follower_offsets.get(id).copied().unwrap_or(0))
            .fold(leader_end, usize::min);

        if let Some(broker) = self.nodes.get_mut(&leader) {
            if hw > broker.high_watermark {
                trace!(leader = %leader, high_watermark = hw, "High watermark advanced");
                broker.high_watermark = hw;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ISR maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Shrink the ISR by failed or persistently lagging followers.
    fn check_isr(&mut self) {
        let Some(leader) = self.leader.clone() else {
            return;
        };
        let leader_end = self.leader_log_end();
        let followers: Vec<ParticipantId> =
            self.isr.iter().filter(|id| **id != leader).cloned().collect();

        for follower in followers {
            if !self.nodes.is_available(&follower) {
                self.shrink(&follower, "failed");
                continue;
            }
            let offset = self.follower_offsets.get(&follower).copied().unwrap_or(0);
            if leader_end.saturating_sub(offset) > self.config.max_lag {
                let ticks = self.lagging_for.entry(follower.clone()).or_insert(0);
                *ticks += 1;
                if *ticks >= self.config.lag_ticks {
                    self.shrink(&follower, "lagging");
                }
            } else {
                self.lagging_for.remove(&follower);
            }
        }
        self.advance_high_watermark();
    }

    fn shrink(&mut self, follower: &ParticipantId, reason: &str) {
        if self.isr.remove(follower) {
            self.lagging_for.remove(follower);
            warn!(follower = %follower, reason, "Follower removed from ISR");
        }
    }

    /// Promote the first healthy ISR follower when the leader is down.
    ///
    /// The new leader truncates to the committed prefix so acknowledged
    /// records survive and uncommitted ones are discarded everywhere.
    fn elect_if_needed(&mut self) {
        if self.available_leader().is_some() {
            return;
        }
        let old = self.leader.clone();
        let hw = self.high_watermark();
        let candidate = self
            .isr
            .iter()
            .find(|id| Some(*id) != old.as_ref() && self.nodes.is_available(id))
            .cloned();

        let Some(new_leader) = candidate else {
            if self.leader.is_some() {
                warn!("No in-sync follower available, log is offline");
            }
            return;
        };

        if let Some(old) = &old {
            self.isr.remove(old);
        }
        self.epoch += 1;
        let epoch = self.epoch;
        if let Some(broker) = self.nodes.get_mut(&new_leader) {
            broker.log.truncate(hw.max(broker.high_watermark).min(broker.log.len()));
            broker.high_watermark = broker.log.len();
            broker.epoch = epoch;
        }
        self.follower_offsets = self
            .nodes
            .ids()
            .into_iter()
            .filter(|id| *id != new_leader)
            .map(|id| (id, 0))
            .collect();
        self.isr = BTreeSet::from([new_leader.clone()]);
        self.lagging_for.clear();
        self.leader = Some(new_leader.clone());
        info!(leader = %new_leader, epoch, "New leader elected from ISR");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_fetch(
        &mut self,
        from: ParticipantId,
        to: ParticipantId,
        offset: usize,
        epoch: u64,
        follower_hw: usize,
    ) {
        if self.leader.as_ref() != Some(&to) {
            trace!(broker = %to, "Fetch to non-leader ignored");
            return;
        }
        let Some(leader) = self.nodes.get(&to) else {
            return;
        };
        let offset = if epoch == self.epoch {
            offset
        } else {
            debug!(
                follower = %from,
                epoch,
                current = self.epoch,
                "Stale epoch, resending from high watermark"
            );
            offset.min(follower_hw)
        };
        let start = offset.min(leader.log.len());
        let records = leader.log[start..].to_vec();
        let leader_end = leader.log.len();

        self.follower_offsets.insert(from.clone(), start);
        if leader_end.saturating_sub(start) <= self.config.max_lag {
            self.lagging_for.remove(&from);
        }
        if !self.isr.contains(&from) && start >= leader_end {
            self.isr.insert(from.clone());
            self.lagging_for.remove(&from);
            info!(follower = %from, "Follower rejoined ISR");
        }
        self.advance_high_watermark();

        let high_watermark = self.high_watermark();
        self.pool.send(
            &to,
            &from,
            IsrMessage::FetchResponse {
                offset: start,
                records,
                high_watermark,
                epoch: self.epoch,
            },
            self.now,
        );
    }

    fn on_fetch_response(
        &mut self,
        from: ParticipantId,
        to: ParticipantId,
        offset: usize,
        records: Vec<String>,
        high_watermark: usize,
        epoch: u64,
    ) {
        if self.leader.as_ref() != Some(&from) {
            return;
        }
        let Some(broker) = self.nodes.get_mut(&to) else {
            return;
        };
        if offset > broker.log.len() {
            return;
        }
        // Anything past the leader's offset is divergent and goes.
        broker.log.truncate(offset);
        broker.log.extend(records);
        broker.high_watermark = high_watermark.min(broker.log.len());
        broker.epoch = epoch;
        trace!(
            follower = %to,
            log_end = broker.log.len(),
            high_watermark = broker.high_watermark,
            "Fetched"
        );
    }
}

impl ProtocolStateMachine for IsrLog {
    type Participant = Broker;
    type Payload = IsrMessage;
    type Stats = IsrStats;

    fn name(&self) -> &'static str {
        "isr"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<Broker> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<IsrMessage>> {
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
            IsrMessage::Fetch {
                offset,
                epoch,
                high_watermark,
            } => self.on_fetch(from, to, offset, epoch, high_watermark),
            IsrMessage::FetchResponse {
                offset,
                records,
                high_watermark,
                epoch,
            } => self.on_fetch_response(from, to, offset, records, high_watermark, epoch),
        }
    }

    /// Elect a new leader if needed, check the ISR, then have every healthy
    /// follower fetch.
    fn tick(&mut self) {
        self.now += self.config.tick_interval;

        self.elect_if_needed();
        self.check_isr();

        let Some(leader) = self.available_leader() else {
            return;
        };
        let fetches: Vec<(ParticipantId, IsrMessage)> = self
            .nodes
            .iter()
            .filter(|b| b.id != leader && b.health.is_healthy())
            .map(|b| {
                let fetch = IsrMessage::Fetch {
                    offset: b.log_end_offset(),
                    epoch: b.epoch,
                    high_watermark: b.high_watermark,
                };
                (b.id.clone(), fetch)
            })
            .collect();
        for (follower, fetch) in fetches {
            self.pool.send(&follower, &leader, fetch, self.now);
        }
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

    fn stats(&self) -> IsrStats {
        IsrStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            leader: self.leader.clone(),
            isr: self.isr.iter().cloned().collect(),
            high_watermark: self.high_watermark(),
            log_end_offset: self.leader_log_end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn log() -> IsrLog {
        IsrLog::new(IsrConfig::default())
    }

    /// Tick, then deliver fetches and their responses.
    fn round(isr: &mut IsrLog) {
        isr.tick();
        isr.deliver_all();
    }

    #[test]
    fn test_leader_only_commit_waits_for_followers() {
        let mut isr = log();
        isr.produce("a");
        isr.produce("b");
        assert_eq!(isr.stats().log_end_offset, 2);
        assert_eq!(isr.high_watermark(), 0);

        // First round ships the records, second reports the new offsets.
        round(&mut isr);
        round(&mut isr);
        assert_eq!(isr.high_watermark(), 2);
        assert_eq!(isr.committed(), vec!["a", "b"]);
        assert_eq!(isr.broker("broker-2").unwrap().log, vec!["a", "b"]);
        assert_eq!(isr.broker("broker-2").unwrap().high_watermark, 2);
    }

    #[traced_test]
    #[test]
    fn test_failed_follower_leaves_isr_and_unblocks_commit() {
        let mut isr = log();
        isr.fail_node("broker-2");
        isr.produce("a");
        round(&mut isr);

        assert!(!isr.isr().contains("broker-2"));
        assert!(logs_contain("Follower removed from ISR"));

        round(&mut isr);
        assert_eq!(isr.high_watermark(), 1);
    }

    #[traced_test]
    #[test]
    fn test_lagging_follower_shrinks_then_rejoins() {
        let mut isr = IsrLog::new(IsrConfig::default().with_max_lag(1));
        for record in ["a", "b", "c"] {
            isr.produce(record);
        }

        // Starve broker-2 of fetch responses.
        for _ in 0..3 {
            isr.tick();
            let ids: Vec<_> = isr
                .pool
                .in_flight()
                .filter(|m| m.from == "broker-2" || m.to == "broker-2")
                .map(|m| m.id)
                .collect();
            for id in ids {
                isr.pool.drop_message(id);
            }
            isr.deliver_all();
        }
        assert!(!isr.isr().contains("broker-2"));
        assert!(isr.isr().contains("broker-1"));
        assert_eq!(isr.high_watermark(), 3);

        round(&mut isr);
        round(&mut isr);
        assert!(isr.isr().contains("broker-2"));
        assert!(logs_contain("Follower rejoined ISR"));
    }

    #[traced_test]
    #[test]
    fn test_leader_failover_keeps_committed_records() {
        let mut isr = log();
        isr.produce("a");
        round(&mut isr);
        round(&mut isr);
        assert_eq!(isr.high_watermark(), 1);

        // Uncommitted on the old leader only.
        isr.produce("b");
        isr.fail_node("broker-0");
        isr.tick();

        assert_eq!(isr.leader().map(|l| l.as_str()), Some("broker-1"));
        assert!(logs_contain("New leader elected from ISR"));
        assert_eq!(isr.committed(), vec!["a"]);

        isr.produce("c");
        isr.deliver_all();
        round(&mut isr);
        round(&mut isr);
        assert_eq!(isr.broker("broker-2").unwrap().log, vec!["a", "c"]);

        // The old leader truncates its divergent record after recovering.
        isr.recover_node("broker-0");
        round(&mut isr);
        round(&mut isr);
        assert_eq!(isr.broker("broker-0").unwrap().log, vec!["a", "c"]);
        assert!(isr.isr().contains("broker-0"));
    }

    #[test]
    fn test_produce_without_leader_is_noop() {
        let mut isr = IsrLog::new(IsrConfig::new(1));
        isr.fail_node("broker-0");
        isr.produce("a");
        isr.tick();
        assert_eq!(isr.broker("broker-0").unwrap().log.len(), 0);
        assert_eq!(isr.stats().leader.as_ref().map(|l| l.as_str()), Some("broker-0"));
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut isr = log();
        isr.produce("a");
        round(&mut isr);
        isr.reset();
        assert_eq!(isr, log());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut isr = log();
        isr.produce("a");
        isr.tick();
        let id = isr.list_in_flight()[0];

        isr.deliver(id);
        let after_first = isr.clone();
        isr.deliver(id);
        assert_eq!(isr, after_first);
    }
}
