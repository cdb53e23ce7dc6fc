//! PBFT normal-case operation.
//!
//! `n = 3f + 1` replicas; the primary of view `v` is replica `v mod n`.
//!
//! ```text
//! client_request ─▶ primary ──PrePrepare──▶ backups
//!                   backups ──Prepare─────▶ all      prepared: pre-prepare + 2f prepares
//!                   all     ──Commit──────▶ all      committed: prepared + 2f+1 commits
//! ```
//!
//! View changes are not modelled: a failed primary stalls the cluster.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine, VoteTracker,
};
use distlab_types::{has_bft_quorum, Hash};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for a [`PbftCluster`].
#[derive(Debug, Clone, PartialEq)]
pub struct PbftConfig {
    /// Tolerated byzantine replicas. The cluster has `3f + 1` replicas.
    pub faults: usize,
    pub tick_interval: Duration,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            faults: 1,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl PbftConfig {
    pub fn new(faults: usize) -> Self {
        Self {
            faults,
            ..Default::default()
        }
    }

    pub fn replica_count(&self) -> usize {
        3 * self.faults + 1
    }
}

/// Per-sequence-number agreement state on one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub digest: Hash,
    pub operation: String,
    pub prepared: bool,
    pub committed: bool,
}

/// A PBFT replica.
#[derive(Debug, Clone, PartialEq)]
pub struct PbftReplica {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub view: u64,
    /// Sends corrupted digests when set.
    pub byzantine: bool,
    /// Accepted pre-prepares by sequence number.
    pub slots: BTreeMap<u64, Slot>,
    /// Operations committed, in sequence order of commitment.
    pub executed: Vec<String>,
    prepares: VoteTracker<(u64, Hash)>,
    commits: VoteTracker<(u64, Hash)>,
}

impl_participant!(PbftReplica);

impl PbftReplica {
    fn new(index: usize, count: usize) -> Self {
        Self {
            id: ParticipantId::indexed("replica", index),
            health: Health::Healthy,
            position: Position::on_ring(index, count, 200.0),
            view: 0,
            byzantine: false,
            slots: BTreeMap::new(),
            executed: Vec::new(),
            prepares: VoteTracker::new(),
            commits: VoteTracker::new(),
        }
    }

    /// Matching prepares recorded for a slot's digest.
    pub fn prepare_count(&self, seq: u64) -> usize {
        self.slots
            .get(&seq)
            .map_or(0, |slot| self.prepares.count(&(seq, slot.digest)))
    }

    /// Matching commits recorded for a slot's digest.
    pub fn commit_count(&self, seq: u64) -> usize {
        self.slots
            .get(&seq)
            .map_or(0, |slot| self.commits.count(&(seq, slot.digest)))
    }

    /// The digest this replica puts on outgoing messages.
    fn outgoing_digest(&self, digest: Hash) -> Hash {
        if self.byzantine {
            Hash::from_parts(&[b"forged", digest.as_bytes(), self.id.as_str().as_bytes()])
        } else {
            digest
        }
    }
}

/// PBFT messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PbftMessage {
    PrePrepare {
        view: u64,
        seq: u64,
        digest: Hash,
        operation: String,
    },
    Prepare {
        view: u64,
        seq: u64,
        digest: Hash,
    },
    Commit {
        view: u64,
        seq: u64,
        digest: Hash,
    },
}

impl Payload for PbftMessage {
    fn type_name(&self) -> &'static str {
        match self {
            PbftMessage::PrePrepare { .. } => "PrePrepare",
            PbftMessage::Prepare { .. } => "Prepare",
            PbftMessage::Commit { .. } => "Commit",
        }
    }
}

/// Observable summary of a PBFT cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PbftStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub view: u64,
    pub byzantine: usize,
    /// Honest replicas that committed at least one operation.
    pub honest_committed: usize,
    /// Highest number of operations executed by an honest replica.
    pub executed: usize,
}

/// A PBFT cluster in normal-case operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PbftCluster {
    config: PbftConfig,
    replicas: ParticipantRegistry<PbftReplica>,
    pool: MessagePool<PbftMessage>,
    next_seq: u64,
    now: Duration,
}

impl PbftCluster {
    pub fn new(config: PbftConfig) -> Self {
        let count = config.replica_count();
        Self {
            replicas: ParticipantRegistry::from_participants(
                (0..count).map(|i| PbftReplica::new(i, count)),
            ),
            config,
            pool: MessagePool::new(),
            next_seq: 1,
            now: Duration::ZERO,
        }
    }

    pub fn replica(&self, id: &str) -> Option<&PbftReplica> {
        self.replicas.get(id)
    }

    fn faults(&self) -> usize {
        self.config.faults
    }

    /// Id of the current primary (view 0 → `replica-0`).
    pub fn primary(&self) -> Option<ParticipantId> {
        let n = self.replicas.len().max(1);
        let view = self.replicas.iter().map(|r| r.view).max().unwrap_or(0);
        self.replicas
            .get_index((view % n as u64) as usize)
            .map(|r| r.id.clone())
    }

    /// Make a replica send conflicting digests from now on.
    pub fn make_byzantine(&mut self, id: &str) {
        if let Some(replica) = self.replicas.get_mut(id) {
            warn!(replica = id, "Replica turned byzantine");
            replica.byzantine = true;
        }
    }

    fn broadcast(&mut self, from: &ParticipantId, message: impl Fn(&ParticipantId) -> PbftMessage) {
        for peer in self.replicas.ids() {
            if peer != *from {
                let payload = message(&peer);
                self.pool.send(from, &peer, payload, self.now);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Normal case
    // ═══════════════════════════════════════════════════════════════════════

    /// Submit an operation to the primary.
    ///
    /// No-op when the primary is failed. A byzantine primary sends the real
    /// digest to even-indexed backups and a forged one to the rest.
    pub fn client_request(&mut self, operation: impl Into<String>) {
        let Some(primary) = self.primary() else {
            return;
        };
        if !self.replicas.is_available(&primary) {
            debug!(primary = %primary, "Primary unavailable, request dropped");
            return;
        }
        let operation = operation.into();
        let seq = self.next_seq;
        self.next_seq += 1;
        let digest = Hash::from_bytes(operation.as_bytes());

        let Some(replica) = self.replicas.get_mut(&primary) else {
            return;
        };
        let view = replica.view;
        let byzantine = replica.byzantine;
        replica.slots.insert(
            seq,
            Slot {
                digest,
                operation: operation.clone(),
                prepared: false,
                committed: false,
            },
        );
        info!(primary = %primary, seq, digest = %digest, "Pre-preparing request");

        let forged = replica.outgoing_digest(digest);
        let replicas = &self.replicas;
        let indices: BTreeMap<ParticipantId, usize> = replicas
            .ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        self.broadcast(&primary, |peer| PbftMessage::PrePrepare {
            view,
            seq,
            digest: if byzantine && indices.get(peer).is_some_and(|i| i % 2 == 1) {
                forged
            } else {
                digest
            },
            operation: operation.clone(),
        });
    }

    fn on_pre_prepare(
        &mut self,
        to: &ParticipantId,
        from: &ParticipantId,
        view: u64,
        seq: u64,
        digest: Hash,
        operation: String,
    ) {
        if self.primary().as_ref() != Some(from) {
            return;
        }
        let Some(replica) = self.replicas.get_mut(to) else {
            return;
        };
        if view != replica.view {
            return;
        }
        if let Some(existing) = replica.slots.get(&seq) {
            if existing.digest != digest {
                warn!(replica = %to, seq, "Conflicting pre-prepare ignored");
            }
            return;
        }
        // Digest must match the operation it claims to cover.
        if Hash::from_bytes(operation.as_bytes()) != digest {
            trace!(replica = %to, seq, "Pre-prepare digest mismatch");
            return;
        }

        replica.slots.insert(
            seq,
            Slot {
                digest,
                operation,
                prepared: false,
                committed: false,
            },
        );
        replica.prepares.add_vote((seq, digest), to.clone());
        let outgoing = replica.outgoing_digest(digest);
        trace!(replica = %to, seq, "Accepted pre-prepare");

        self.broadcast(to, |_| PbftMessage::Prepare {
            view,
            seq,
            digest: outgoing,
        });
        self.check_prepared(to, seq);
    }

    fn on_prepare(&mut self, to: &ParticipantId, from: ParticipantId, view: u64, seq: u64, digest: Hash) {
        let Some(replica) = self.replicas.get_mut(to) else {
            return;
        };
        if view != replica.view {
            return;
        }
        replica.prepares.add_vote((seq, digest), from);
        self.check_prepared(to, seq);
    }

    fn on_commit(&mut self, to: &ParticipantId, from: ParticipantId, view: u64, seq: u64, digest: Hash) {
        let Some(replica) = self.replicas.get_mut(to) else {
            return;
        };
        if view != replica.view {
            return;
        }
        replica.commits.add_vote((seq, digest), from);
        self.check_committed(to, seq);
    }

    /// Prepared: a pre-prepare plus 2f matching prepares.
    fn check_prepared(&mut self, id: &ParticipantId, seq: u64) {
        let threshold = 2 * self.faults();
        let Some(replica) = self.replicas.get_mut(id) else {
            return;
        };
        let count = replica.prepare_count(seq);
        let view = replica.view;
        let Some(slot) = replica.slots.get_mut(&seq) else {
            return;
        };
        if slot.prepared || count < threshold {
            return;
        }
        slot.prepared = true;
        let digest = slot.digest;
        replica.commits.add_vote((seq, digest), id.clone());
        let outgoing = replica.outgoing_digest(digest);
        debug!(replica = %id, seq, prepares = count, "Prepared");

        self.broadcast(id, |_| PbftMessage::Commit {
            view,
            seq,
            digest: outgoing,
        });
        self.check_committed(id, seq);
    }

    /// Committed: prepared plus 2f+1 matching commits.
    fn check_committed(&mut self, id: &ParticipantId, seq: u64) {
        let total = self.config.replica_count();
        let Some(replica) = self.replicas.get_mut(id) else {
            return;
        };
        let count = replica.commit_count(seq);
        let Some(slot) = replica.slots.get_mut(&seq) else {
            return;
        };
        if !slot.prepared || slot.committed || !has_bft_quorum(count, total) {
            return;
        }
        slot.committed = true;
        let operation = slot.operation.clone();
        info!(replica = %id, seq, operation = %operation, "Committed");
        replica.executed.push(operation);
    }

    /// Committed operation per sequence number across honest replicas.
    ///
    /// Two honest replicas committing different operations at one sequence
    /// number would be a safety violation; each entry lists what was seen.
    pub fn honest_commits(&self) -> BTreeMap<u64, Vec<String>> {
        let mut commits: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for replica in self.replicas.iter().filter(|r| !r.byzantine) {
            for (seq, slot) in &replica.slots {
                if slot.committed {
                    let ops = commits.entry(*seq).or_default();
                    if !ops.contains(&slot.operation) {
                        ops.push(slot.operation.clone());
                    }
                }
            }
        }
        commits
    }
}

impl ProtocolStateMachine for PbftCluster {
    type Participant = PbftReplica;
    type Payload = PbftMessage;
    type Stats = PbftStats;

    fn name(&self) -> &'static str {
        "pbft"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<PbftReplica> {
        self.replicas.list()
    }

    fn messages(&self) -> Vec<Message<PbftMessage>> {
        self.pool.messages()
    }

    fn list_in_flight(&self) -> Vec<MessageId> {
        self.pool.list_in_flight()
    }

    fn deliver(&mut self, id: MessageId) {
        let replicas = &self.replicas;
        let Some(message) = self.pool.deliver_if(id, |m| {
            replicas.is_available(&m.from) && replicas.is_available(&m.to)
        }) else {
            return;
        };

        let Message { from, to, payload, .. } = message;
        match payload {
            PbftMessage::PrePrepare {
                view,
                seq,
                digest,
                operation,
            } => self.on_pre_prepare(&to, &from, view, seq, digest, operation),
            PbftMessage::Prepare { view, seq, digest } => {
                self.on_prepare(&to, from, view, seq, digest)
            }
            PbftMessage::Commit { view, seq, digest } => {
                self.on_commit(&to, from, view, seq, digest)
            }
        }
    }

    fn tick(&mut self) {
        self.now += self.config.tick_interval;
    }

    fn fail_node(&mut self, id: &str) {
        if self.replicas.set_health(id, Health::Failed) {
            info!(replica = id, "Replica failed");
        }
    }

    fn recover_node(&mut self, id: &str) {
        if self.replicas.set_health(id, Health::Healthy) {
            info!(replica = id, "Replica recovered");
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn stats(&self) -> PbftStats {
        let honest = || self.replicas.iter().filter(|r| !r.byzantine);
        PbftStats {
            health: HealthStats::from_registry(&self.replicas),
            messages: self.pool.stats(),
            view: self.replicas.iter().map(|r| r.view).max().unwrap_or(0),
            byzantine: self.replicas.iter().filter(|r| r.byzantine).count(),
            honest_committed: honest().filter(|r| !r.executed.is_empty()).count(),
            executed: honest().map(|r| r.executed.len()).max().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn cluster() -> PbftCluster {
        PbftCluster::new(PbftConfig::default())
    }

    #[traced_test]
    #[test]
    fn test_normal_case_commits_everywhere() {
        let mut cluster = cluster();
        assert_eq!(cluster.primary(), Some(ParticipantId::from("replica-0")));

        cluster.client_request("SET x=1");
        assert_eq!(cluster.list_in_flight().len(), 3);
        cluster.deliver_all();

        for replica in cluster.participants() {
            assert_eq!(replica.executed, vec!["SET x=1".to_string()]);
            assert!(replica.slots[&1].prepared);
        }
        assert_eq!(cluster.stats().honest_committed, 4);
        assert!(logs_contain("Committed"));
    }

    #[test]
    fn test_prepared_needs_two_f_prepares() {
        let mut cluster = cluster();
        cluster.client_request("SET x=1");

        // Deliver pre-prepares only: each backup holds its own prepare.
        for id in cluster.list_in_flight() {
            cluster.deliver(id);
        }
        let backup = cluster.replica("replica-1").unwrap();
        assert_eq!(backup.prepare_count(1), 1);
        assert!(!backup.slots[&1].prepared);
    }

    #[test]
    fn test_tolerates_one_byzantine_backup() {
        let mut cluster = cluster();
        cluster.make_byzantine("replica-3");
        cluster.client_request("SET x=1");
        cluster.deliver_all();

        let commits = cluster.honest_commits();
        assert_eq!(commits[&1], vec!["SET x=1".to_string()]);
        assert_eq!(cluster.stats().honest_committed, 3);
        assert_eq!(cluster.stats().byzantine, 1);
    }

    #[test]
    fn test_byzantine_primary_cannot_split_commits() {
        let mut cluster = cluster();
        cluster.make_byzantine("replica-0");
        cluster.client_request("SET x=1");
        cluster.deliver_all();

        for ops in cluster.honest_commits().values() {
            assert!(ops.len() <= 1);
        }
    }

    #[test]
    fn test_failed_replica_within_bound() {
        let mut cluster = cluster();
        cluster.fail_node("replica-2");
        cluster.client_request("SET x=1");
        cluster.client_request("SET y=2");
        cluster.deliver_all();

        let replica = cluster.replica("replica-1").unwrap();
        assert_eq!(replica.executed.len(), 2);
        assert!(cluster.replica("replica-2").unwrap().executed.is_empty());
    }

    #[test]
    fn test_too_many_failures_stall() {
        let mut cluster = cluster();
        cluster.fail_node("replica-2");
        cluster.fail_node("replica-3");
        cluster.client_request("SET x=1");
        cluster.deliver_all();
        assert_eq!(cluster.stats().executed, 0);
    }

    #[test]
    fn test_failed_primary_stalls() {
        let mut cluster = cluster();
        cluster.fail_node("replica-0");
        cluster.client_request("SET x=1");
        assert!(cluster.list_in_flight().is_empty());
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut cluster = cluster();
        cluster.make_byzantine("replica-1");
        cluster.client_request("SET x=1");
        cluster.deliver_all();
        cluster.reset();
        assert_eq!(cluster, PbftCluster::new(PbftConfig::default()));
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut cluster = cluster();
        cluster.client_request("SET x=1");
        let id = cluster.list_in_flight()[0];

        cluster.deliver(id);
        let after_first = cluster.clone();
        cluster.deliver(id);
        assert_eq!(cluster, after_first);
    }
}
