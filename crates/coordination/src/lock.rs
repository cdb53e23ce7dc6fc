//! Lock server with leases and fencing tokens.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Id of the lock server participant.
pub const LOCK_SERVER: &str = "lock-server";

/// Id of the storage participant that checks fencing tokens.
pub const STORAGE: &str = "storage";

/// Configuration for [`LockService`].
#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    /// Number of clients, named `client-0` onwards.
    pub clients: usize,

    /// Ticks a lease lasts without being released.
    pub lease_ticks: u64,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            clients: 3,
            lease_ticks: 5,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl LockConfig {
    pub fn new(clients: usize) -> Self {
        Self {
            clients,
            ..Default::default()
        }
    }

    pub fn with_lease_ticks(mut self, ticks: u64) -> Self {
        self.lease_ticks = ticks;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockMessage {
    Acquire,
    Grant { token: u64 },
    Release { token: u64 },
    Write { token: u64, value: String },
    WriteResult { token: u64, accepted: bool },
}

impl Payload for LockMessage {
    fn type_name(&self) -> &'static str {
        match self {
            LockMessage::Acquire => "Acquire",
            LockMessage::Grant { .. } => "Grant",
            LockMessage::Release { .. } => "Release",
            LockMessage::Write { .. } => "Write",
            LockMessage::WriteResult { .. } => "WriteResult",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRole {
    Server,
    Storage,
    Client,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    pub role: LockRole,
    /// Client: the token it believes it holds. May be stale.
    pub token: Option<u64>,
}

impl_participant!(LockNode);

/// The server's record of who holds the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub holder: ParticipantId,
    pub token: u64,
    /// Tick at which the lease lapses.
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    pub lease: Option<Lease>,
    pub waiting: Vec<ParticipantId>,
    pub tokens_issued: u64,
    pub expirations: usize,
    pub accepted_writes: usize,
    pub rejected_writes: usize,
    /// Last value accepted by storage.
    pub value: Option<String>,
}

/// A lock server, a fenced storage node and a set of clients.
#[derive(Debug, Clone, PartialEq)]
pub struct LockService {
    config: LockConfig,
    nodes: ParticipantRegistry<LockNode>,
    pool: MessagePool<LockMessage>,
    lease: Option<Lease>,
    waiting: VecDeque<ParticipantId>,
    /// Last token handed out; tokens start at 1.
    last_token: u64,
    /// Highest token storage has accepted a write for.
    highest_seen: u64,
    value: Option<String>,
    expirations: usize,
    accepted_writes: usize,
    rejected_writes: usize,
    ticks: u64,
    now: Duration,
}

impl LockService {
    pub fn new(config: LockConfig) -> Self {
        let count = config.clients + 1;
        let node = |id: ParticipantId, role, position| LockNode {
            id,
            health: Health::Healthy,
            position,
            role,
            token: None,
        };
        let server = node(
            ParticipantId::from(LOCK_SERVER),
            LockRole::Server,
            Position::default(),
        );
        let storage = node(
            ParticipantId::from(STORAGE),
            LockRole::Storage,
            Position::on_ring(0, count, 200.0),
        );
        let clients = (0..config.clients).map(|i| {
            node(
                ParticipantId::indexed("client", i),
                LockRole::Client,
                Position::on_ring(i + 1, count, 200.0),
            )
        });

        Self {
            nodes: ParticipantRegistry::from_participants(
                [server, storage].into_iter().chain(clients),
            ),
            config,
            pool: MessagePool::new(),
            lease: None,
            waiting: VecDeque::new(),
            last_token: 0,
            highest_seen: 0,
            value: None,
            expirations: 0,
            accepted_writes: 0,
            rejected_writes: 0,
            ticks: 0,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&LockNode> {
        self.nodes.get(id)
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Value last accepted by storage.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn client(&self, id: &str) -> Option<&LockNode> {
        self.nodes
            .get(id)
            .filter(|n| n.role == LockRole::Client && n.health.is_healthy())
    }

    /// Ask the lock server for the lock.
    pub fn acquire(&mut self, client: &str) {
        let Some(node) = self.client(client) else {
            debug!(client, "Acquire from unavailable client ignored");
            return;
        };
        let from = node.id.clone();
        self.pool
            .send(&from, &ParticipantId::from(LOCK_SERVER), LockMessage::Acquire, self.now);
    }

    /// Give the lock back. No-op if the client holds no token.
    pub fn release(&mut self, client: &str) {
        let Some(node) = self.client(client) else {
            return;
        };
        let Some(token) = node.token else {
            debug!(client, "Release without a token ignored");
            return;
        };
        let from = node.id.clone();
        if let Some(node) = self.nodes.get_mut(client) {
            node.token = None;
        }
        self.pool.send(
            &from,
            &ParticipantId::from(LOCK_SERVER),
            LockMessage::Release { token },
            self.now,
        );
    }

    /// Write to storage under the client's current token.
    pub fn write(&mut self, client: &str, value: impl Into<String>) {
        let Some(node) = self.client(client) else {
            return;
        };
        let Some(token) = node.token else {
            debug!(client, "Write without a token ignored");
            return;
        };
        let from = node.id.clone();
        self.pool.send(
            &from,
            &ParticipantId::from(STORAGE),
            LockMessage::Write {
                token,
                value: value.into(),
            },
            self.now,
        );
    }

    fn grant(&mut self, holder: ParticipantId) {
        self.last_token += 1;
        let token = self.last_token;
        let expires_at = self.ticks + self.config.lease_ticks;
        info!(holder = %holder, token, expires_at, "Lock granted");
        self.pool.send(
            &ParticipantId::from(LOCK_SERVER),
            &holder,
            LockMessage::Grant { token },
            self.now,
        );
        self.lease = Some(Lease {
            holder,
            token,
            expires_at,
        });
    }

    fn grant_next(&mut self) {
        if self.lease.is_some() {
            return;
        }
        if let Some(next) = self.waiting.pop_front() {
            self.grant(next);
        }
    }

    fn on_acquire(&mut self, client: ParticipantId) {
        let holds = self.lease.as_ref().is_some_and(|l| l.holder == client);
        if holds || self.waiting.contains(&client) {
            trace!(client = %client, "Duplicate acquire ignored");
            return;
        }
        if self.lease.is_none() {
            self.grant(client);
        } else {
            debug!(client = %client, position = self.waiting.len(), "Client queued");
            self.waiting.push_back(client);
        }
    }

    fn on_release(&mut self, client: ParticipantId, token: u64) {
        match &self.lease {
            Some(lease) if lease.holder == client && lease.token == token => {
                info!(client = %client, token, "Lock released");
                self.lease = None;
                self.grant_next();
            }
            _ => debug!(client = %client, token, "Release of a lapsed lease ignored"),
        }
    }

    fn on_write(&mut self, client: ParticipantId, token: u64, value: String) {
        let accepted = token >= self.highest_seen;
        if accepted {
            self.highest_seen = token;
            self.value = Some(value);
            self.accepted_writes += 1;
            debug!(client = %client, token, "Write accepted");
        } else {
            self.rejected_writes += 1;
            warn!(
                client = %client,
                token,
                highest = self.highest_seen,
                "Stale fencing token rejected"
            );
        }
        self.pool.send(
            &ParticipantId::from(STORAGE),
            &client,
            LockMessage::WriteResult { token, accepted },
            self.now,
        );
    }
}

impl ProtocolStateMachine for LockService {
    type Participant = LockNode;
    type Payload = LockMessage;
    type Stats = LockStats;

    fn name(&self) -> &'static str {
        "lock"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<LockNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<LockMessage>> {
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
            LockMessage::Acquire => self.on_acquire(from),
            LockMessage::Release { token } => self.on_release(from, token),
            LockMessage::Write { token, value } => self.on_write(from, token, value),
            LockMessage::Grant { token } => {
                if let Some(client) = self.nodes.get_mut(&to) {
                    client.token = Some(token);
                }
            }
            LockMessage::WriteResult { token, accepted } => {
                if let Some(client) = self.nodes.get_mut(&to) {
                    if !accepted && client.token == Some(token) {
                        debug!(client = %to, token, "Client learned its token is stale");
                        client.token = None;
                    }
                }
            }
        }
    }

    /// Expire the current lease once `lease_ticks` have passed and hand the
    /// lock to the next waiting client. Leases do not lapse while the
    /// server is failed.
    fn tick(&mut self) {
        self.now += self.config.tick_interval;
        self.ticks += 1;

        if !self.nodes.is_available(LOCK_SERVER) {
            return;
        }
        let expired = self
            .lease
            .as_ref()
            .is_some_and(|l| l.expires_at <= self.ticks);
        if expired {
            if let Some(lease) = self.lease.take() {
                info!(holder = %lease.holder, token = lease.token, "Lease expired");
            }
            self.expirations += 1;
            self.grant_next();
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

    fn stats(&self) -> LockStats {
        LockStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            lease: self.lease.clone(),
            waiting: self.waiting.iter().cloned().collect(),
            tokens_issued: self.last_token,
            expirations: self.expirations,
            accepted_writes: self.accepted_writes,
            rejected_writes: self.rejected_writes,
            value: self.value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn service() -> LockService {
        LockService::new(LockConfig::default())
    }

    fn token_of(s: &LockService, client: &str) -> Option<u64> {
        s.node(client).and_then(|n| n.token)
    }

    #[test]
    fn test_first_acquire_is_granted() {
        let mut s = service();
        s.acquire("client-0");
        s.deliver_all();
        assert_eq!(token_of(&s, "client-0"), Some(1));
        assert_eq!(s.lease().map(|l| l.holder.as_str()), Some("client-0"));
    }

    #[test]
    fn test_release_passes_lock_to_next_waiter() {
        let mut s = service();
        s.acquire("client-0");
        s.deliver_all();
        s.acquire("client-1");
        s.acquire("client-2");
        s.deliver_all();
        assert_eq!(s.stats().waiting.len(), 2);
        assert_eq!(token_of(&s, "client-1"), None);

        s.release("client-0");
        s.deliver_all();
        assert_eq!(token_of(&s, "client-0"), None);
        assert_eq!(token_of(&s, "client-1"), Some(2));
        assert_eq!(s.stats().waiting, vec![ParticipantId::from("client-2")]);
    }

    #[traced_test]
    #[test]
    fn test_lease_expires_after_lease_ticks() {
        let mut s = service();
        s.acquire("client-0");
        s.deliver_all();
        s.acquire("client-1");
        s.deliver_all();

        for _ in 0..4 {
            s.tick();
        }
        assert_eq!(s.lease().map(|l| l.token), Some(1));

        s.tick();
        s.deliver_all();
        assert!(logs_contain("Lease expired"));
        assert_eq!(s.lease().map(|l| l.holder.as_str()), Some("client-1"));
        assert_eq!(token_of(&s, "client-1"), Some(2));
        assert_eq!(s.stats().expirations, 1);
    }

    #[traced_test]
    #[test]
    fn test_paused_client_write_is_fenced() {
        let mut s = service();
        s.acquire("client-0");
        s.deliver_all();

        // client-0 stalls long enough for its lease to lapse.
        s.fail_node("client-0");
        s.acquire("client-1");
        s.deliver_all();
        for _ in 0..5 {
            s.tick();
        }
        s.deliver_all();
        s.write("client-1", "fresh");
        s.deliver_all();
        assert_eq!(s.value(), Some("fresh"));

        // It wakes up still believing it holds token 1.
        s.recover_node("client-0");
        assert_eq!(token_of(&s, "client-0"), Some(1));
        s.write("client-0", "stale");
        s.deliver_all();

        assert_eq!(s.value(), Some("fresh"));
        assert_eq!(s.stats().rejected_writes, 1);
        assert_eq!(token_of(&s, "client-0"), None);
        assert!(logs_contain("Stale fencing token rejected"));
    }

    #[test]
    fn test_stale_release_does_not_free_new_lease() {
        let mut s = LockService::new(LockConfig::default().with_lease_ticks(1));
        s.acquire("client-0");
        s.deliver_all();
        s.acquire("client-1");
        s.deliver_all();
        s.tick();
        s.deliver_all();
        assert_eq!(token_of(&s, "client-1"), Some(2));

        s.release("client-0");
        s.deliver_all();
        assert_eq!(s.lease().map(|l| l.token), Some(2));
    }

    #[test]
    fn test_tokens_increase_monotonically() {
        let mut s = service();
        let mut tokens = Vec::new();
        for client in ["client-0", "client-1", "client-2", "client-0"] {
            s.acquire(client);
            s.deliver_all();
            tokens.push(token_of(&s, client).unwrap());
            s.release(client);
            s.deliver_all();
        }
        assert_eq!(tokens, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut s = service();
        s.acquire("client-0");
        s.tick();
        s.reset();
        assert_eq!(s, service());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut s = service();
        s.acquire("client-0");
        let id = s.list_in_flight()[0];

        s.deliver(id);
        let after_first = s.clone();
        s.deliver(id);
        assert_eq!(s, after_first);
    }
}
