//! Message pool: owns the lifecycle of protocol messages.

use crate::{Message, MessageStats, MessageStatus, Payload};
use distlab_types::{MessageId, ParticipantId};
use indexmap::IndexMap;
use std::time::Duration;
use tracing::trace;

/// Pool of protocol messages, insertion ordered.
///
/// Creation (`send`) is decoupled from delivery so a message is visibly in
/// flight before its effect is applied. The pool never validates participant
/// ids and never calls back into its owner: the owning state machine claims a
/// message with [`deliver_if`](Self::deliver_if) and applies it itself.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePool<P> {
    messages: IndexMap<MessageId, Message<P>>,
    next_id: u64,
}

impl<P> Default for MessagePool<P> {
    fn default() -> Self {
        Self {
            messages: IndexMap::new(),
            next_id: 0,
        }
    }
}

impl<P: Payload> MessagePool<P> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an in-flight message and return its id.
    pub fn send(
        &mut self,
        from: &ParticipantId,
        to: &ParticipantId,
        payload: P,
        now: Duration,
    ) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;

        trace!(
            id = %id,
            from = %from,
            to = %to,
            kind = payload.type_name(),
            "Message sent"
        );

        self.messages.insert(
            id,
            Message {
                id,
                from: from.clone(),
                to: to.clone(),
                payload,
                status: MessageStatus::InFlight,
                sent_at: now,
            },
        );
        id
    }

    /// Resolve an in-flight message.
    ///
    /// If `accept` holds the message becomes `Delivered` and a copy is
    /// returned for the owner to apply; otherwise it becomes `Dropped` and
    /// `None` is returned. Unknown or already terminal ids return `None` and
    /// change nothing, so delivery is idempotent.
    pub fn deliver_if(
        &mut self,
        id: MessageId,
        accept: impl FnOnce(&Message<P>) -> bool,
    ) -> Option<Message<P>> {
        let message = self.messages.get_mut(&id)?;
        if message.status.is_terminal() {
            trace!(id = %id, status = ?message.status, "Ignoring stale delivery");
            return None;
        }

        if accept(message) {
            message.status = MessageStatus::Delivered;
            Some(message.clone())
        } else {
            trace!(id = %id, from = %message.from, to = %message.to, "Message dropped");
            message.status = MessageStatus::Dropped;
            None
        }
    }

    /// Mark an in-flight message as delivered and return a copy of it.
    pub fn take_for_delivery(&mut self, id: MessageId) -> Option<Message<P>> {
        self.deliver_if(id, |_| true)
    }

    /// Mark an in-flight message as dropped. Returns false if it was not in flight.
    pub fn drop_message(&mut self, id: MessageId) -> bool {
        match self.messages.get_mut(&id) {
            Some(message) if !message.status.is_terminal() => {
                message.status = MessageStatus::Dropped;
                true
            }
            _ => false,
        }
    }

    /// Look up a message by id.
    pub fn get(&self, id: MessageId) -> Option<&Message<P>> {
        self.messages.get(&id)
    }

    /// Ids of all in-flight messages, in send order.
    pub fn list_in_flight(&self) -> Vec<MessageId> {
        self.in_flight().map(|m| m.id).collect()
    }

    /// Iterate over in-flight messages, in send order.
    pub fn in_flight(&self) -> impl Iterator<Item = &Message<P>> {
        self.messages.values().filter(|m| m.is_in_flight())
    }

    /// Defensive copy of every message, in send order.
    pub fn messages(&self) -> Vec<Message<P>> {
        self.messages.values().cloned().collect()
    }

    /// Count messages by status.
    pub fn stats(&self) -> MessageStats {
        let mut stats = MessageStats {
            total: self.messages.len(),
            ..Default::default()
        };
        for message in self.messages.values() {
            match message.status {
                MessageStatus::InFlight => stats.in_flight += 1,
                MessageStatus::Delivered => stats.delivered += 1,
                MessageStatus::Dropped => stats.dropped += 1,
            }
        }
        stats
    }

    /// Forget delivered and dropped messages. Returns how many were removed.
    ///
    /// Pruned ids behave like unknown ids afterwards.
    pub fn prune_terminal(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, m| m.is_in_flight());
        before - self.messages.len()
    }

    /// Number of messages held, in any status.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the pool holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Clear all messages and restart id allocation.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        Ping(u32),
        Pong,
    }

    impl Payload for Ping {
        fn type_name(&self) -> &'static str {
            match self {
                Ping::Ping(_) => "Ping",
                Ping::Pong => "Pong",
            }
        }
    }

    fn ids() -> (ParticipantId, ParticipantId) {
        (ParticipantId::from("a"), ParticipantId::from("b"))
    }

    #[test]
    fn test_send_creates_in_flight_message() {
        let (a, b) = ids();
        let mut pool = MessagePool::new();
        let id = pool.send(&a, &b, Ping::Ping(1), Duration::from_millis(5));

        let message = pool.get(id).unwrap();
        assert_eq!(message.status, MessageStatus::InFlight);
        assert_eq!(message.type_name(), "Ping");
        assert_eq!(message.sent_at, Duration::from_millis(5));
        assert_eq!(pool.list_in_flight(), vec![id]);
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let (a, b) = ids();
        let mut pool = MessagePool::new();
        let id = pool.send(&a, &b, Ping::Ping(1), Duration::ZERO);

        assert!(pool.take_for_delivery(id).is_some());
        let after_first = pool.clone();

        assert!(pool.take_for_delivery(id).is_none());
        assert_eq!(pool, after_first);
        assert!(pool.take_for_delivery(MessageId(99)).is_none());
    }

    #[traced_test]
    #[test]
    fn test_rejected_delivery_drops_message() {
        let (a, b) = ids();
        let mut pool = MessagePool::new();
        let id = pool.send(&a, &b, Ping::Pong, Duration::ZERO);

        assert!(pool.deliver_if(id, |m| m.to == "c").is_none());
        assert_eq!(pool.get(id).unwrap().status, MessageStatus::Dropped);

        // A dropped message can never be delivered later.
        assert!(pool.take_for_delivery(id).is_none());
        assert!(!pool.drop_message(id));
        assert!(logs_contain("Message dropped"));
    }

    #[test]
    fn test_in_flight_preserves_send_order() {
        let (a, b) = ids();
        let mut pool = MessagePool::new();
        let first = pool.send(&a, &b, Ping::Ping(1), Duration::ZERO);
        let second = pool.send(&b, &a, Ping::Pong, Duration::ZERO);
        let third = pool.send(&a, &b, Ping::Ping(2), Duration::ZERO);

        pool.take_for_delivery(second);
        assert_eq!(pool.list_in_flight(), vec![first, third]);

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_prune_and_reset() {
        let (a, b) = ids();
        let mut pool = MessagePool::new();
        let first = pool.send(&a, &b, Ping::Ping(1), Duration::ZERO);
        pool.send(&a, &b, Ping::Ping(2), Duration::ZERO);
        pool.take_for_delivery(first);

        assert_eq!(pool.prune_terminal(), 1);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_for_delivery(first).is_none());

        pool.reset();
        assert!(pool.is_empty());
        assert_eq!(pool, MessagePool::new());
        assert_eq!(pool.send(&a, &b, Ping::Pong, Duration::ZERO), MessageId(0));
    }
}
