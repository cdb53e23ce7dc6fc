//! Core trait for protocol state machines.

use crate::{Message, Participant, Payload};
use distlab_types::MessageId;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

/// Upper bound on delivery rounds in [`ProtocolStateMachine::deliver_all`].
///
/// Protocols with periodic traffic can keep producing messages; the bound
/// keeps a settle loop finite.
pub const MAX_DELIVERY_ROUNDS: usize = 1000;

/// A deterministic model of one distributed protocol.
///
/// This is the narrow surface the timeline and the host harness drive.
/// Protocol-specific operations (`start_election`, `write`, ...) live on the
/// concrete types.
///
/// Implementations are:
///
/// - **Synchronous**: every call completes its mutation before returning
/// - **Deterministic**: same state + same calls = same state
/// - **Total**: unknown ids, failed targets and stale messages are no-ops,
///   never panics
///
/// # Example
///
/// ```ignore
/// let mut cluster = RaftCluster::new(RaftConfig::default());
/// cluster.start_election("node-0");
/// while !cluster.list_in_flight().is_empty() {
///     for id in cluster.list_in_flight() {
///         cluster.deliver(id);
///     }
/// }
/// ```
pub trait ProtocolStateMachine: Clone {
    /// The participant type held in the registry.
    type Participant: Participant;

    /// The message payload enum.
    type Payload: Payload;

    /// Protocol statistics, embedding the common health and message counts.
    type Stats: Clone + Debug + Serialize;

    /// Short protocol name, e.g. `"raft"`.
    fn name(&self) -> &'static str;

    /// Current logical time.
    fn now(&self) -> Duration;

    /// Defensive copy of every participant, in registry order.
    fn participants(&self) -> Vec<Self::Participant>;

    /// Defensive copy of every message, in send order.
    fn messages(&self) -> Vec<Message<Self::Payload>>;

    /// Ids of in-flight messages, in send order.
    fn list_in_flight(&self) -> Vec<MessageId>;

    /// Deliver an in-flight message.
    ///
    /// # Guarantees
    ///
    /// - Delivering a terminal or unknown id changes nothing
    /// - A message whose sender or recipient is unavailable (failed or
    ///   partitioned away) is dropped instead of applied
    fn deliver(&mut self, id: MessageId);

    /// Advance logical time by the configured interval and run
    /// time-threshold transitions.
    fn tick(&mut self);

    /// Mark a participant failed. Unknown ids are ignored.
    fn fail_node(&mut self, id: &str);

    /// Mark a participant healthy again. Unknown ids are ignored.
    fn recover_node(&mut self, id: &str);

    /// Return to the state of a freshly constructed instance.
    fn reset(&mut self);

    /// Read-only statistics.
    fn stats(&self) -> Self::Stats;

    /// Deliver every in-flight message, including ones produced along the way.
    ///
    /// Runs at most [`MAX_DELIVERY_ROUNDS`] rounds. Returns the number of
    /// delivery calls made.
    fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_DELIVERY_ROUNDS {
            let in_flight = self.list_in_flight();
            if in_flight.is_empty() {
                break;
            }
            for id in in_flight {
                self.deliver(id);
                delivered += 1;
            }
        }
        delivered
    }
}
