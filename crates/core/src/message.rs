//! Protocol message types.

use distlab_types::{MessageId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Protocol-specific message body.
///
/// Each protocol defines one enum of payloads; the variant doubles as the
/// message's type tag.
pub trait Payload: Clone + Debug {
    /// Get a human-readable name for this message type.
    fn type_name(&self) -> &'static str;
}

/// Lifecycle status of a message.
///
/// A message leaves `InFlight` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created, not yet delivered. Models network transit.
    InFlight,
    /// Delivered and applied by the recipient.
    Delivered,
    /// Discarded because an endpoint was failed or partitioned away.
    Dropped,
}

impl MessageStatus {
    /// Whether the message has left `InFlight`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::InFlight)
    }
}

/// A message owned by a [`MessagePool`](crate::MessagePool).
#[derive(Debug, Clone, PartialEq)]
pub struct Message<P> {
    pub id: MessageId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub payload: P,
    pub status: MessageStatus,
    /// Logical time at which the message was sent.
    pub sent_at: Duration,
}

impl<P: Payload> Message<P> {
    /// The payload's type tag.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Check if this message is still in transit.
    pub fn is_in_flight(&self) -> bool {
        self.status == MessageStatus::InFlight
    }
}
