//! Core abstractions shared by every distlab protocol model.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              ProtocolStateMachine (per protocol)         │
//! │                                                          │
//! │   ┌──────────────────────┐   ┌────────────────────────┐  │
//! │   │ ParticipantRegistry  │   │      MessagePool       │  │
//! │   │ id -> participant    │   │ InFlight -> Delivered  │  │
//! │   │ (insertion ordered)  │   │          \-> Dropped   │  │
//! │   └──────────────────────┘   └────────────────────────┘  │
//! │                                                          │
//! │   tick() / deliver(id) / fail_node / recover_node        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! State machines are:
//!
//! - **Synchronous**: no async, no threads
//! - **Deterministic**: same state + same calls = same result
//! - **Total**: unknown ids, failed targets and stale messages are silent no-ops

mod message;
mod partition;
mod pool;
mod registry;
mod stats;
mod traits;
mod votes;

pub use message::{Message, MessageStatus, Payload};
pub use partition::Partitions;
pub use pool::MessagePool;
pub use registry::{Health, Participant, ParticipantRegistry};
pub use stats::{HealthStats, MessageStats};
pub use traits::{ProtocolStateMachine, MAX_DELIVERY_ROUNDS};
pub use votes::VoteTracker;

pub use distlab_types::{MessageId, ParticipantId, Position};
