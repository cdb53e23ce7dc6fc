//! Deterministic host harness for distlab protocol models.
//!
//! Stands in for the presentation layer: binds scenario event types to
//! protocol operations, runs a virtual clock, and delivers in-flight
//! messages after a simulated transit delay. Given the same seed, it
//! produces identical results every run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Playback<S>                        │
//! │                                                         │
//! │  ┌──────────────────────┐   ┌────────────────────────┐  │
//! │  │ TimelineController<S>│   │   DeliveryScheduler    │  │
//! │  │ scripted events at   │   │ BTreeMap<DeliveryKey,  │  │
//! │  │ their timestamps     │   │          MessageId>    │  │
//! │  └──────────┬───────────┘   └───────────┬────────────┘  │
//! │             │ handler                   │ deliver(id)   │
//! │             ▼                           ▼               │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │      S: ProtocolStateMachine (owns its pool)       │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │ list_in_flight()            │
//! │                           └──▶ schedule at now + delay  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod bindings;
mod delivery;
mod error;
mod harness;
mod playback;

pub use delivery::{DeliveryConfig, DeliveryKey, DeliveryScheduler};
pub use error::ConfigError;
pub use harness::{
    anti_entropy, causal_broadcast, chain, crdt, gossip, isr, lamport, lock_service, paxos, pbft,
    phi_accrual, quorum, raft, sharding, three_phase_commit, two_phase_commit, vector_clocks,
    work_queue, HarnessConfig,
};
pub use playback::{Playback, PlaybackStats};
