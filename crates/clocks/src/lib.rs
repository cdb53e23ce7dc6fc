//! Logical time.
//!
//! - [`LamportClocks`]: one counter per node; receive sets
//!   `max(local, message) + 1`
//! - [`VectorClocks`]: one counter per node per node, enough to tell
//!   happened-before from concurrent
//! - [`CausalBroadcast`]: vector-stamped broadcast with a holdback queue
//!   that delivers in causal order

mod causal;
mod lamport;
mod vector;
mod vector_clock;

pub use causal::{CausalBroadcast, CausalMessage, CausalNode, CausalStats, HeldMessage};
pub use lamport::{ClockConfig, ClockEvent, EventKind, LamportClocks, LamportMessage, LamportNode, LamportStats};
pub use vector::{VectorClocks, VectorMessage, VectorNode, VectorStats};
pub use vector_clock::{ClockOrdering, VectorClock};
