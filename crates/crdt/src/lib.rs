//! State-based CRDTs.
//!
//! Replicas apply operations locally and exchange their whole state; the
//! receiver merges. Because every [`Crdt::merge`] is commutative,
//! associative and idempotent, replicas that have seen the same updates hold
//! the same value no matter how often or in which order states arrive.
//!
//! ```text
//!   replica-0 ──apply(op)──▶ state ──sync──▶ State(c) ──▶ replica-1.merge(c)
//! ```

mod cluster;
mod g_counter;
mod lww_register;
mod or_set;
mod pn_counter;

pub use cluster::{CrdtCluster, CrdtConfig, CrdtMessage, CrdtReplica, CrdtStats};
pub use g_counter::GCounter;
pub use lww_register::LwwRegister;
pub use or_set::{OrSet, OrSetOp};
pub use pn_counter::{PnCounter, PnOp};

use distlab_core::ParticipantId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// A state-based (convergent) replicated data type.
pub trait Crdt: Clone + Debug + Default + PartialEq {
    /// Local update applied at one replica, decodable from scenario data.
    type Op: Clone + Debug + DeserializeOwned;

    /// Observable value.
    type Value: Clone + Debug + PartialEq + Serialize;

    /// Short type name, used as the protocol name.
    const NAME: &'static str;

    /// Apply a local update made at `replica`.
    fn apply(&mut self, replica: &ParticipantId, op: Self::Op);

    /// Join with another state. Must be commutative, associative and idempotent.
    fn merge(&mut self, other: &Self);

    fn value(&self) -> Self::Value;
}
