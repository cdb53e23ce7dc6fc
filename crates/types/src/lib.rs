//! Core types shared by every distlab protocol model.
//!
//! Identifiers, a Blake3 hash type, a binary Merkle tree used for
//! anti-entropy, display positions, and quorum arithmetic.

mod hash;
mod identifiers;
mod merkle;
mod position;
mod quorum;

pub use hash::Hash;
pub use identifiers::{EventId, MessageId, ParticipantId, Term};
pub use merkle::MerkleTree;
pub use position::Position;
pub use quorum::{has_bft_quorum, has_majority};
