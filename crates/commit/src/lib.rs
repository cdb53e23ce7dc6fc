//! Atomic commitment protocols.
//!
//! One coordinator and a set of cohorts agree to commit or abort a
//! transaction. [`TwoPhaseCommit`] blocks prepared cohorts when the
//! coordinator fails; [`ThreePhaseCommit`] adds a pre-commit round so cohorts
//! can finish on their own after a timeout.

mod node;
mod three_phase;
mod two_phase;

pub use node::{CommitConfig, CommitNode, CommitRole, CommitStats, TxnState, COORDINATOR};
pub use three_phase::{ThreePhaseCommit, ThreePhaseMessage};
pub use two_phase::{TwoPhaseCommit, TwoPhaseMessage};
