//! Harness configuration errors.

use distlab_replication::QuorumConfigError;
use thiserror::Error;

/// Invalid configuration detected while building a harness.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("At least one node is required")]
    NoNodes,

    #[error("Delivery jitter fraction must be in [0, 1], got {0}")]
    InvalidJitter(f64),

    #[error(transparent)]
    Quorum(#[from] QuorumConfigError),
}
