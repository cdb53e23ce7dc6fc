use thiserror::Error;

/// Invalid quorum replication parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumConfigError {
    #[error("Replication factor {replication_factor} exceeds node count {nodes}")]
    ReplicationFactorTooLarge {
        replication_factor: usize,
        nodes: usize,
    },

    #[error("Write quorum {w} must be between 1 and replication factor {replication_factor}")]
    WriteQuorum { w: usize, replication_factor: usize },

    #[error("Read quorum {r} must be between 1 and replication factor {replication_factor}")]
    ReadQuorum { r: usize, replication_factor: usize },
}
