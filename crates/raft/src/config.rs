//! Raft cluster configuration.

use std::time::Duration;

/// Configuration for a [`RaftCluster`](crate::RaftCluster).
#[derive(Debug, Clone, PartialEq)]
pub struct RaftConfig {
    /// Number of nodes, named `{id_prefix}-0` onwards.
    pub node_count: usize,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,

    /// Prefix for generated node ids.
    pub id_prefix: String,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            tick_interval: Duration::from_millis(100),
            id_prefix: "node".to_string(),
        }
    }
}

impl RaftConfig {
    /// Create a configuration for `node_count` nodes.
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ..Default::default()
        }
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the node id prefix.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }
}
