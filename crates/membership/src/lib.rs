//! Cluster membership models.
//!
//! - [`Gossip`]: push rumor spreading to `fanout` random peers per tick,
//!   with peers drawn from a seeded `ChaCha8Rng`
//! - [`PhiAccrual`]: a monitor turns heartbeat inter-arrival times into a
//!   suspicion level instead of a fixed timeout
//! - [`Sharding`]: a consistent-hash ring with virtual nodes that reports
//!   which keys move on membership changes

mod gossip;
mod phi_accrual;
mod sharding;

pub use gossip::{Gossip, GossipConfig, GossipMessage, GossipNode, GossipStats};
pub use phi_accrual::{
    Liveness, MonitoredNode, PhiAccrual, PhiAccrualConfig, PhiMessage, PhiStats, MONITOR,
};
pub use sharding::{KeyMove, ShardNode, Sharding, ShardingConfig, ShardingMessage, ShardingStats};
