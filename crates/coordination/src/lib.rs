//! Coordination services.
//!
//! ```text
//!  lock        client ──Acquire──▶ lock-server ──Grant(token)──▶ client
//!              client ──Write(token)──▶ storage   (rejects token < highest seen)
//!              lease expires after lease_ticks without Release
//!
//!  work queue  broker ──Dispatch(job)──▶ idle worker ──Ack──▶ broker
//!              un-acked after visibility_ticks: back on the queue
//! ```

mod lock;
mod work_queue;

pub use lock::{
    LockConfig, LockMessage, LockNode, LockRole, LockService, LockStats, Lease, LOCK_SERVER,
    STORAGE,
};
pub use work_queue::{
    Job, JobId, WorkQueue, WorkQueueConfig, WorkQueueMessage, WorkQueueNode, WorkQueueStats,
    BROKER,
};
