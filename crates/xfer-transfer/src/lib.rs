//! Queued, pooled, retrying transfers for the xfer engine.

pub mod transfer;

pub use transfer::{
    PoolConfig, QueueStats, RetryPolicy, SessionPool, TransferConfig, TransferManager, TransferState,
    TransferTask,
};
