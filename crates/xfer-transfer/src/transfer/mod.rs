//! # Transfer manager
//!
//! - `types`: task states, task snapshots, configuration
//! - `backoff`: retry classification and exponential delay
//! - `pool`: per-profile session pool bounded by a semaphore
//! - `task`: arena record behind each task id
//! - `manager`: FIFO queue, worker pool, pause/resume/cancel/retry

pub mod backoff;
pub mod manager;
pub mod pool;
pub mod task;
pub mod types;

pub use backoff::RetryPolicy;
pub use manager::TransferManager;
pub use pool::{PooledSession, SessionPool};
pub use types::*;
