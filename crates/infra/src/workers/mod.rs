//! Worker pool, lease reaper and their retry policies.

pub mod pool;
pub mod reaper;
pub mod retry;

pub use pool::{WorkerDeps, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
pub use reaper::{LeaseReaper, ReapSummary};
pub use retry::{Backoff, BackoffStrategy, RetryPolicy};
