//! Dispatch queue: admitted jobs waiting for a worker.

pub mod postgres;
pub mod queue;

pub use postgres::PostgresDispatchQueue;
pub use queue::{
    DispatchQueue, ExpiredLease, InMemoryDispatchQueue, Lease, Priority, QueueConfig, QueueDepth,
    QueueError,
};
