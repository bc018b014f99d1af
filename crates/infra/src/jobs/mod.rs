//! Job persistence.
//!
//! - [`JobStore`]: compare-and-set status writes keyed on the attempt number
//! - [`InMemoryJobStore`]: single-process store for tests and local runs
//! - [`PostgresJobStore`]: durable store shared by worker processes

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{CancelRequest, InMemoryJobStore, JobStats, JobStore, JobStoreError, JobUpdate};
