//! Infrastructure layer: stores, queue, admission and workers.
//!
//! Every store comes in two flavours behind one async trait: an in-memory
//! implementation for tests and single-process runs, and a Postgres one
//! (sqlx) for deployments with several worker processes.

pub mod admission;
pub mod clock;
pub mod dispatch;
pub mod jobs;
pub mod pg;
pub mod quota;
pub mod workers;

pub use admission::{AdmissionGate, JobStatusView, QueryError, SubmitError, Submission};
pub use clock::{Clock, ManualClock, SystemClock};
pub use pg::migrate;
