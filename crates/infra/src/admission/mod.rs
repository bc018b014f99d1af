//! Admission: quota-gated entry of new jobs, plus the owner-facing queries.

pub mod gate;
pub mod plans;

pub use gate::{AdmissionGate, JobStatusView, QueryError, SubmitError, Submission};
pub use plans::{InMemoryPlanDirectory, PlanDirectory};
