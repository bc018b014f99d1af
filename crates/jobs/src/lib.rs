//! `productsnap-jobs`: the image-job domain.
//!
//! Pure types and state transitions: jobs and their lifecycle, failure
//! classification, generation parameters and quota periods. Nothing here
//! performs IO; stores and workers in `productsnap-infra` drive these types.

pub mod error;
pub mod job;
pub mod mode;
pub mod params;
pub mod quota;
pub mod status;

pub use error::{Attribution, ErrorClass, JobError};
pub use job::{CancelOutcome, Job, Transition, DEFAULT_MAX_ATTEMPTS};
pub use mode::JobMode;
pub use params::GenerationParameters;
pub use quota::{
    PeriodKind, PlanLimit, PlanLimits, PlanTier, QuotaPeriod, QuotaPeriodRecord, UsageSnapshot,
};
pub use status::JobStatus;
