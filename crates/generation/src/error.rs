use std::time::Duration;

use thiserror::Error;

use productsnap_jobs::{Attribution, JobError};

/// Typed failure of a generation call.
///
/// The transient/permanent split drives the worker's retry policy; the
/// attribution of permanent failures drives the quota refund policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("provider rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("input rejected by provider: {0}")]
    InvalidInput(String),

    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    /// Permanent failure that is not the caller's fault (bad credentials,
    /// malformed provider response, ...).
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited { .. }
                | GenerationError::Unavailable(_)
                | GenerationError::Timeout(_)
        )
    }

    pub fn attribution(&self) -> Attribution {
        match self {
            GenerationError::InvalidInput(_) | GenerationError::ContentPolicy(_) => {
                Attribution::Caller
            }
            _ => Attribution::System,
        }
    }

    /// Provider-requested pause before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classified reason recorded on the failed job.
    pub fn to_job_error(&self) -> JobError {
        match self {
            GenerationError::Timeout(_) => JobError::timeout(self.to_string()),
            e if e.is_transient() => JobError::transient(self.to_string()),
            e => JobError::permanent(e.attribution(), self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use productsnap_jobs::ErrorClass;

    #[test]
    fn transient_errors_are_system_attributed() {
        for err in [
            GenerationError::RateLimited { retry_after: None },
            GenerationError::Unavailable("503".into()),
            GenerationError::Timeout(Duration::from_secs(1)),
        ] {
            assert!(err.is_transient());
            assert_eq!(err.attribution(), Attribution::System);
        }
    }

    #[test]
    fn caller_errors_are_permanent() {
        let err = GenerationError::ContentPolicy("nsfw".into());
        assert!(!err.is_transient());
        let job_error = err.to_job_error();
        assert_eq!(job_error.class, ErrorClass::PermanentProvider);
        assert_eq!(job_error.attribution, Attribution::Caller);
    }

    #[test]
    fn timeouts_keep_their_class() {
        let job_error = GenerationError::Timeout(Duration::from_secs(5)).to_job_error();
        assert_eq!(job_error.class, ErrorClass::Timeout);
        assert!(job_error.is_refundable());
    }

    #[test]
    fn rejected_is_permanent_but_refundable() {
        let job_error = GenerationError::Rejected("401".into()).to_job_error();
        assert_eq!(job_error.class, ErrorClass::PermanentProvider);
        assert!(job_error.is_refundable());
    }
}
