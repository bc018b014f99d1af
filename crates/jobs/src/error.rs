//! Structured failure reasons stored on failed jobs.

use serde::{Deserialize, Serialize};

/// Failure taxonomy surfaced to callers polling a failed job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Provider was rate limited or temporarily unavailable on every attempt.
    TransientProvider,
    /// Provider refused the job outright.
    PermanentProvider,
    /// Attempts exceeded the processing deadline.
    Timeout,
    /// Results could not be written to object storage.
    Storage,
}

/// Who a failure is blamed on. Drives the quota refund policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    /// Infrastructure failure; the debited quota is credited back.
    System,
    /// Rejected input or content policy; the debit stands.
    Caller,
}

/// Classified reason attached to a job in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub attribution: Attribution,
    pub message: String,
}

impl JobError {
    pub fn new(class: ErrorClass, attribution: Attribution, message: impl Into<String>) -> Self {
        Self {
            class,
            attribution,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TransientProvider, Attribution::System, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, Attribution::System, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Storage, Attribution::System, message)
    }

    pub fn permanent(attribution: Attribution, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PermanentProvider, attribution, message)
    }

    pub fn is_refundable(&self) -> bool {
        self.attribution == Attribution::System
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_failures_are_refundable() {
        assert!(JobError::transient("503").is_refundable());
        assert!(JobError::timeout("deadline").is_refundable());
        assert!(JobError::storage("bucket down").is_refundable());
        assert!(JobError::permanent(Attribution::System, "bad api key").is_refundable());
    }

    #[test]
    fn caller_failures_are_not_refundable() {
        let err = JobError::permanent(Attribution::Caller, "content policy");
        assert!(!err.is_refundable());
        assert_eq!(err.class, ErrorClass::PermanentProvider);
    }

    #[test]
    fn serializes_with_snake_case_tags() {
        let json = serde_json::to_value(JobError::timeout("slow")).unwrap();
        assert_eq!(json["class"], "timeout");
        assert_eq!(json["attribution"], "system");
    }
}
