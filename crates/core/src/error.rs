//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, illegal state changes). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. unknown mode, empty input reference).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state machine edge that does not exist was requested.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Display, to: impl core::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_render_their_context() {
        let errors = [
            DomainError::validation("empty input_ref"),
            DomainError::invariant("attempt budget exhausted"),
            DomainError::invalid_id("JobId: bad"),
            DomainError::invalid_transition("completed", "queued"),
        ];
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "validation failed: empty input_ref",
                "invariant violated: attempt budget exhausted",
                "invalid identifier: JobId: bad",
                "invalid transition: completed -> queued",
            ]
        );

        for error in errors {
            match error {
                DomainError::Validation(msg)
                | DomainError::InvariantViolation(msg)
                | DomainError::InvalidId(msg) => assert!(!msg.is_empty()),
                DomainError::InvalidTransition { from, to } => assert_ne!(from, to),
            }
        }
    }
}
