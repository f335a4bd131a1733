//! Orchestrator error taxonomy.
//!
//! Every failure in the plane maps to exactly one variant; the variant
//! decides retry behavior. Handlers return these instead of panicking, and
//! the job runner translates them into state transitions.

use uuid::Uuid;

/// Classified failure for job handlers and gateway callers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// DB conflict, network blip, upstream 5xx. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Local bucket empty or upstream 429. The job is rescheduled at
    /// `now + retry_after` without consuming an attempt.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Malformed payload or schema violation. Never retried.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Bad signature or rejected credential. Never retried; credential
    /// failures additionally deactivate the store and raise an approval.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        reason: String,
        credential_related: bool,
    },

    /// Store or resource removed mid-flight. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Action blocked by a frozen budget. Never retried; raises a
    /// budget_override approval.
    #[error("budget {budget_id} is frozen")]
    BudgetFrozen { budget_id: Uuid, budget_type: String },

    /// Check-and-set lost a race; another worker did the transition.
    #[error("conflict: superseded by a concurrent writer")]
    Conflict,
}

impl OrchestratorError {
    /// Whether this failure consumes a retry attempt and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::Transient(_))
    }

    /// Whether the failure is terminal regardless of remaining attempts.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Invalid(_)
                | OrchestratorError::Unauthorized { .. }
                | OrchestratorError::NotFound(_)
                | OrchestratorError::BudgetFrozen { .. }
        )
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound("row not found".to_string()),
            other => OrchestratorError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(OrchestratorError::Transient("timeout".into()).is_retryable());
        assert!(!OrchestratorError::Transient("timeout".into()).is_permanent());
    }

    #[test]
    fn invalid_and_unauthorized_are_permanent() {
        assert!(OrchestratorError::Invalid("bad payload".into()).is_permanent());
        assert!(OrchestratorError::Unauthorized {
            reason: "expired token".into(),
            credential_related: true,
        }
        .is_permanent());
    }

    #[test]
    fn rate_limited_is_neither_permanent_nor_attempt_consuming() {
        let err = OrchestratorError::RateLimited {
            retry_after_seconds: 4,
        };
        assert!(!err.is_permanent());
        assert!(!err.is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: OrchestratorError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
