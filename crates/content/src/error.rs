//! Content error types

use std::time::Duration;

use examprep_billing::BillingError;
use examprep_shared::{ErrorCategory, SessionStatus};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::generator::{GenerationFailure, GenerationFailureKind};

pub type ContentResult<T> = Result<T, ContentError>;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("{reason}")]
    QuotaExceeded {
        reason: String,
        next_available_at: Option<OffsetDateTime>,
    },

    #[error("Requested {requested} items but the plan allows {allowed}")]
    CriteriaExceedsLimit { allowed: u32, requested: u32 },

    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("Content generation failed: {0}")]
    Generation(GenerationFailure),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("No result recorded for session {0}")]
    ResultNotFound(Uuid),

    #[error("Session is already {status}")]
    SessionClosed { status: SessionStatus },

    /// Resubmission of a completed session with a different answer set
    #[error("Session {0} was already submitted with different answers")]
    SubmissionConflict(Uuid),

    #[error("Answers reference items outside the session: {}", .0.join(", "))]
    UnknownItems(Vec<String>),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ContentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ContentError::QuotaExceeded { .. } => ErrorCategory::Quota,
            ContentError::CriteriaExceedsLimit { .. }
            | ContentError::InvalidCriteria(_)
            | ContentError::UnknownItems(_) => ErrorCategory::Validation,
            ContentError::Generation(failure) => match failure.kind {
                GenerationFailureKind::InvalidInput | GenerationFailureKind::ContentFiltered => {
                    ErrorCategory::Validation
                }
                _ => ErrorCategory::Upstream,
            },
            ContentError::SessionNotFound(_) | ContentError::ResultNotFound(_) => {
                ErrorCategory::NotFound
            }
            ContentError::SessionClosed { .. } => ErrorCategory::Conflict,
            ContentError::SubmissionConflict(_) => ErrorCategory::Integrity,
            ContentError::Database(_) => ErrorCategory::Internal,
            ContentError::Billing(e) => e.category(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ContentError::Generation(failure) => failure.is_retryable(),
            ContentError::Database(_) => true,
            ContentError::Billing(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Suggested delay before retrying, when the upstream gave one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ContentError::Generation(failure) => failure.retry_after,
            _ => None,
        }
    }

    /// Stable machine-readable code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            ContentError::QuotaExceeded { .. } => "quota_exceeded",
            ContentError::CriteriaExceedsLimit { .. } => "criteria_exceeds_limit",
            ContentError::InvalidCriteria(_) => "invalid_criteria",
            ContentError::Generation(failure) => failure.kind.as_str(),
            ContentError::SessionNotFound(_) => "session_not_found",
            ContentError::ResultNotFound(_) => "result_not_found",
            ContentError::SessionClosed { .. } => "session_closed",
            ContentError::SubmissionConflict(_) => "submission_conflict",
            ContentError::UnknownItems(_) => "unknown_items",
            ContentError::Database(_) => "database_error",
            ContentError::Billing(e) => e.error_code(),
        }
    }
}

impl From<sqlx::Error> for ContentError {
    fn from(e: sqlx::Error) -> Self {
        ContentError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for ContentError {
    fn from(e: serde_json::Error) -> Self {
        ContentError::Database(format!("stored JSON could not be decoded: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_failures_split_by_retryability() {
        let timeout = ContentError::Generation(GenerationFailure::new(
            GenerationFailureKind::Timeout,
            "slow",
        ));
        let filtered = ContentError::Generation(GenerationFailure::new(
            GenerationFailureKind::ContentFiltered,
            "blocked",
        ));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.category(), ErrorCategory::Upstream);
        assert!(!filtered.is_retryable());
        assert_eq!(filtered.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_closed_session_is_not_retryable() {
        let err = ContentError::SessionClosed {
            status: SessionStatus::Abandoned,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Session is already abandoned");
    }

    #[test]
    fn test_limit_error_carries_counts() {
        let err = ContentError::CriteriaExceedsLimit {
            allowed: 5,
            requested: 20,
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains("20"));
    }
}
