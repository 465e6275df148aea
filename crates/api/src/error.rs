//! Error types for the API server.
//!
//! Every error leaves the server as
//! `{ "error": { code, category, message, retryable, retry_after_seconds?, details? } }`
//! so clients never have to read upstream error text.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use examprep_billing::BillingError;
use examprep_content::{ContentError, GenerationFailureKind};
use examprep_shared::ErrorCategory;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Webhook rejected: {0}")]
    WebhookRejected(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

impl ApiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized => ErrorCategory::Unauthorized,
            Self::BadRequest(_) | Self::WebhookRejected(_) => ErrorCategory::Validation,
            Self::Internal(_) => ErrorCategory::Internal,
            Self::Billing(e) => e.category(),
            Self::Content(e) => e.category(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        if let Self::Content(ContentError::Generation(failure)) = self {
            if failure.kind == GenerationFailureKind::Timeout {
                return StatusCode::GATEWAY_TIMEOUT;
            }
        }
        if let Self::WebhookRejected(_) = self {
            return StatusCode::BAD_REQUEST;
        }

        match self.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Quota => StatusCode::TOO_MANY_REQUESTS,
            ErrorCategory::Upstream => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Integrity | ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::WebhookRejected(_) => "webhook_rejected",
            Self::Internal(_) => "internal_error",
            Self::Billing(e) => e.error_code(),
            Self::Content(e) => e.error_code(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Billing(e) => e.is_retryable(),
            Self::Content(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::Content(e) => e.retry_after().map(|d| d.as_secs()),
            _ => None,
        }
    }

    /// Structured fields a client needs to build its own message
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Content(ContentError::QuotaExceeded {
                next_available_at, ..
            }) => Some(serde_json::json!({
                "next_available_at": next_available_at
                    .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok()),
            })),
            Self::Content(ContentError::CriteriaExceedsLimit { allowed, requested }) => {
                Some(serde_json::json!({ "allowed": allowed, "requested": requested }))
            }
            Self::Content(ContentError::UnknownItems(ids)) => {
                Some(serde_json::json!({ "item_ids": ids }))
            }
            Self::Content(ContentError::SessionClosed { status }) => {
                Some(serde_json::json!({ "status": status }))
            }
            Self::Billing(BillingError::CheckoutInit { reason, .. }) => {
                Some(serde_json::json!({ "reason": reason }))
            }
            _ => None,
        }
    }

    /// Internal failures are logged in full and reported generically
    fn public_message(&self) -> String {
        if let Self::Content(ContentError::Generation(failure)) = self {
            return match failure.kind {
                GenerationFailureKind::Timeout => {
                    "Question generation took too long. Please try again.".to_string()
                }
                GenerationFailureKind::RateLimited => {
                    "Question generation is busy right now. Please try again shortly.".to_string()
                }
                GenerationFailureKind::UpstreamQuota => {
                    "Question generation is temporarily unavailable.".to_string()
                }
                GenerationFailureKind::ContentFiltered => {
                    "Those criteria could not be used to generate questions. Try different topics."
                        .to_string()
                }
                GenerationFailureKind::InvalidInput => {
                    "Those criteria could not be used to generate questions.".to_string()
                }
                GenerationFailureKind::Transient | GenerationFailureKind::MalformedResponse => {
                    "Question generation failed. Please try again.".to_string()
                }
            };
        }

        match (self, self.category()) {
            (_, ErrorCategory::Internal) => "Internal server error".to_string(),
            (Self::Billing(_) | Self::Content(ContentError::Billing(_)), ErrorCategory::Upstream) => {
                "The payment service is unavailable. Please try again.".to_string()
            }
            (_, ErrorCategory::Upstream) => {
                "A dependent service is unavailable. Please try again.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self.category() {
            ErrorCategory::Internal => tracing::error!(error = ?self, "Internal API error"),
            ErrorCategory::Upstream => tracing::warn!(error = %self, "Upstream failure"),
            _ => tracing::debug!(error = %self, status = status.as_u16(), "Request rejected"),
        }

        let retry_after_seconds = self.retry_after_seconds();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                category: self.category(),
                message: self.public_message(),
                retryable: self.is_retryable(),
                retry_after_seconds,
                details: self.details(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after_seconds {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
