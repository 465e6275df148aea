//! Billing error types

use examprep_shared::ErrorCategory;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook payload could not be parsed: {0}")]
    WebhookPayloadInvalid(String),

    /// A lifecycle event referenced a processor customer no user is linked to
    #[error("No user is linked to customer {0}")]
    UnknownCustomer(String),

    #[error("Checkout could not be initialized: {reason}")]
    CheckoutInit { reason: String, retryable: bool },

    #[error("User already has an active premium subscription")]
    AlreadySubscribed,

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("Payment processor timed out during {0}")]
    ProcessorTimeout(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BillingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BillingError::Database(_) | BillingError::Config(_) => ErrorCategory::Internal,
            BillingError::StripeApi(_)
            | BillingError::CheckoutInit { .. }
            | BillingError::ProcessorTimeout(_) => ErrorCategory::Upstream,
            BillingError::WebhookSignatureInvalid => ErrorCategory::Unauthorized,
            BillingError::WebhookPayloadInvalid(_) | BillingError::InvalidInput(_) => {
                ErrorCategory::Validation
            }
            BillingError::UnknownCustomer(_) => ErrorCategory::Integrity,
            BillingError::AlreadySubscribed | BillingError::NoActiveSubscription => {
                ErrorCategory::Conflict
            }
            BillingError::NotFound(_) => ErrorCategory::NotFound,
        }
    }

    /// Whether retrying the same call later can succeed without any change
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::ProcessorTimeout(_) => true,
            BillingError::CheckoutInit { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Stable machine-readable code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            BillingError::Database(_) => "database_error",
            BillingError::StripeApi(_) => "processor_error",
            BillingError::Config(_) => "configuration_error",
            BillingError::WebhookSignatureInvalid => "invalid_signature",
            BillingError::WebhookPayloadInvalid(_) => "invalid_payload",
            BillingError::UnknownCustomer(_) => "unknown_customer",
            BillingError::CheckoutInit { .. } => "checkout_init_failed",
            BillingError::AlreadySubscribed => "already_subscribed",
            BillingError::NoActiveSubscription => "no_active_subscription",
            BillingError::ProcessorTimeout(_) => "processor_timeout",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}
