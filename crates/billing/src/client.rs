//! Payment processor configuration and client

use std::time::Duration;

use async_trait::async_trait;
use examprep_shared::SubscriptionStatus;
use stripe::{Subscription, SubscriptionId, UpdateSubscription};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Payment processor configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub premium_price_id: String,
    /// Remote endpoint that creates the customer and payment intent for checkout
    pub checkout_endpoint: String,
    pub checkout_token: Option<String>,
    /// Upper bound on any single processor call
    pub payment_timeout: Duration,
    /// Accepted clock skew for webhook signature timestamps
    pub webhook_tolerance: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = required("STRIPE_SECRET_KEY")?;
        let webhook_secret = required("STRIPE_WEBHOOK_SECRET")?;
        let premium_price_id = required("STRIPE_PREMIUM_PRICE_ID")?;
        let checkout_endpoint = required("CHECKOUT_ENDPOINT_URL")?;
        let checkout_token = std::env::var("CHECKOUT_ENDPOINT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let payment_timeout = seconds_or("PAYMENT_TIMEOUT_SECS", 15)?;
        let webhook_tolerance = seconds_or("WEBHOOK_TOLERANCE_SECS", 300)?;

        Ok(Self {
            secret_key,
            webhook_secret,
            premium_price_id,
            checkout_endpoint,
            checkout_token,
            payment_timeout,
            webhook_tolerance,
        })
    }
}

fn required(name: &'static str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
}

fn seconds_or(name: &'static str, default: u64) -> BillingResult<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| BillingError::Config(format!("{} must be a number of seconds", name))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Processor view of a subscription after a pass-through mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub subscription_ref: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

/// Mutations forwarded to the payment processor
///
/// Local state is never changed here; lifecycle events remain the source of
/// truth for tier and status.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<ProcessorSubscription>;
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = subscription_ref
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        let subscription = tokio::time::timeout(
            self.config.payment_timeout,
            Subscription::update(self.inner(), &sub_id, params),
        )
        .await
        .map_err(|_| BillingError::ProcessorTimeout("update_subscription"))??;

        tracing::info!(
            subscription_id = %subscription.id,
            cancel_at_period_end = subscription.cancel_at_period_end,
            "Updated subscription cancellation flag"
        );

        Ok(ProcessorSubscription {
            subscription_ref: subscription.id.to_string(),
            status: map_stripe_status(&subscription.status),
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription
                .canceled_at
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
        })
    }
}

/// Collapse the processor's status set onto the statuses this system tracks
pub fn map_stripe_status(status: &stripe::SubscriptionStatus) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as StripeSubStatus;
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid | StripeSubStatus::Paused => {
            SubscriptionStatus::PastDue
        }
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
    }
}

/// Same mapping for the raw status strings carried in webhook payloads
pub fn map_status_str(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" => Some(SubscriptionStatus::Active),
        "trialing" => Some(SubscriptionStatus::Trialing),
        "past_due" | "unpaid" | "paused" => Some(SubscriptionStatus::PastDue),
        "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
        "incomplete" => Some(SubscriptionStatus::Incomplete),
        _ => None,
    }
}
