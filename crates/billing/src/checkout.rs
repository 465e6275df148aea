//! Premium upgrade checkout
//!
//! Checkout never writes tier or status. A successful payment only means the
//! processor will soon emit lifecycle events; the orchestrator waits a bounded
//! time for the webhook consumer to apply them and otherwise reports the
//! activation as pending.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use examprep_shared::{poll_until, PollOutcome, PollSchedule};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{PaymentProcessor, StripeConfig};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{SubscriptionRecord, SubscriptionStore};

/// Everything the client-side payment sheet needs to collect a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutHandle {
    pub user_id: Uuid,
    pub client_secret: String,
    pub ephemeral_key: String,
    pub customer_ref: String,
}

/// Raw response from the checkout endpoint; any field may be missing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutContext {
    #[serde(default, alias = "clientSecret", alias = "paymentIntent")]
    pub client_secret: Option<String>,
    #[serde(default, alias = "ephemeralKey")]
    pub ephemeral_key: Option<String>,
    #[serde(default, alias = "customer_id", alias = "customerId")]
    pub customer: Option<String>,
}

impl CheckoutContext {
    fn into_handle(self, user_id: Uuid) -> BillingResult<CheckoutHandle> {
        fn require(field: Option<String>, name: &str) -> BillingResult<String> {
            field
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::CheckoutInit {
                    reason: format!("checkout response missing {}", name),
                    retryable: false,
                })
        }

        Ok(CheckoutHandle {
            user_id,
            client_secret: require(self.client_secret, "client_secret")?,
            ephemeral_key: require(self.ephemeral_key, "ephemeral_key")?,
            customer_ref: require(self.customer, "customer")?,
        })
    }
}

/// Remote call that creates the processor customer and payment intent
#[async_trait]
pub trait CheckoutBackend: Send + Sync {
    async fn create_checkout(&self, user_id: Uuid, price_id: &str)
        -> BillingResult<CheckoutContext>;
}

#[derive(Serialize)]
struct CheckoutRequest<'a> {
    user_id: Uuid,
    price_id: &'a str,
}

/// Checkout backend reached over HTTP
pub struct HttpCheckoutBackend {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpCheckoutBackend {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build checkout client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    pub fn from_config(config: &StripeConfig) -> BillingResult<Self> {
        Self::new(
            config.checkout_endpoint.clone(),
            config.checkout_token.clone(),
            config.payment_timeout,
        )
    }
}

#[async_trait]
impl CheckoutBackend for HttpCheckoutBackend {
    async fn create_checkout(
        &self,
        user_id: Uuid,
        price_id: &str,
    ) -> BillingResult<CheckoutContext> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&CheckoutRequest { user_id, price_id });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Checkout endpoint request failed");
            BillingError::CheckoutInit {
                reason: if e.is_timeout() {
                    "checkout endpoint timed out".to_string()
                } else {
                    format!("checkout endpoint unreachable: {}", e)
                },
                retryable: true,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                user_id = %user_id,
                status = status.as_u16(),
                body = %body,
                "Checkout endpoint returned an error"
            );
            return Err(BillingError::CheckoutInit {
                reason: format!("checkout endpoint returned {}", status.as_u16()),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        response.json::<CheckoutContext>().await.map_err(|e| BillingError::CheckoutInit {
            reason: format!("checkout response was not valid JSON: {}", e),
            retryable: false,
        })
    }
}

/// Terminal result reported by the client-side payment sheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentSheetResult {
    Completed,
    Canceled,
    Failed {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        decline_code: Option<String>,
    },
}

/// Presents the payment sheet and waits for the user to finish with it
#[async_trait]
pub trait PaymentSheet: Send + Sync {
    async fn present(&self, handle: &CheckoutHandle) -> PaymentSheetResult;
}

/// Categorized reason a payment was declined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    InsufficientFunds,
    CardExpired,
    CardDeclined,
    IncorrectDetails,
    ProcessingError,
    AuthenticationRequired,
    Generic,
}

impl DeclineReason {
    /// Classify processor error codes; the decline code wins when present
    pub fn classify(code: Option<&str>, decline_code: Option<&str>) -> Self {
        decline_code
            .and_then(Self::from_code)
            .or_else(|| code.and_then(Self::from_code))
            .unwrap_or(DeclineReason::Generic)
    }

    fn from_code(code: &str) -> Option<Self> {
        let reason = match code {
            "insufficient_funds" => DeclineReason::InsufficientFunds,
            "expired_card" => DeclineReason::CardExpired,
            "card_declined" | "generic_decline" | "do_not_honor" | "lost_card" | "stolen_card"
            | "fraudulent" | "pickup_card" | "restricted_card" | "card_not_supported" => {
                DeclineReason::CardDeclined
            }
            "incorrect_cvc" | "invalid_cvc" | "incorrect_number" | "invalid_number"
            | "invalid_expiry_month" | "invalid_expiry_year" | "incorrect_zip" => {
                DeclineReason::IncorrectDetails
            }
            "processing_error" => DeclineReason::ProcessingError,
            "authentication_required" | "payment_intent_authentication_failure" => {
                DeclineReason::AuthenticationRequired
            }
            _ => return None,
        };
        Some(reason)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::InsufficientFunds => "insufficient_funds",
            DeclineReason::CardExpired => "card_expired",
            DeclineReason::CardDeclined => "card_declined",
            DeclineReason::IncorrectDetails => "incorrect_details",
            DeclineReason::ProcessingError => "processing_error",
            DeclineReason::AuthenticationRequired => "authentication_required",
            DeclineReason::Generic => "generic",
        }
    }
}

/// How an upgrade attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// Payment succeeded and the premium tier is already visible
    Activated { subscription: SubscriptionRecord },
    /// Payment succeeded but lifecycle events have not landed yet
    ActivationPending { subscription: SubscriptionRecord },
    Canceled,
    Declined { reason: DeclineReason },
}

impl UpgradeOutcome {
    /// Payment went through, whether or not activation is visible yet
    pub fn success(&self) -> bool {
        matches!(
            self,
            UpgradeOutcome::Activated { .. } | UpgradeOutcome::ActivationPending { .. }
        )
    }
}

/// Orchestrates premium checkout and subscription cancellation
pub struct CheckoutService {
    backend: Arc<dyn CheckoutBackend>,
    processor: Arc<dyn PaymentProcessor>,
    subscriptions: Arc<dyn SubscriptionStore>,
    price_id: String,
    activation_poll: PollSchedule,
    timeout: Duration,
}

impl CheckoutService {
    pub fn new(
        backend: Arc<dyn CheckoutBackend>,
        processor: Arc<dyn PaymentProcessor>,
        subscriptions: Arc<dyn SubscriptionStore>,
        price_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            processor,
            subscriptions,
            price_id: price_id.into(),
            activation_poll: PollSchedule::default(),
            timeout,
        }
    }

    pub fn with_activation_poll(mut self, schedule: PollSchedule) -> Self {
        self.activation_poll = schedule;
        self
    }

    /// Prepare a payment sheet for the user
    ///
    /// Links the processor customer to the user's record so lifecycle events
    /// for that customer resolve to this user.
    pub async fn begin_upgrade(&self, user_id: Uuid) -> BillingResult<CheckoutHandle> {
        let record = self.subscriptions.get_or_create(user_id).await?;
        if record.is_premium_eligible() && !record.pending_downgrade() {
            return Err(BillingError::AlreadySubscribed);
        }

        let context = tokio::time::timeout(
            self.timeout,
            self.backend.create_checkout(user_id, &self.price_id),
        )
        .await
        .map_err(|_| BillingError::CheckoutInit {
            reason: "checkout endpoint timed out".to_string(),
            retryable: true,
        })??;

        let handle = context.into_handle(user_id)?;

        if record.customer_ref.as_deref() != Some(handle.customer_ref.as_str()) {
            if let Some(previous) = &record.customer_ref {
                tracing::warn!(
                    user_id = %user_id,
                    previous_customer = %previous,
                    customer_id = %handle.customer_ref,
                    "Checkout returned a different customer, relinking"
                );
            }
            self.subscriptions
                .attach_customer(user_id, &handle.customer_ref)
                .await?;
        }

        tracing::info!(
            user_id = %user_id,
            customer_id = %handle.customer_ref,
            "Checkout initialized"
        );

        Ok(handle)
    }

    /// Present the sheet and resolve its result
    pub async fn complete_upgrade(
        &self,
        handle: &CheckoutHandle,
        sheet: &dyn PaymentSheet,
    ) -> BillingResult<UpgradeOutcome> {
        let result = sheet.present(handle).await;
        self.resolve_payment(handle.user_id, result).await
    }

    /// Turn a payment sheet result into an upgrade outcome
    pub async fn resolve_payment(
        &self,
        user_id: Uuid,
        result: PaymentSheetResult,
    ) -> BillingResult<UpgradeOutcome> {
        match result {
            PaymentSheetResult::Canceled => {
                tracing::info!(user_id = %user_id, "Checkout canceled by user");
                Ok(UpgradeOutcome::Canceled)
            }
            PaymentSheetResult::Failed { code, decline_code } => {
                let reason = DeclineReason::classify(code.as_deref(), decline_code.as_deref());
                tracing::info!(
                    user_id = %user_id,
                    code = ?code,
                    decline_code = ?decline_code,
                    reason = reason.as_str(),
                    "Checkout payment declined"
                );
                Ok(UpgradeOutcome::Declined { reason })
            }
            PaymentSheetResult::Completed => self.await_activation(user_id).await,
        }
    }

    async fn await_activation(&self, user_id: Uuid) -> BillingResult<UpgradeOutcome> {
        let outcome = poll_until(
            &self.activation_poll,
            || self.subscriptions.get_or_create(user_id),
            |record| record.tier.is_premium(),
        )
        .await?;

        match outcome {
            PollOutcome::Converged(subscription) => {
                tracing::info!(user_id = %user_id, "Premium activation confirmed");
                Ok(UpgradeOutcome::Activated { subscription })
            }
            PollOutcome::Exhausted(subscription) => {
                tracing::info!(
                    user_id = %user_id,
                    probes = self.activation_poll.max_probes(),
                    "Payment succeeded but activation not yet visible"
                );
                Ok(UpgradeOutcome::ActivationPending { subscription })
            }
        }
    }

    /// Ask the processor to end the subscription at period end
    pub async fn cancel_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.set_cancel_at_period_end(user_id, true).await
    }

    /// Undo a scheduled cancellation
    pub async fn reactivate_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.set_cancel_at_period_end(user_id, false).await
    }

    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self.subscriptions.get_or_create(user_id).await?;
        let subscription_ref = match (&record.subscription_ref, record.tier.is_premium()) {
            (Some(sub_ref), true) => sub_ref.clone(),
            _ => return Err(BillingError::NoActiveSubscription),
        };

        if record.cancel_at_period_end == cancel {
            tracing::info!(
                user_id = %user_id,
                cancel_at_period_end = cancel,
                "Cancellation flag already in requested state"
            );
            return Ok(record);
        }

        let remote = self
            .processor
            .set_cancel_at_period_end(&subscription_ref, cancel)
            .await?;

        let updated = self
            .subscriptions
            .set_cancel_at_period_end(user_id, remote.cancel_at_period_end, remote.canceled_at)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_ref,
            cancel_at_period_end = remote.cancel_at_period_end,
            "Updated subscription cancellation"
        );

        Ok(updated)
    }
}
