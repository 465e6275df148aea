// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ExamPrep Billing Module
//!
//! Owns premium subscription state and everything that moves it.
//!
//! ## Features
//!
//! - **Subscription State**: One record per user, changed only by processor lifecycle events
//! - **Webhooks**: Signature verification, idempotent event ledger, ordered application, replay
//! - **Checkout**: Payment sheet setup, decline classification, bounded wait for activation
//! - **Cancellation**: Pass-through cancel and reactivate at period end
//! - **Invariants**: Runnable consistency checks over subscriptions and the ledger

pub mod analytics;
pub mod checkout;
pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod subscriptions;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;

// Analytics
pub use analytics::{AnalyticsStore, MemoryAnalyticsStore, PgAnalyticsStore, UserAnalytics};

// Checkout
pub use checkout::{
    CheckoutBackend, CheckoutContext, CheckoutHandle, CheckoutService, DeclineReason,
    HttpCheckoutBackend, PaymentSheet, PaymentSheetResult, UpgradeOutcome,
};

// Client
pub use client::{PaymentProcessor, ProcessorSubscription, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    parse_event, LifecycleData, LifecycleEvent, LifecycleEventKind, ParsedEvent,
    SubscriptionSnapshot,
};

// Invariants
pub use invariants::{
    record_violations, InvariantCheckSummary, InvariantChecker, InvariantViolation,
    ViolationSeverity,
};

// Subscriptions
pub use subscriptions::{
    next_state, MemorySubscriptionStore, PgSubscriptionStore, SkipReason, SubscriptionRecord,
    SubscriptionStore, Transition,
};

// Webhooks
pub use webhooks::{
    ApplyOutcome, MemoryWebhookLedger, PgWebhookLedger, ProcessingResult, SignatureVerifier,
    WebhookConsumer, WebhookEventRecord, WebhookLedger, WebhookReceipt, WebhookReplayResult,
};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub checkout: CheckoutService,
    pub webhooks: WebhookConsumer,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?, pool)
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> BillingResult<Self> {
        let backend = Arc::new(HttpCheckoutBackend::from_config(&config)?);
        let stripe = Arc::new(StripeClient::new(config.clone()));

        Ok(Self::with_components(
            &config,
            Arc::new(PgSubscriptionStore::new(pool.clone())),
            Arc::new(PgWebhookLedger::new(pool.clone())),
            Arc::new(PgAnalyticsStore::new(pool)),
            backend,
            stripe,
        ))
    }

    /// Assemble from explicit stores and remote clients
    pub fn with_components(
        config: &StripeConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn WebhookLedger>,
        analytics: Arc<dyn AnalyticsStore>,
        backend: Arc<dyn CheckoutBackend>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        let verifier = SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance);

        Self {
            checkout: CheckoutService::new(
                backend,
                processor,
                subscriptions.clone(),
                config.premium_price_id.clone(),
                config.payment_timeout,
            ),
            webhooks: WebhookConsumer::new(
                verifier,
                subscriptions.clone(),
                ledger,
                analytics.clone(),
            ),
            subscriptions,
            analytics,
        }
    }
}
