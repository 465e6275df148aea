//! Stripe webhook consumer
//!
//! Verifies signatures, records every lifecycle event in a ledger keyed by the
//! processor event id, and applies it to the subscription store. Once the
//! signature checks out the caller always acknowledges; processing failures
//! are recorded in the ledger and picked up by replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use examprep_shared::{ErrorCategory, SubscriptionStatus, SubscriptionTier};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::analytics::AnalyticsStore;
use crate::error::{BillingError, BillingResult};
use crate::events::{parse_event, LifecycleEvent, ParsedEvent};
use crate::subscriptions::{next_state, SkipReason, SubscriptionStore, Transition};

type HmacSha256 = Hmac<Sha256>;

/// Events stuck in `processing` or `replaying` longer than this may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

// ============ SIGNATURES ============

/// Verifies the `Stripe-Signature` header (`t=<unix>,v1=<hex hmac>`)
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn verify(&self, payload: &str, header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc())
    }

    pub fn verify_at(&self, payload: &str, header: &str, now: OffsetDateTime) -> BillingResult<()> {
        if self.secret.is_empty() {
            tracing::error!("Webhook secret is not configured");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        // Several v1 entries appear while a secret is being rolled
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let skew = (now.unix_timestamp() - timestamp).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now.unix_timestamp(),
                skew_secs = skew,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = self.compute(payload, timestamp)?;
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Build a header value for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        Ok(format!("t={},v1={}", timestamp, self.compute(payload, timestamp)?))
    }

    fn compute(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

// ============ LEDGER ============

/// Processing state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Processing,
    Success,
    Skipped,
    Error,
    Replaying,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Skipped => "skipped",
            ProcessingResult::Error => "error",
            ProcessingResult::Replaying => "replaying",
        }
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    #[serde(skip_serializing)]
    pub payload: serde_json::Value,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Idempotency ledger for processor events
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Atomically claim exclusive processing rights for an event
    ///
    /// Returns `false` when the event was already seen and is not stuck.
    async fn claim(&self, event: &LifecycleEvent, payload: &serde_json::Value)
        -> BillingResult<bool>;

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error: Option<&str>,
    ) -> BillingResult<()>;

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Most recent first
    async fn list(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Events in `error`, plus replays abandoned past the timeout, oldest first
    async fn failed_event_ids(&self, limit: i64) -> BillingResult<Vec<String>>;

    async fn mark_replaying(&self, event_id: &str) -> BillingResult<()>;
}

const LEDGER_COLUMNS: &str = "id, stripe_event_id, event_type, event_timestamp, payload, \
     processing_result, processing_started_at, error_message, created_at";

#[derive(Clone)]
pub struct PgWebhookLedger {
    pool: PgPool,
}

impl PgWebhookLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLedger for PgWebhookLedger {
    async fn claim(
        &self,
        event: &LifecycleEvent,
        payload: &serde_json::Value,
    ) -> BillingResult<bool> {
        // Only one concurrent delivery gets a row back. Rows stuck in
        // 'processing' or 'replaying' past the timeout can be reclaimed.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result IN ('processing', 'replaying')
              AND stripe_webhook_events.processing_started_at < NOW() - ($5 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event.event_id)
        .bind(event.kind.as_event_type())
        .bind(event.occurred_at)
        .bind(payload)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as(&format!(
            "SELECT {} FROM stripe_webhook_events WHERE stripe_event_id = $1",
            LEDGER_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM stripe_webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            LEDGER_COLUMNS
        ))
        .bind(result.map(|r| r.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn failed_event_ids(&self, limit: i64) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_event_id
            FROM stripe_webhook_events
            WHERE processing_result = 'error'
               OR (processing_result = 'replaying'
                   AND processing_started_at < NOW() - ($2 || ' minutes')::INTERVAL)
            ORDER BY event_timestamp ASC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_replaying(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                error_message = CONCAT('Replay initiated. Previous error: ', COALESCE(error_message, 'none'))
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Claimed for processing or replay and never finished within the timeout
fn is_stuck(record: &WebhookEventRecord, now: OffsetDateTime) -> bool {
    let in_flight = record.processing_result == ProcessingResult::Processing.as_str()
        || record.processing_result == ProcessingResult::Replaying.as_str();
    in_flight
        && record.processing_started_at.is_some_and(|started| {
            now - started > time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES.into())
        })
}

/// In-process ledger for tests and local runs
#[derive(Default)]
pub struct MemoryWebhookLedger {
    records: RwLock<HashMap<String, WebhookEventRecord>>,
}

impl MemoryWebhookLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move an event's claim time into the past
    #[cfg(test)]
    pub(crate) async fn backdate_claim(&self, event_id: &str, by: time::Duration) {
        if let Some(record) = self.records.write().await.get_mut(event_id) {
            record.processing_started_at = record.processing_started_at.map(|t| t - by);
        }
    }
}

#[async_trait]
impl WebhookLedger for MemoryWebhookLedger {
    async fn claim(
        &self,
        event: &LifecycleEvent,
        payload: &serde_json::Value,
    ) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut records = self.records.write().await;

        if let Some(existing) = records.get_mut(&event.event_id) {
            if !is_stuck(existing, now) {
                return Ok(false);
            }
            existing.processing_result = ProcessingResult::Processing.as_str().to_string();
            existing.processing_started_at = Some(now);
            existing.error_message = Some(format!("Recovered from stuck state at {}", now));
            return Ok(true);
        }

        records.insert(
            event.event_id.clone(),
            WebhookEventRecord {
                id: Uuid::new_v4(),
                stripe_event_id: event.event_id.clone(),
                event_type: event.kind.as_event_type().to_string(),
                event_timestamp: event.occurred_at,
                payload: payload.clone(),
                processing_result: ProcessingResult::Processing.as_str().to_string(),
                processing_started_at: Some(now),
                error_message: None,
                created_at: now,
            },
        );
        Ok(true)
    }

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(record) = self.records.write().await.get_mut(event_id) {
            record.processing_result = result.as_str().to_string();
            record.error_message = error.map(str::to_string);
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.records.read().await.get(event_id).cloned())
    }

    async fn list(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| result.map_or(true, |want| r.processing_result == want.as_str()))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn failed_event_ids(&self, limit: i64) -> BillingResult<Vec<String>> {
        let now = OffsetDateTime::now_utc();
        let mut failed: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.processing_result == ProcessingResult::Error.as_str()
                    || (r.processing_result == ProcessingResult::Replaying.as_str()
                        && is_stuck(r, now))
            })
            .map(|r| (r.event_timestamp, r.stripe_event_id.clone()))
            .collect();
        failed.sort();
        Ok(failed
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn mark_replaying(&self, event_id: &str) -> BillingResult<()> {
        if let Some(record) = self.records.write().await.get_mut(event_id) {
            record.processing_result = ProcessingResult::Replaying.as_str().to_string();
            record.processing_started_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }
}

// ============ CONSUMER ============

/// What applying a single lifecycle event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        user_id: Uuid,
        previous_tier: SubscriptionTier,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
    },
    Skipped {
        user_id: Uuid,
        reason: SkipReason,
    },
}

/// Acknowledgement returned for every delivery with a valid signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookReceipt {
    Processed {
        event_id: String,
        #[serde(flatten)]
        outcome: ApplyOutcome,
    },
    Duplicate {
        event_id: String,
    },
    Ignored {
        event_type: String,
    },
    Failed {
        event_id: Option<String>,
        category: ErrorCategory,
    },
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

pub struct WebhookConsumer {
    verifier: SignatureVerifier,
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn WebhookLedger>,
    analytics: Arc<dyn AnalyticsStore>,
}

impl WebhookConsumer {
    pub fn new(
        verifier: SignatureVerifier,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn WebhookLedger>,
        analytics: Arc<dyn AnalyticsStore>,
    ) -> Self {
        Self {
            verifier,
            subscriptions,
            ledger,
            analytics,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn WebhookLedger> {
        &self.ledger
    }

    /// Entry point for an inbound delivery
    ///
    /// Errors only when the signature is missing or invalid. Every verified
    /// delivery is acknowledged, whatever happened while processing it.
    pub async fn receive(&self, payload: &str, signature: &str) -> BillingResult<WebhookReceipt> {
        self.verifier.verify(payload, signature)?;

        let parsed = match parse_event(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload_len = payload.len(),
                    "Verified webhook payload could not be decoded"
                );
                return Ok(WebhookReceipt::Failed {
                    event_id: None,
                    category: e.category(),
                });
            }
        };

        match parsed {
            ParsedEvent::Unhandled {
                event_id,
                event_type,
            } => {
                tracing::debug!(event_id = %event_id, event_type = %event_type, "Unhandled webhook event type");
                Ok(WebhookReceipt::Ignored { event_type })
            }
            ParsedEvent::Lifecycle(event) => {
                let raw: serde_json::Value =
                    serde_json::from_str(payload).unwrap_or(serde_json::Value::Null);
                Ok(self.handle_event(&event, &raw).await)
            }
        }
    }

    /// Claim, apply and record a decoded event
    pub async fn handle_event(
        &self,
        event: &LifecycleEvent,
        payload: &serde_json::Value,
    ) -> WebhookReceipt {
        match self.ledger.claim(event, payload).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = event.kind.as_event_type(),
                    "Duplicate webhook event - atomic idempotency check"
                );
                return WebhookReceipt::Duplicate {
                    event_id: event.event_id.clone(),
                };
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                return WebhookReceipt::Failed {
                    event_id: Some(event.event_id.clone()),
                    category: e.category(),
                };
            }
        }

        tracing::info!(
            event_id = %event.event_id,
            event_type = event.kind.as_event_type(),
            "Processing Stripe webhook event (claimed exclusive processing rights)"
        );

        let result = self.apply_lifecycle_event(event).await;
        self.record_result(event, &result).await;

        match result {
            Ok(outcome) => WebhookReceipt::Processed {
                event_id: event.event_id.clone(),
                outcome,
            },
            Err(e) => WebhookReceipt::Failed {
                event_id: Some(event.event_id.clone()),
                category: e.category(),
            },
        }
    }

    /// Apply one lifecycle event to the subscription store
    ///
    /// Idempotent: applying the same event twice leaves the same record.
    pub async fn apply_lifecycle_event(&self, event: &LifecycleEvent) -> BillingResult<ApplyOutcome> {
        let current = self
            .subscriptions
            .find_by_customer(&event.customer_ref)
            .await?
            .ok_or_else(|| {
                tracing::error!(
                    event_id = %event.event_id,
                    customer_id = %event.customer_ref,
                    event_type = event.kind.as_event_type(),
                    "RECONCILIATION NEEDED: lifecycle event for customer with no linked user"
                );
                BillingError::UnknownCustomer(event.customer_ref.clone())
            })?;

        let next = match next_state(&current, event) {
            Transition::Skip(reason) => {
                tracing::info!(
                    event_id = %event.event_id,
                    user_id = %current.user_id,
                    reason = reason.as_str(),
                    "Lifecycle event left subscription unchanged"
                );
                return Ok(ApplyOutcome::Skipped {
                    user_id: current.user_id,
                    reason,
                });
            }
            Transition::Apply(next) => next,
        };

        if !self.subscriptions.save_transition(&next).await? {
            tracing::info!(
                event_id = %event.event_id,
                user_id = %current.user_id,
                "Newer lifecycle event landed concurrently, discarding"
            );
            return Ok(ApplyOutcome::Skipped {
                user_id: current.user_id,
                reason: SkipReason::Stale,
            });
        }

        tracing::info!(
            event_id = %event.event_id,
            user_id = %current.user_id,
            from_tier = %current.tier,
            to_tier = %next.tier,
            from_status = %current.status,
            to_status = %next.status,
            "Applied subscription lifecycle event"
        );

        if !current.tier.is_premium() && next.tier.is_premium() {
            if let Err(e) = self.analytics.ensure_user_row(current.user_id).await {
                tracing::warn!(
                    user_id = %current.user_id,
                    error = %e,
                    "Failed to create analytics row on premium upgrade"
                );
            }
        }

        Ok(ApplyOutcome::Applied {
            user_id: current.user_id,
            previous_tier: current.tier,
            tier: next.tier,
            status: next.status,
        })
    }

    async fn record_result(&self, event: &LifecycleEvent, result: &BillingResult<ApplyOutcome>) {
        let (processing_result, error_message) = ledger_entry(result);

        let first = self
            .ledger
            .finish(&event.event_id, processing_result, error_message.as_deref())
            .await;

        if let Err(e) = first {
            tracing::warn!(
                event_id = %event.event_id,
                error = %e,
                "First attempt to update webhook event failed, retrying..."
            );

            if let Err(retry_err) = self
                .ledger
                .finish(&event.event_id, processing_result, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = event.kind.as_event_type(),
                    processing_result = processing_result.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: Failed to update webhook audit record after retry. \
                     Event may appear stuck in 'processing' state."
                );
            }
        }
    }

    // ============ WEBHOOK REPLAY ============

    /// Re-apply a recorded event from its stored payload
    pub async fn replay_event(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(stripe_event_id = %event_id, "Attempting to replay webhook event");

        let record = self.ledger.get(event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Webhook event {} not found", event_id))
        })?;

        let payload = record.payload.to_string();
        let event = match parse_event(&payload)? {
            ParsedEvent::Lifecycle(event) => event,
            ParsedEvent::Unhandled { event_type, .. } => {
                return Err(BillingError::InvalidInput(format!(
                    "Event type {} is not replayable",
                    event_type
                )))
            }
        };

        self.ledger.mark_replaying(event_id).await?;

        let result = self.apply_lifecycle_event(&event).await;
        self.record_result(&event, &result).await;

        let (new_status, new_error) = ledger_entry(&result);

        tracing::info!(
            stripe_event_id = %event_id,
            previous_status = %record.processing_result,
            new_status = new_status.as_str(),
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            stripe_event_id: event_id.to_string(),
            event_type: record.event_type,
            previous_status: record.processing_result,
            previous_error: record.error_message,
            new_status: new_status.as_str().to_string(),
            new_error,
            success: result.is_ok(),
        })
    }

    /// Replay failed events in processor-timestamp order
    pub async fn replay_failed(&self, max_events: Option<i64>) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(100);
        let failed = self.ledger.failed_event_ids(limit).await?;
        let mut results = Vec::with_capacity(failed.len());

        for event_id in failed {
            match self.replay_event(&event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        stripe_event_id: event_id,
                        event_type: "unknown".to_string(),
                        previous_status: ProcessingResult::Error.as_str().to_string(),
                        previous_error: None,
                        new_status: ProcessingResult::Error.as_str().to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}

fn ledger_entry(result: &BillingResult<ApplyOutcome>) -> (ProcessingResult, Option<String>) {
    match result {
        Ok(ApplyOutcome::Applied { .. }) => (ProcessingResult::Success, None),
        Ok(ApplyOutcome::Skipped { reason, .. }) => {
            (ProcessingResult::Skipped, Some(reason.as_str().to_string()))
        }
        Err(e) => (ProcessingResult::Error, Some(e.to_string())),
    }
}
