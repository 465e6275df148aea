//! Billing Invariants Module
//!
//! Runnable consistency checks over subscription state and the webhook ledger.
//! Checks only read, never write. The worker runs them on a schedule and after
//! webhook replays.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::subscriptions::SubscriptionRecord;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may be getting (or denied) premium incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Combine summaries from independent checkers
    pub fn merge(mut self, other: InvariantCheckSummary) -> Self {
        self.checks_run += other.checks_run;
        self.checks_passed += other.checks_passed;
        self.checks_failed += other.checks_failed;
        self.healthy &= other.healthy;
        self.violations.extend(other.violations);
        self
    }
}

/// Record-level invariants, checked without a database
pub fn record_violations(record: &SubscriptionRecord) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if !record.tier.is_premium() && record.subscription_ref.is_some() {
        violations.push(InvariantViolation {
            invariant: "free_tier_has_no_subscription".to_string(),
            user_ids: vec![record.user_id],
            description: "Free tier record still references a processor subscription".to_string(),
            context: serde_json::json!({ "subscription_ref": record.subscription_ref }),
            severity: ViolationSeverity::Critical,
        });
    }

    if record.tier.is_premium()
        && (record.customer_ref.is_none() || record.subscription_ref.is_none())
    {
        violations.push(InvariantViolation {
            invariant: "premium_has_references".to_string(),
            user_ids: vec![record.user_id],
            description: "Premium record is missing its customer or subscription reference"
                .to_string(),
            context: serde_json::json!({
                "customer_ref": record.customer_ref,
                "subscription_ref": record.subscription_ref,
            }),
            severity: ViolationSeverity::Critical,
        });
    }

    if !record.tier.is_premium() && record.cancel_at_period_end {
        violations.push(InvariantViolation {
            invariant: "pending_downgrade_only_on_premium".to_string(),
            user_ids: vec![record.user_id],
            description: "Free tier record is flagged for downgrade at period end".to_string(),
            context: serde_json::json!({ "status": record.status }),
            severity: ViolationSeverity::Low,
        });
    }

    violations
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRefRow {
    user_id: Uuid,
    tier: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct FailedWebhookRow {
    stripe_event_id: String,
    event_type: String,
    error_message: Option<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "tier_matches_references" => self.check_tier_matches_references().await,
            "pending_downgrade_only_on_premium" => self.check_pending_downgrade().await,
            "premium_has_analytics_row" => self.check_premium_has_analytics_row().await,
            "webhook_events_not_stuck" => self.check_webhook_events_not_stuck().await,
            "webhook_errors_resolved" => self.check_webhook_errors_resolved().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "tier_matches_references",
            "pending_downgrade_only_on_premium",
            "premium_has_analytics_row",
            "webhook_events_not_stuck",
            "webhook_errors_resolved",
        ]
    }

    /// Free never references a subscription; premium always references both
    async fn check_tier_matches_references(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubscriptionRefRow> = sqlx::query_as(
            r#"
            SELECT user_id, tier, stripe_customer_id, stripe_subscription_id
            FROM subscriptions
            WHERE (tier = 'free' AND stripe_subscription_id IS NOT NULL)
               OR (tier = 'premium'
                   AND (stripe_customer_id IS NULL OR stripe_subscription_id IS NULL))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "tier_matches_references".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Tier '{}' disagrees with processor references",
                    row.tier
                ),
                context: serde_json::json!({
                    "tier": row.tier,
                    "stripe_customer_id": row.stripe_customer_id,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_pending_downgrade(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT user_id, status
            FROM subscriptions
            WHERE tier = 'free' AND cancel_at_period_end
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, status)| InvariantViolation {
                invariant: "pending_downgrade_only_on_premium".to_string(),
                user_ids: vec![user_id],
                description: "Free tier record is flagged for downgrade at period end".to_string(),
                context: serde_json::json!({ "status": status }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_premium_has_analytics_row(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT s.user_id
            FROM subscriptions s
            LEFT JOIN user_analytics a ON a.user_id = s.user_id
            WHERE s.tier = 'premium' AND a.user_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(vec![]);
        }

        let user_ids: Vec<Uuid> = rows.into_iter().map(|(id,)| id).collect();
        Ok(vec![InvariantViolation {
            invariant: "premium_has_analytics_row".to_string(),
            description: format!("{} premium users have no analytics row", user_ids.len()),
            context: serde_json::json!({ "count": user_ids.len() }),
            user_ids,
            severity: ViolationSeverity::Medium,
        }])
    }

    async fn check_webhook_events_not_stuck(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result IN ('processing', 'replaying')
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "webhook_events_not_stuck".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) stuck in processing",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "processing_started_at": row.processing_started_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Errors that survived at least one scheduled replay window
    async fn check_webhook_errors_resolved(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FailedWebhookRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, error_message
            FROM stripe_webhook_events
            WHERE processing_result = 'error'
              AND created_at < NOW() - INTERVAL '1 hour'
            ORDER BY created_at ASC
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "webhook_errors_resolved".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) still failing after replay",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "error_message": row.error_message,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
