//! Subscription state store
//!
//! One record per user. Tier and status change only through lifecycle events
//! applied by the webhook consumer; checkout and cancellation merely read the
//! record or attach processor references to it.

use std::collections::HashMap;

use async_trait::async_trait;
use examprep_shared::{SubscriptionStatus, SubscriptionTier};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{LifecycleData, LifecycleEvent, LifecycleEventKind, SubscriptionSnapshot};

/// Persisted subscription state for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    /// Processor timestamp of the newest applied lifecycle event
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn new_free(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            customer_ref: None,
            subscription_ref: None,
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Active,
            trial_end: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            last_event_at: None,
            updated_at: now,
        }
    }

    /// Premium with a live processor subscription that can be canceled or resumed
    pub fn is_premium_eligible(&self) -> bool {
        self.tier.is_premium() && self.subscription_ref.is_some()
    }

    /// Premium now, scheduled to drop to free at period end
    pub fn pending_downgrade(&self) -> bool {
        self.tier.is_premium() && self.cancel_at_period_end
    }
}

/// Why a lifecycle event left the record untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Processor timestamp older than the last applied event
    Stale,
    /// Event concerns a subscription other than the one on record
    ForeignSubscription,
    /// `incomplete` never revokes an already granted premium tier
    IncompleteOnPremium,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Stale => "stale",
            SkipReason::ForeignSubscription => "foreign_subscription",
            SkipReason::IncompleteOnPremium => "incomplete_on_premium",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Apply(SubscriptionRecord),
    Skip(SkipReason),
}

/// Compute the record that results from applying `event` to `current`
///
/// Pure. Equal timestamps are applied so redelivery of the newest event is a
/// no-op rewrite rather than a skip.
pub fn next_state(current: &SubscriptionRecord, event: &LifecycleEvent) -> Transition {
    if let Some(last) = current.last_event_at {
        if event.occurred_at < last {
            return Transition::Skip(SkipReason::Stale);
        }
    }

    // A new subscription may replace the one on record; later events for the
    // replaced one must not touch the row.
    if event.kind != LifecycleEventKind::Created {
        if let (Some(on_record), Some(incoming)) =
            (current.subscription_ref.as_deref(), event.subscription_ref())
        {
            if on_record != incoming {
                return Transition::Skip(SkipReason::ForeignSubscription);
            }
        }
    }

    let mut next = current.clone();

    match (&event.kind, &event.data) {
        (LifecycleEventKind::Deleted, LifecycleData::Subscription(snapshot)) => {
            downgrade(&mut next, snapshot.canceled_at.or(Some(event.occurred_at)));
        }
        (
            LifecycleEventKind::Created | LifecycleEventKind::Updated,
            LifecycleData::Subscription(snapshot),
        ) => match snapshot.status {
            SubscriptionStatus::Active
            | SubscriptionStatus::Trialing
            | SubscriptionStatus::PastDue => grant_premium(&mut next, snapshot),
            SubscriptionStatus::Canceled => {
                downgrade(&mut next, snapshot.canceled_at.or(Some(event.occurred_at)));
            }
            SubscriptionStatus::Incomplete => {
                if current.tier.is_premium() {
                    return Transition::Skip(SkipReason::IncompleteOnPremium);
                }
                next.status = SubscriptionStatus::Incomplete;
                next.subscription_ref = None;
            }
        },
        (_, _) => {
            // invoice.payment_failed, or a payload shape that only carries refs
            next.status = SubscriptionStatus::PastDue;
        }
    }

    next.last_event_at = Some(event.occurred_at);
    Transition::Apply(next)
}

fn grant_premium(next: &mut SubscriptionRecord, snapshot: &SubscriptionSnapshot) {
    next.tier = SubscriptionTier::Premium;
    next.status = snapshot.status;
    next.subscription_ref = Some(snapshot.subscription_ref.clone());
    next.cancel_at_period_end = snapshot.cancel_at_period_end;
    next.canceled_at = snapshot.canceled_at;
    next.trial_end = snapshot.trial_end;
    next.current_period_start = snapshot.current_period_start;
    next.current_period_end = snapshot.current_period_end;
}

fn downgrade(next: &mut SubscriptionRecord, canceled_at: Option<OffsetDateTime>) {
    next.tier = SubscriptionTier::Free;
    next.status = SubscriptionStatus::Canceled;
    next.subscription_ref = None;
    next.cancel_at_period_end = false;
    next.canceled_at = canceled_at;
    next.trial_end = None;
}

/// Persistence for subscription records
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    /// Returns the user's record, creating a free one on first access
    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord>;

    async fn find_by_customer(&self, customer_ref: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    async fn attach_customer(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<SubscriptionRecord>;

    /// Persist a record produced by [`next_state`]
    ///
    /// Conditional on no newer event having landed since the record was read.
    /// Returns `false` when the write lost that race.
    async fn save_transition(&self, next: &SubscriptionRecord) -> BillingResult<bool>;

    /// Mirror the processor's cancel-at-period-end flag on a premium record
    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel: bool,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord>;
}

// ============ POSTGRES ============

const SUBSCRIPTION_COLUMNS: &str = "user_id, stripe_customer_id, stripe_subscription_id, tier, \
     status, trial_end, current_period_start, current_period_end, cancel_at_period_end, \
     canceled_at, last_event_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    tier: String,
    status: String,
    trial_end: Option<OffsetDateTime>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    last_event_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: row.user_id,
            customer_ref: row.stripe_customer_id,
            subscription_ref: row.stripe_subscription_id,
            tier: row
                .tier
                .parse()
                .map_err(|e: examprep_shared::ParseEnumError| BillingError::Database(e.to_string()))?,
            status: row
                .status
                .parse()
                .map_err(|e: examprep_shared::ParseEnumError| BillingError::Database(e.to_string()))?,
            trial_end: row.trial_end,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            last_event_at: row.last_event_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed subscription store
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        if let Some(record) = self.find(user_id).await? {
            return Ok(record);
        }

        sqlx::query("INSERT INTO subscriptions (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        tracing::debug!(user_id = %user_id, "Created free subscription record");

        self.find(user_id).await?.ok_or_else(|| {
            BillingError::Database(format!("subscription row for {} vanished after insert", user_id))
        })
    }

    async fn find_by_customer(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_customer_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn attach_customer(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from)
            .transpose()?
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))
    }

    async fn save_transition(&self, next: &SubscriptionRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET stripe_subscription_id = $2,
                tier = $3,
                status = $4,
                trial_end = $5,
                current_period_start = $6,
                current_period_end = $7,
                cancel_at_period_end = $8,
                canceled_at = $9,
                last_event_at = $10,
                updated_at = NOW()
            WHERE user_id = $1
              AND (last_event_at IS NULL OR last_event_at <= $10)
            "#,
        )
        .bind(next.user_id)
        .bind(&next.subscription_ref)
        .bind(next.tier.as_str())
        .bind(next.status.as_str())
        .bind(next.trial_end)
        .bind(next.current_period_start)
        .bind(next.current_period_end)
        .bind(next.cancel_at_period_end)
        .bind(next.canceled_at)
        .bind(next.last_event_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel: bool,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = $2, canceled_at = $3, updated_at = NOW()
            WHERE user_id = $1 AND tier = 'premium'
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(cancel)
        .bind(canceled_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from)
            .transpose()?
            .ok_or(BillingError::NoActiveSubscription)
    }
}

// ============ IN-MEMORY ============

/// In-process subscription store for tests and local runs
#[derive(Default)]
pub struct MemorySubscriptionStore {
    records: RwLock<HashMap<Uuid, SubscriptionRecord>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record directly
    pub async fn insert(&self, record: SubscriptionRecord) {
        self.records.write().await.insert(record.user_id, record);
    }

    pub async fn all(&self) -> Vec<SubscriptionRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.records.read().await.get(&user_id).cloned())
    }

    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let mut records = self.records.write().await;
        Ok(records
            .entry(user_id)
            .or_insert_with(|| SubscriptionRecord::new_free(user_id, OffsetDateTime::now_utc()))
            .clone())
    }

    async fn find_by_customer(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn attach_customer(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut records = self.records.write().await;

        if records
            .values()
            .any(|r| r.user_id != user_id && r.customer_ref.as_deref() == Some(customer_ref))
        {
            return Err(BillingError::Database(format!(
                "customer {} already linked to another user",
                customer_ref
            )));
        }

        let record = records
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))?;
        record.customer_ref = Some(customer_ref.to_string());
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn save_transition(&self, next: &SubscriptionRecord) -> BillingResult<bool> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&next.user_id) else {
            return Ok(false);
        };

        if let (Some(stored), Some(incoming)) = (record.last_event_at, next.last_event_at) {
            if stored > incoming {
                return Ok(false);
            }
        }

        let customer_ref = record.customer_ref.clone();
        *record = next.clone();
        record.customer_ref = customer_ref;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel: bool,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&user_id)
            .filter(|r| r.tier.is_premium())
            .ok_or(BillingError::NoActiveSubscription)?;
        record.cancel_at_period_end = cancel;
        record.canceled_at = canceled_at;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }
}
