//! Quota ledger
//!
//! Eligibility is derived on demand from the user's current tier and their
//! completed sessions; nothing here is stored. Free-tier exams are limited per
//! fixed UTC week (Sunday 00:00 through the following Sunday 00:00), practice is
//! limited only by the item count of a single request.

use std::sync::Arc;

use examprep_billing::SubscriptionStore;
use examprep_shared::{ContentKind, SubscriptionTier};
use serde::Serialize;
use time::{Duration, OffsetDateTime, Time, UtcOffset};
use uuid::Uuid;

use crate::error::ContentResult;
use crate::sessions::SessionStore;

/// Feature limits for a subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub tier: SubscriptionTier,
    /// Completed exams per UTC week. None = unlimited.
    pub weekly_exams: Option<u32>,
    /// Items in a single practice request
    pub practice_item_cap: u32,
}

impl TierLimits {
    /// | Tier    | Exams/week | Practice items/request |
    /// |---------|------------|------------------------|
    /// | Free    | 1          | 5                      |
    /// | Premium | Unlimited  | 50                     |
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Free => Self {
                tier,
                weekly_exams: Some(1),
                practice_item_cap: 5,
            },
            SubscriptionTier::Premium => Self {
                tier,
                weekly_exams: None,
                practice_item_cap: 50,
            },
        }
    }

    pub fn exam_limit_reached(&self, completed_this_week: u64) -> bool {
        self.weekly_exams
            .map(|max| completed_this_week >= u64::from(max))
            .unwrap_or(false)
    }
}

/// Bounds of the UTC week containing `now`: `[Sunday 00:00, next Sunday 00:00)`
pub fn week_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let utc = now.to_offset(UtcOffset::UTC);
    let days_since_sunday = i64::from(utc.weekday().number_days_from_sunday());
    let start = utc.replace_time(Time::MIDNIGHT) - Duration::days(days_since_sunday);
    (start, start + Duration::days(7))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityCode {
    Eligible,
    WeeklyExamLimit,
}

/// Answer to "may this user start a new session of this kind now"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub code: EligibilityCode,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_available_at: Option<OffsetDateTime>,
    pub tier: SubscriptionTier,
    /// Item cap for a practice request, when `kind` is practice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u32>,
}

/// Pure eligibility decision
pub fn evaluate(
    tier: SubscriptionTier,
    kind: ContentKind,
    completed_this_week: u64,
    now: OffsetDateTime,
) -> Eligibility {
    let limits = TierLimits::for_tier(tier);

    match kind {
        ContentKind::Practice => Eligibility {
            eligible: true,
            code: EligibilityCode::Eligible,
            reason: format!(
                "Practice sets of up to {} questions are available",
                limits.practice_item_cap
            ),
            next_available_at: None,
            tier,
            max_items: Some(limits.practice_item_cap),
        },
        ContentKind::Exam if limits.exam_limit_reached(completed_this_week) => {
            let (_, next_window) = week_window(now);
            Eligibility {
                eligible: false,
                code: EligibilityCode::WeeklyExamLimit,
                reason: "You've used your free exam for this week. Upgrade to premium for unlimited exams, or come back on Sunday.".to_string(),
                next_available_at: Some(next_window),
                tier,
                max_items: None,
            }
        }
        ContentKind::Exam => Eligibility {
            eligible: true,
            code: EligibilityCode::Eligible,
            reason: if tier.is_premium() {
                "Unlimited exams with premium".to_string()
            } else {
                "Your free exam for this week is available".to_string()
            },
            next_available_at: None,
            tier,
            max_items: None,
        },
    }
}

/// Reads tier and session history to answer eligibility queries
#[derive(Clone)]
pub struct QuotaLedger {
    subscriptions: Arc<dyn SubscriptionStore>,
    sessions: Arc<dyn SessionStore>,
}

impl QuotaLedger {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            subscriptions,
            sessions,
        }
    }

    /// Current tier, read fresh on every call
    pub async fn tier(&self, user_id: Uuid) -> ContentResult<SubscriptionTier> {
        let record = self.subscriptions.get_or_create(user_id).await?;
        Ok(record.tier)
    }

    pub async fn check_eligibility(
        &self,
        user_id: Uuid,
        kind: ContentKind,
    ) -> ContentResult<Eligibility> {
        self.check_eligibility_at(user_id, kind, OffsetDateTime::now_utc())
            .await
    }

    pub async fn check_eligibility_at(
        &self,
        user_id: Uuid,
        kind: ContentKind,
        now: OffsetDateTime,
    ) -> ContentResult<Eligibility> {
        let tier = self.tier(user_id).await?;

        let completed_this_week = match (kind, TierLimits::for_tier(tier).weekly_exams) {
            (ContentKind::Exam, Some(_)) => {
                let (start, end) = week_window(now);
                self.sessions
                    .count_completed_since(user_id, kind, start, end)
                    .await?
            }
            _ => 0,
        };

        let eligibility = evaluate(tier, kind, completed_this_week, now);
        tracing::debug!(
            user_id = %user_id,
            kind = %kind,
            tier = %tier,
            completed_this_week,
            eligible = eligibility.eligible,
            "Checked eligibility"
        );

        Ok(eligibility)
    }
}
