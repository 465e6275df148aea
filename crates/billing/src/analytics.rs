//! Per-user analytics read model
//!
//! Rows are created when a user first becomes premium and counters bump as
//! sessions complete. Failures here never fail the caller; callers log and
//! move on.

use std::collections::HashMap;

use async_trait::async_trait;
use examprep_shared::ContentKind;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserAnalytics {
    pub user_id: Uuid,
    pub exams_completed: i32,
    pub practice_sessions_completed: i32,
}

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Create the user's row if missing. Returns `true` when this call created it.
    async fn ensure_user_row(&self, user_id: Uuid) -> BillingResult<bool>;

    async fn record_completion(&self, user_id: Uuid, kind: ContentKind) -> BillingResult<()>;

    async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserAnalytics>>;
}

#[derive(Clone)]
pub struct PgAnalyticsStore {
    pool: PgPool,
}

impl PgAnalyticsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalyticsStore for PgAnalyticsStore {
    async fn ensure_user_row(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "INSERT INTO user_analytics (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_completion(&self, user_id: Uuid, kind: ContentKind) -> BillingResult<()> {
        let (exams, practice) = match kind {
            ContentKind::Exam => (1, 0),
            ContentKind::Practice => (0, 1),
        };

        sqlx::query(
            r#"
            INSERT INTO user_analytics (user_id, exams_completed, practice_sessions_completed)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                exams_completed = user_analytics.exams_completed + EXCLUDED.exams_completed,
                practice_sessions_completed =
                    user_analytics.practice_sessions_completed + EXCLUDED.practice_sessions_completed,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(exams)
        .bind(practice)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserAnalytics>> {
        let row = sqlx::query_as(
            r#"
            SELECT user_id, exams_completed, practice_sessions_completed
            FROM user_analytics
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[derive(Default)]
pub struct MemoryAnalyticsStore {
    rows: RwLock<HashMap<Uuid, UserAnalytics>>,
}

impl MemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalyticsStore {
    async fn ensure_user_row(&self, user_id: Uuid) -> BillingResult<bool> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&user_id) {
            return Ok(false);
        }
        rows.insert(
            user_id,
            UserAnalytics {
                user_id,
                ..Default::default()
            },
        );
        Ok(true)
    }

    async fn record_completion(&self, user_id: Uuid, kind: ContentKind) -> BillingResult<()> {
        let mut rows = self.rows.write().await;
        let row = rows.entry(user_id).or_insert_with(|| UserAnalytics {
            user_id,
            ..Default::default()
        });
        match kind {
            ContentKind::Exam => row.exams_completed += 1,
            ContentKind::Practice => row.practice_sessions_completed += 1,
        }
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserAnalytics>> {
        Ok(self.rows.read().await.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_row_is_idempotent() {
        let store = MemoryAnalyticsStore::new();
        let user_id = Uuid::new_v4();
        assert!(store.ensure_user_row(user_id).await.unwrap());
        assert!(!store.ensure_user_row(user_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_counters() {
        let store = MemoryAnalyticsStore::new();
        let user_id = Uuid::new_v4();
        store.record_completion(user_id, ContentKind::Exam).await.unwrap();
        store.record_completion(user_id, ContentKind::Practice).await.unwrap();
        store.record_completion(user_id, ContentKind::Practice).await.unwrap();

        let row = store.get(user_id).await.unwrap().unwrap();
        assert_eq!(row.exams_completed, 1);
        assert_eq!(row.practice_sessions_completed, 2);
    }
}
