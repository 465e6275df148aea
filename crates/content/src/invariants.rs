//! Content Invariants Module
//!
//! Read-only checks over sessions and results. Violations use the same
//! shape as the billing checks so the worker can report them together.

use examprep_billing::{InvariantCheckSummary, InvariantViolation, ViolationSeverity};
use examprep_shared::SessionStatus;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ContentResult;
use crate::sessions::{ContentSession, ResultRecord};

/// Session-level invariants, checked without a database
pub fn session_violations(
    session: &ContentSession,
    result: Option<&ResultRecord>,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if let Some(completed_at) = session.completed_at {
        if completed_at < session.started_at {
            violations.push(InvariantViolation {
                invariant: "completed_after_started".to_string(),
                user_ids: vec![session.user_id],
                description: format!("Session {} completed before it started", session.id),
                context: serde_json::json!({ "session_id": session.id }),
                severity: ViolationSeverity::High,
            });
        }
    }

    if session.answered_count > session.requested_count {
        violations.push(InvariantViolation {
            invariant: "answered_within_requested".to_string(),
            user_ids: vec![session.user_id],
            description: format!(
                "Session {} has {} answers for {} items",
                session.id, session.answered_count, session.requested_count
            ),
            context: serde_json::json!({ "session_id": session.id }),
            severity: ViolationSeverity::High,
        });
    }

    match (session.status, result) {
        (SessionStatus::Completed, None) => violations.push(InvariantViolation {
            invariant: "completed_has_result".to_string(),
            user_ids: vec![session.user_id],
            description: format!("Completed session {} has no result", session.id),
            context: serde_json::json!({ "session_id": session.id }),
            severity: ViolationSeverity::Critical,
        }),
        (status, Some(_)) if status != SessionStatus::Completed => {
            violations.push(InvariantViolation {
                invariant: "result_without_completed_session".to_string(),
                user_ids: vec![session.user_id],
                description: format!("Session {} is {} but has a result", session.id, status),
                context: serde_json::json!({ "session_id": session.id }),
                severity: ViolationSeverity::High,
            })
        }
        _ => {}
    }

    if let Some(result) = result {
        if result.report.all_scores().any(|s| !(0.0..=100.0).contains(&s)) {
            violations.push(InvariantViolation {
                invariant: "scores_within_bounds".to_string(),
                user_ids: vec![session.user_id],
                description: format!("Result {} has a score outside 0-100", result.id),
                context: serde_json::json!({ "result_id": result.id }),
                severity: ViolationSeverity::High,
            });
        }
    }

    violations
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRefRow {
    id: Uuid,
    user_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionTimingRow {
    id: Uuid,
    user_id: Uuid,
    started_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

/// Service for running content invariant checks
pub struct ContentInvariantChecker {
    pool: PgPool,
}

impl ContentInvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> ContentResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    pub async fn run_check(&self, name: &str) -> ContentResult<Vec<InvariantViolation>> {
        match name {
            "completed_has_result" => self.check_completed_has_result().await,
            "result_without_completed_session" => self.check_result_without_completed().await,
            "completed_after_started" => self.check_completed_after_started().await,
            "answered_within_requested" => self.check_answered_within_requested().await,
            "scores_within_bounds" => self.check_scores_within_bounds().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "completed_has_result",
            "result_without_completed_session",
            "completed_after_started",
            "answered_within_requested",
            "scores_within_bounds",
        ]
    }

    async fn check_completed_has_result(&self) -> ContentResult<Vec<InvariantViolation>> {
        let rows: Vec<SessionRefRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.user_id, s.status
            FROM content_sessions s
            LEFT JOIN session_results r ON r.session_id = s.id
            WHERE s.status = 'completed' AND r.id IS NULL
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_has_result".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Completed session {} has no result", row.id),
                context: serde_json::json!({ "session_id": row.id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_result_without_completed(&self) -> ContentResult<Vec<InvariantViolation>> {
        let rows: Vec<SessionRefRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.user_id, s.status
            FROM session_results r
            JOIN content_sessions s ON s.id = r.session_id
            WHERE s.status <> 'completed'
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "result_without_completed_session".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Session {} is {} but has a result", row.id, row.status),
                context: serde_json::json!({ "session_id": row.id, "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_completed_after_started(&self) -> ContentResult<Vec<InvariantViolation>> {
        let rows: Vec<SessionTimingRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, started_at, completed_at
            FROM content_sessions
            WHERE completed_at < started_at
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_after_started".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Session {} completed before it started", row.id),
                context: serde_json::json!({
                    "session_id": row.id,
                    "started_at": row.started_at.to_string(),
                    "completed_at": row.completed_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_answered_within_requested(&self) -> ContentResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Uuid, i32, i32)> = sqlx::query_as(
            r#"
            SELECT id, user_id, answered_count, requested_count
            FROM content_sessions
            WHERE answered_count > requested_count
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, user_id, answered, requested)| InvariantViolation {
                invariant: "answered_within_requested".to_string(),
                user_ids: vec![user_id],
                description: format!(
                    "Session {} has {} answers for {} items",
                    id, answered, requested
                ),
                context: serde_json::json!({ "session_id": id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Section and category scores live in JSONB, so the bound is checked element-wise
    async fn check_scores_within_bounds(&self) -> ContentResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT r.id, r.user_id
            FROM session_results r
            WHERE r.overall_score NOT BETWEEN 0 AND 100
               OR EXISTS (
                   SELECT 1 FROM jsonb_array_elements(r.section_scores) e
                   WHERE (e->>'score')::double precision NOT BETWEEN 0 AND 100
               )
               OR EXISTS (
                   SELECT 1 FROM jsonb_array_elements(r.category_scores) e
                   WHERE e->>'score' IS NOT NULL
                     AND (e->>'score')::double precision NOT BETWEEN 0 AND 100
               )
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, user_id)| InvariantViolation {
                invariant: "scores_within_bounds".to_string(),
                user_ids: vec![user_id],
                description: format!("Result {} has a score outside 0-100", id),
                context: serde_json::json!({ "result_id": id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GenerationMetadata;
    use crate::scoring;
    use examprep_shared::ContentKind;
    use std::collections::BTreeMap;
    use time::macros::datetime;

    fn session() -> ContentSession {
        ContentSession::new_in_progress(
            Uuid::new_v4(),
            ContentKind::Practice,
            None,
            None,
            vec![],
            GenerationMetadata::default(),
            datetime!(2024-06-03 10:00 UTC),
        )
    }

    fn result_for(session: &ContentSession) -> ResultRecord {
        ResultRecord {
            id: Uuid::new_v4(),
            session_id: session.id,
            user_id: session.user_id,
            kind: session.kind,
            report: scoring::score(session.kind, &session.items, &BTreeMap::new()),
            answers: BTreeMap::new(),
            created_at: datetime!(2024-06-03 10:10 UTC),
        }
    }

    #[test]
    fn test_available_checks() {
        assert_eq!(ContentInvariantChecker::available_checks().len(), 5);
    }

    #[test]
    fn test_healthy_in_progress_session() {
        assert!(session_violations(&session(), None).is_empty());
    }

    #[test]
    fn test_completed_without_result() {
        let mut s = session();
        s.status = SessionStatus::Completed;
        s.completed_at = Some(datetime!(2024-06-03 09:00 UTC));
        s.answered_count = 3;

        let names: Vec<_> = session_violations(&s, None)
            .into_iter()
            .map(|v| v.invariant)
            .collect();
        assert_eq!(
            names,
            vec!["completed_after_started", "answered_within_requested", "completed_has_result"]
        );
    }

    #[test]
    fn test_result_on_abandoned_session() {
        let mut s = session();
        s.status = SessionStatus::Abandoned;
        let result = result_for(&s);

        let violations = session_violations(&s, Some(&result));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "result_without_completed_session");
    }

    #[test]
    fn test_out_of_range_score() {
        let mut s = session();
        s.status = SessionStatus::Completed;
        let mut result = result_for(&s);
        result.report.overall_score = 101.0;

        let violations = session_violations(&s, Some(&result));
        assert_eq!(violations[0].invariant, "scores_within_bounds");
    }
}
