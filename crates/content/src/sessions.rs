//! Content session and result store
//!
//! Sessions are created in `in_progress` when generation succeeds and move
//! once to a terminal status. The completing write and the result insert run
//! in one transaction, conditional on the session still being in progress, so
//! concurrent submissions converge on a single result.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use examprep_shared::{ContentKind, SessionStatus};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ContentError, ContentResult};
use crate::generator::{GeneratedItem, GenerationMetadata, PracticeCriteria};
use crate::scoring::ScoreReport;

/// One generated exam or practice attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: ContentKind,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Items delivered to the user, which is the bound `answered_count` is
    /// checked against. Can be below the criteria `count` when the generator
    /// returns a short set; the criteria keep the original ask.
    pub requested_count: u32,
    pub answered_count: u32,
    pub elapsed_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub practice: Option<PracticeCriteria>,
    pub items: Vec<GeneratedItem>,
    pub generation: GenerationMetadata,
}

impl ContentSession {
    pub fn new_in_progress(
        user_id: Uuid,
        kind: ContentKind,
        request_id: Option<Uuid>,
        practice: Option<PracticeCriteria>,
        items: Vec<GeneratedItem>,
        generation: GenerationMetadata,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            status: SessionStatus::InProgress,
            request_id,
            started_at: now,
            completed_at: None,
            requested_count: items.len() as u32,
            answered_count: 0,
            elapsed_seconds: None,
            practice,
            items,
            generation,
        }
    }

    pub fn contains_item(&self, item_id: &str) -> bool {
        self.items.iter().any(|i| i.id == item_id)
    }

    /// Copy safe to show while answering: answer keys and explanations removed
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.status == SessionStatus::InProgress {
            for item in &mut copy.items {
                item.correct_answer.clear();
                item.explanation.clear();
            }
        }
        copy
    }
}

/// Immutable scoring outcome for one completed session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub kind: ContentKind,
    #[serde(flatten)]
    pub report: ScoreReport,
    pub answers: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields written when a session completes
#[derive(Debug, Clone)]
pub struct Completion {
    pub answered_count: u32,
    pub elapsed_seconds: Option<u32>,
    pub completed_at: OffsetDateTime,
    pub result: ResultRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    /// This call moved the session to completed and stored the result
    Completed(ResultRecord),
    /// Another writer got there first; the session is already terminal
    AlreadyTerminal,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. When the (user, request_id) pair already exists,
    /// the stored session is returned instead.
    async fn insert(&self, session: &ContentSession) -> ContentResult<ContentSession>;

    async fn get(&self, session_id: Uuid) -> ContentResult<Option<ContentSession>>;

    async fn find_by_request(
        &self,
        user_id: Uuid,
        request_id: Uuid,
    ) -> ContentResult<Option<ContentSession>>;

    /// Completed sessions of `kind` started in `[start, end)`
    async fn count_completed_since(
        &self,
        user_id: Uuid,
        kind: ContentKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> ContentResult<u64>;

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> ContentResult<Vec<ContentSession>>;

    async fn complete(&self, session_id: Uuid, completion: &Completion) -> ContentResult<CompleteOutcome>;

    /// Move an in-progress session to abandoned. Returns false if it was already terminal.
    async fn abandon(&self, session_id: Uuid, at: OffsetDateTime) -> ContentResult<bool>;

    async fn get_result(&self, session_id: Uuid) -> ContentResult<Option<ResultRecord>>;
}

// ============ POSTGRES ============

const SESSION_COLUMNS: &str = "id, user_id, kind, status, request_id, started_at, completed_at, \
     requested_count, answered_count, elapsed_seconds, practice, items, generation";

const RESULT_COLUMNS: &str = "id, session_id, user_id, kind, overall_score, section_scores, \
     category_scores, strengths, weaknesses, guidance, answers, created_at";

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    status: String,
    request_id: Option<Uuid>,
    started_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    requested_count: i32,
    answered_count: i32,
    elapsed_seconds: Option<i32>,
    practice: Option<Json<PracticeCriteria>>,
    items: Json<Vec<GeneratedItem>>,
    generation: Json<GenerationMetadata>,
}

fn parse_enum<T: std::str::FromStr<Err = examprep_shared::ParseEnumError>>(
    raw: &str,
) -> ContentResult<T> {
    raw.parse().map_err(|e: examprep_shared::ParseEnumError| ContentError::Database(e.to_string()))
}

impl TryFrom<SessionRow> for ContentSession {
    type Error = ContentError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            kind: parse_enum(&row.kind)?,
            status: parse_enum(&row.status)?,
            request_id: row.request_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            requested_count: row.requested_count.max(0) as u32,
            answered_count: row.answered_count.max(0) as u32,
            elapsed_seconds: row.elapsed_seconds.map(|s| s.max(0) as u32),
            practice: row.practice.map(|p| p.0),
            items: row.items.0,
            generation: row.generation.0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    id: Uuid,
    session_id: Uuid,
    user_id: Uuid,
    kind: String,
    overall_score: f64,
    section_scores: serde_json::Value,
    category_scores: serde_json::Value,
    strengths: serde_json::Value,
    weaknesses: serde_json::Value,
    guidance: String,
    answers: Json<BTreeMap<String, String>>,
    created_at: OffsetDateTime,
}

impl TryFrom<ResultRow> for ResultRecord {
    type Error = ContentError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            user_id: row.user_id,
            kind: parse_enum(&row.kind)?,
            report: ScoreReport {
                overall_score: row.overall_score,
                section_scores: serde_json::from_value(row.section_scores)?,
                category_scores: serde_json::from_value(row.category_scores)?,
                strengths: serde_json::from_value(row.strengths)?,
                weaknesses: serde_json::from_value(row.weaknesses)?,
                guidance: row.guidance,
            },
            answers: row.answers.0,
            created_at: row.created_at,
        })
    }
}

/// Postgres-backed session store
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &ContentSession) -> ContentResult<ContentSession> {
        let inserted: Option<SessionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO content_sessions (
                id, user_id, kind, status, request_id, started_at, requested_count,
                answered_count, practice, items, generation
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $10)
            ON CONFLICT (user_id, request_id) DO NOTHING
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.kind.as_str())
        .bind(session.status.as_str())
        .bind(session.request_id)
        .bind(session.started_at)
        .bind(session.requested_count as i32)
        .bind(session.practice.as_ref().map(Json))
        .bind(Json(&session.items))
        .bind(Json(&session.generation))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return ContentSession::try_from(row);
        }

        // Conflict on (user_id, request_id): hand back the session that won
        let request_id = session.request_id.ok_or_else(|| {
            ContentError::Database(format!("insert of session {} returned no row", session.id))
        })?;
        self.find_by_request(session.user_id, request_id)
            .await?
            .ok_or_else(|| {
                ContentError::Database(format!(
                    "session for request {} vanished after conflict",
                    request_id
                ))
            })
    }

    async fn get(&self, session_id: Uuid) -> ContentResult<Option<ContentSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM content_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ContentSession::try_from).transpose()
    }

    async fn find_by_request(
        &self,
        user_id: Uuid,
        request_id: Uuid,
    ) -> ContentResult<Option<ContentSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM content_sessions WHERE user_id = $1 AND request_id = $2",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ContentSession::try_from).transpose()
    }

    async fn count_completed_since(
        &self,
        user_id: Uuid,
        kind: ContentKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> ContentResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM content_sessions
            WHERE user_id = $1
              AND kind = $2
              AND status = 'completed'
              AND started_at >= $3
              AND started_at < $4
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> ContentResult<Vec<ContentSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM content_sessions
            WHERE user_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContentSession::try_from).collect()
    }

    async fn complete(&self, session_id: Uuid, completion: &Completion) -> ContentResult<CompleteOutcome> {
        let result = &completion.result;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE content_sessions
            SET status = 'completed',
                completed_at = $2,
                answered_count = $3,
                elapsed_seconds = $4
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(session_id)
        .bind(completion.completed_at)
        .bind(completion.answered_count as i32)
        .bind(completion.elapsed_seconds.map(|s| s as i32))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CompleteOutcome::AlreadyTerminal);
        }

        let row: ResultRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO session_results (
                id, session_id, user_id, kind, overall_score, section_scores,
                category_scores, strengths, weaknesses, guidance, answers, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            RESULT_COLUMNS
        ))
        .bind(result.id)
        .bind(session_id)
        .bind(result.user_id)
        .bind(result.kind.as_str())
        .bind(result.report.overall_score)
        .bind(Json(&result.report.section_scores))
        .bind(Json(&result.report.category_scores))
        .bind(Json(&result.report.strengths))
        .bind(Json(&result.report.weaknesses))
        .bind(&result.report.guidance)
        .bind(Json(&result.answers))
        .bind(result.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(session_id = %session_id, result_id = %row.id, "Stored session result");
        Ok(CompleteOutcome::Completed(ResultRecord::try_from(row)?))
    }

    async fn abandon(&self, session_id: Uuid, at: OffsetDateTime) -> ContentResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_sessions
            SET status = 'abandoned', completed_at = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_result(&self, session_id: Uuid) -> ContentResult<Option<ResultRecord>> {
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            "SELECT {} FROM session_results WHERE session_id = $1",
            RESULT_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ResultRecord::try_from).transpose()
    }
}

// ============ IN-MEMORY ============

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, ContentSession>,
    results: HashMap<Uuid, ResultRecord>,
}

/// In-process session store for tests and local runs
#[derive(Default)]
pub struct MemorySessionStore {
    state: RwLock<MemoryState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a session directly
    pub async fn put(&self, session: ContentSession) {
        self.state.write().await.sessions.insert(session.id, session);
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn result_count(&self) -> usize {
        self.state.read().await.results.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &ContentSession) -> ContentResult<ContentSession> {
        let mut state = self.state.write().await;

        if let Some(request_id) = session.request_id {
            if let Some(existing) = state
                .sessions
                .values()
                .find(|s| s.user_id == session.user_id && s.request_id == Some(request_id))
            {
                return Ok(existing.clone());
            }
        }

        state.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn get(&self, session_id: Uuid) -> ContentResult<Option<ContentSession>> {
        Ok(self.state.read().await.sessions.get(&session_id).cloned())
    }

    async fn find_by_request(
        &self,
        user_id: Uuid,
        request_id: Uuid,
    ) -> ContentResult<Option<ContentSession>> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.request_id == Some(request_id))
            .cloned())
    }

    async fn count_completed_since(
        &self,
        user_id: Uuid,
        kind: ContentKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> ContentResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| {
                s.user_id == user_id
                    && s.kind == kind
                    && s.status == SessionStatus::Completed
                    && s.started_at >= start
                    && s.started_at < end
            })
            .count() as u64)
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> ContentResult<Vec<ContentSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<ContentSession> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit.max(0) as usize);
        Ok(sessions)
    }

    async fn complete(&self, session_id: Uuid, completion: &Completion) -> ContentResult<CompleteOutcome> {
        let mut state = self.state.write().await;

        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(ContentError::SessionNotFound(session_id))?;
        if session.status != SessionStatus::InProgress {
            return Ok(CompleteOutcome::AlreadyTerminal);
        }

        session.status = SessionStatus::Completed;
        session.completed_at = Some(completion.completed_at);
        session.answered_count = completion.answered_count;
        session.elapsed_seconds = completion.elapsed_seconds;

        let mut result = completion.result.clone();
        result.session_id = session_id;
        state.results.insert(session_id, result.clone());

        Ok(CompleteOutcome::Completed(result))
    }

    async fn abandon(&self, session_id: Uuid, at: OffsetDateTime) -> ContentResult<bool> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.status == SessionStatus::InProgress => {
                session.status = SessionStatus::Abandoned;
                session.completed_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ContentError::SessionNotFound(session_id)),
        }
    }

    async fn get_result(&self, session_id: Uuid) -> ContentResult<Option<ResultRecord>> {
        Ok(self.state.read().await.results.get(&session_id).cloned())
    }
}
