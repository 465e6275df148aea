//! Generation orchestrator
//!
//! Sequences eligibility check, criteria validation, the external generation
//! call and persistence for new sessions, and owns submission and abandonment.
//! A session is only persisted once generation has succeeded.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use examprep_billing::AnalyticsStore;
use examprep_shared::{ContentKind, SessionStatus};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ContentError, ContentResult};
use crate::generator::{
    ContentGenerator, GeneratedItem, GenerationFailure, GenerationFailureKind, GenerationRequest,
    GeneratorConfig, PracticeCriteria,
};
use crate::quota::{QuotaLedger, TierLimits};
use crate::scoring;
use crate::sessions::{CompleteOutcome, Completion, ContentSession, ResultRecord, SessionStore};

/// Default page size for session listings
pub const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub exam_timeout: Duration,
    pub practice_timeout: Duration,
    pub exam_item_count: u32,
}

impl GenerationSettings {
    pub fn timeout_for(&self, kind: ContentKind) -> Duration {
        match kind {
            ContentKind::Exam => self.exam_timeout,
            ContentKind::Practice => self.practice_timeout,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            exam_timeout: Duration::from_secs(120),
            practice_timeout: Duration::from_secs(45),
            exam_item_count: 40,
        }
    }
}

impl From<&GeneratorConfig> for GenerationSettings {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            exam_timeout: config.exam_timeout,
            practice_timeout: config.practice_timeout,
            exam_item_count: config.exam_item_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub kind: ContentKind,
    #[serde(default)]
    pub practice: Option<PracticeCriteria>,
    /// Client-chosen key; repeating it returns the session already created
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub answers: BTreeMap<String, String>,
    #[serde(default)]
    pub elapsed_seconds: Option<u32>,
}

pub struct GenerationService {
    ledger: QuotaLedger,
    sessions: Arc<dyn SessionStore>,
    generator: Arc<dyn ContentGenerator>,
    analytics: Arc<dyn AnalyticsStore>,
    settings: GenerationSettings,
}

impl GenerationService {
    pub fn new(
        ledger: QuotaLedger,
        sessions: Arc<dyn SessionStore>,
        generator: Arc<dyn ContentGenerator>,
        analytics: Arc<dyn AnalyticsStore>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            ledger,
            sessions,
            generator,
            analytics,
            settings,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Create a new exam or practice session for `user_id`.
    ///
    /// The returned session has its answer keys hidden.
    pub async fn generate(
        &self,
        user_id: Uuid,
        request: GenerateRequest,
    ) -> ContentResult<ContentSession> {
        if let Some(request_id) = request.request_id {
            if let Some(existing) = self.sessions.find_by_request(user_id, request_id).await? {
                tracing::info!(
                    user_id = %user_id,
                    session_id = %existing.id,
                    request_id = %request_id,
                    "Returning session already created for request"
                );
                return Ok(existing.redacted());
            }
        }

        let eligibility = self.ledger.check_eligibility(user_id, request.kind).await?;
        if !eligibility.eligible {
            tracing::info!(
                user_id = %user_id,
                kind = %request.kind,
                next_available_at = ?eligibility.next_available_at,
                "Generation rejected by quota"
            );
            return Err(ContentError::QuotaExceeded {
                reason: eligibility.reason,
                next_available_at: eligibility.next_available_at,
            });
        }

        let limits = TierLimits::for_tier(eligibility.tier);
        let count = self.validate_criteria(&request, &limits)?;

        let generation_request = GenerationRequest {
            kind: request.kind,
            count,
            practice: request.practice.clone(),
        };
        let timeout = self.settings.timeout_for(request.kind);
        let started = std::time::Instant::now();

        let response = match tokio::time::timeout(timeout, self.generator.generate(&generation_request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(failure)) => {
                tracing::warn!(
                    user_id = %user_id,
                    kind = %request.kind,
                    failure = failure.kind.as_str(),
                    retryable = failure.is_retryable(),
                    error = %failure.message,
                    "Content generation failed"
                );
                return Err(ContentError::Generation(failure));
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    kind = %request.kind,
                    timeout_secs = timeout.as_secs(),
                    "Content generation timed out"
                );
                return Err(ContentError::Generation(GenerationFailure::new(
                    GenerationFailureKind::Timeout,
                    format!("no response within {}s", timeout.as_secs()),
                )));
            }
        };

        let mut items = response.items;
        if items.is_empty() {
            return Err(ContentError::Generation(GenerationFailure::new(
                GenerationFailureKind::MalformedResponse,
                "generation returned no items",
            )));
        }
        items.truncate(count as usize);
        if let Err(failure) = assign_item_ids(&mut items) {
            tracing::warn!(
                user_id = %user_id,
                kind = %request.kind,
                error = %failure.message,
                "Generated items rejected"
            );
            return Err(ContentError::Generation(failure));
        }

        let mut generation = response.metadata;
        if generation.duration_ms == 0 {
            generation.duration_ms = started.elapsed().as_millis() as u64;
        }

        let session = ContentSession::new_in_progress(
            user_id,
            request.kind,
            request.request_id,
            request.practice,
            items,
            generation,
            OffsetDateTime::now_utc(),
        );
        let stored = self.sessions.insert(&session).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %stored.id,
            kind = %stored.kind,
            items = stored.requested_count,
            "Created content session"
        );

        Ok(stored.redacted())
    }

    /// Item count to request, after checking criteria against tier limits
    fn validate_criteria(&self, request: &GenerateRequest, limits: &TierLimits) -> ContentResult<u32> {
        match (request.kind, &request.practice) {
            (ContentKind::Exam, None) => Ok(self.settings.exam_item_count),
            (ContentKind::Exam, Some(_)) => Err(ContentError::InvalidCriteria(
                "exam requests do not take practice criteria".to_string(),
            )),
            (ContentKind::Practice, None) => Err(ContentError::InvalidCriteria(
                "practice requests need a section, difficulty and count".to_string(),
            )),
            (ContentKind::Practice, Some(criteria)) => {
                if criteria.section.trim().is_empty() {
                    return Err(ContentError::InvalidCriteria("section is required".to_string()));
                }
                if criteria.count == 0 {
                    return Err(ContentError::InvalidCriteria(
                        "count must be at least 1".to_string(),
                    ));
                }
                if criteria.count > limits.practice_item_cap {
                    return Err(ContentError::CriteriaExceedsLimit {
                        allowed: limits.practice_item_cap,
                        requested: criteria.count,
                    });
                }
                Ok(criteria.count)
            }
        }
    }

    /// Score and complete a session.
    ///
    /// Repeating a submission with the same answers returns the stored result.
    pub async fn submit(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        submission: Submission,
    ) -> ContentResult<ResultRecord> {
        let session = self.owned_session(user_id, session_id).await?;

        let unknown: Vec<String> = submission
            .answers
            .keys()
            .filter(|id| !session.contains_item(id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ContentError::UnknownItems(unknown));
        }

        match session.status {
            SessionStatus::Completed => return self.existing_result(&session, &submission).await,
            SessionStatus::Abandoned => {
                return Err(ContentError::SessionClosed {
                    status: SessionStatus::Abandoned,
                })
            }
            SessionStatus::InProgress => {}
        }

        let now = OffsetDateTime::now_utc();
        let report = scoring::score(session.kind, &session.items, &submission.answers);
        let completion = Completion {
            answered_count: submission.answers.len() as u32,
            elapsed_seconds: submission.elapsed_seconds,
            completed_at: now,
            result: ResultRecord {
                id: Uuid::new_v4(),
                session_id,
                user_id,
                kind: session.kind,
                report,
                answers: submission.answers.clone(),
                created_at: now,
            },
        };

        match self.sessions.complete(session_id, &completion).await? {
            CompleteOutcome::Completed(result) => {
                tracing::info!(
                    user_id = %user_id,
                    session_id = %session_id,
                    overall_score = result.report.overall_score,
                    "Session completed"
                );

                if let Err(e) = self.analytics.record_completion(user_id, session.kind).await {
                    tracing::warn!(
                        user_id = %user_id,
                        session_id = %session_id,
                        error = %e,
                        "Failed to update analytics after completion"
                    );
                }

                Ok(result)
            }
            CompleteOutcome::AlreadyTerminal => {
                // Lost a race with another submit or an abandon; re-read and resolve
                let current = self.owned_session(user_id, session_id).await?;
                match current.status {
                    SessionStatus::Completed => self.existing_result(&current, &submission).await,
                    status => Err(ContentError::SessionClosed { status }),
                }
            }
        }
    }

    async fn existing_result(
        &self,
        session: &ContentSession,
        submission: &Submission,
    ) -> ContentResult<ResultRecord> {
        let result = self
            .sessions
            .get_result(session.id)
            .await?
            .ok_or(ContentError::ResultNotFound(session.id))?;

        if result.answers != submission.answers {
            tracing::error!(
                user_id = %session.user_id,
                session_id = %session.id,
                "RECONCILIATION NEEDED: completed session resubmitted with different answers"
            );
            return Err(ContentError::SubmissionConflict(session.id));
        }

        Ok(result)
    }

    /// Abandon an in-progress session; terminal sessions are left alone
    pub async fn abandon(&self, user_id: Uuid, session_id: Uuid) -> ContentResult<ContentSession> {
        let session = self.owned_session(user_id, session_id).await?;

        if session.status.is_terminal() {
            tracing::debug!(
                session_id = %session_id,
                status = %session.status,
                "Abandon on terminal session ignored"
            );
            return Ok(session.redacted());
        }

        if self.sessions.abandon(session_id, OffsetDateTime::now_utc()).await? {
            tracing::info!(user_id = %user_id, session_id = %session_id, "Session abandoned");
        }

        let current = self.owned_session(user_id, session_id).await?;
        Ok(current.redacted())
    }

    pub async fn get_session(&self, user_id: Uuid, session_id: Uuid) -> ContentResult<ContentSession> {
        Ok(self.owned_session(user_id, session_id).await?.redacted())
    }

    pub async fn list_sessions(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> ContentResult<Vec<ContentSession>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let sessions = self.sessions.list_for_user(user_id, limit).await?;
        Ok(sessions.iter().map(ContentSession::redacted).collect())
    }

    pub async fn get_result(&self, user_id: Uuid, session_id: Uuid) -> ContentResult<ResultRecord> {
        let session = self.owned_session(user_id, session_id).await?;
        self.sessions
            .get_result(session.id)
            .await?
            .ok_or(ContentError::ResultNotFound(session_id))
    }

    /// Sessions owned by someone else look exactly like missing ones
    async fn owned_session(&self, user_id: Uuid, session_id: Uuid) -> ContentResult<ContentSession> {
        match self.sessions.get(session_id).await? {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(ContentError::SessionNotFound(session_id)),
        }
    }
}

/// Give every item a unique id.
///
/// Blank ids get the first free `q{n}`; ids the generator supplied more than
/// once make the whole response unusable, since answers are keyed by id.
fn assign_item_ids(items: &mut [GeneratedItem]) -> Result<(), GenerationFailure> {
    let mut taken = HashSet::new();
    for item in items.iter().filter(|i| !i.id.trim().is_empty()) {
        if !taken.insert(item.id.clone()) {
            return Err(GenerationFailure::new(
                GenerationFailureKind::MalformedResponse,
                format!("generation returned duplicate item id {}", item.id),
            ));
        }
    }

    let mut next = 1usize;
    for item in items.iter_mut().filter(|i| i.id.trim().is_empty()) {
        while taken.contains(&format!("q{}", next)) {
            next += 1;
        }
        item.id = format!("q{}", next);
        taken.insert(item.id.clone());
        next += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> GeneratedItem {
        GeneratedItem {
            id: id.to_string(),
            section: "quantitative".into(),
            category: "algebra".into(),
            difficulty: "easy".into(),
            prompt: "2 + 2".into(),
            options: vec!["4".into(), "5".into()],
            correct_answer: "4".into(),
            explanation: String::new(),
            image_ref: None,
        }
    }

    fn ids(items: &[GeneratedItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_blank_ids_skip_supplied_ones() {
        let mut items = vec![item(""), item("q1"), item("  "), item("q3")];
        assign_item_ids(&mut items).unwrap();
        assert_eq!(ids(&items), vec!["q2", "q1", "q4", "q3"]);
    }

    #[test]
    fn test_supplied_ids_are_kept() {
        let mut items = vec![item("a"), item("b")];
        assign_item_ids(&mut items).unwrap();
        assert_eq!(ids(&items), vec!["a", "b"]);
    }

    #[test]
    fn test_repeated_supplied_id_is_malformed() {
        let mut items = vec![item("q1"), item("q2"), item("q1")];
        let failure = assign_item_ids(&mut items).unwrap_err();
        assert_eq!(failure.kind, GenerationFailureKind::MalformedResponse);
    }
}
