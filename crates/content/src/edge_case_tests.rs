// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Content Generation
//!
//! Drives the generation service end to end against in-memory stores and a
//! scripted generator:
//! - Weekly exam quota and what does (not) count toward it
//! - Tier caps on practice requests
//! - Generation failures and timeouts leaving no session behind
//! - Submission idempotence, conflicts and concurrent submits

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use examprep_billing::{
    AnalyticsStore, BillingError, BillingResult, MemoryAnalyticsStore, MemorySubscriptionStore,
    SubscriptionRecord, UserAnalytics,
};
use examprep_shared::{
    ContentKind, ErrorCategory, SessionStatus, SubscriptionStatus, SubscriptionTier,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ContentError;
use crate::generator::{
    ContentGenerator, Difficulty, GeneratedItem, GenerationFailure, GenerationFailureKind,
    GenerationMetadata, GenerationRequest, GenerationResponse, PracticeCriteria,
};
use crate::quota::week_window;
use crate::service::{GenerateRequest, GenerationSettings, Submission};
use crate::sessions::{ContentSession, MemorySessionStore, SessionStore};
use crate::ContentService;

enum Script {
    Items,
    Fail(GenerationFailureKind),
    Hang,
    Empty,
    /// Items carrying exactly these ids, keyed "A", "B", "A", ...
    Ids(Vec<&'static str>),
}

struct ScriptedGenerator {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }
}

fn make_item(index: usize, kind: ContentKind) -> GeneratedItem {
    let section = match kind {
        ContentKind::Exam if index % 2 == 1 => "verbal",
        ContentKind::Exam => "quantitative",
        ContentKind::Practice => "quantitative",
    };
    GeneratedItem {
        id: format!("q{}", index + 1),
        section: section.into(),
        category: format!("category_{}", index % 4),
        difficulty: "medium".into(),
        prompt: format!("Question {}", index + 1),
        options: vec!["A".into(), "B".into(), "C".into(), "D".into()],
        correct_answer: "A".into(),
        explanation: "Because A".into(),
        image_ref: None,
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Items => Ok(GenerationResponse {
                items: (0..request.count as usize)
                    .map(|i| make_item(i, request.kind))
                    .collect(),
                metadata: GenerationMetadata {
                    duration_ms: 42,
                    tokens_used: Some(1000),
                    images_generated: None,
                },
            }),
            Script::Fail(kind) => Err(GenerationFailure::new(*kind, "scripted failure")),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(GenerationFailure::new(GenerationFailureKind::Transient, "unreachable"))
            }
            Script::Empty => Ok(GenerationResponse {
                items: vec![],
                metadata: GenerationMetadata::default(),
            }),
            Script::Ids(ids) => Ok(GenerationResponse {
                items: ids
                    .iter()
                    .enumerate()
                    .map(|(i, id)| GeneratedItem {
                        id: id.to_string(),
                        correct_answer: if i % 2 == 0 { "A" } else { "B" }.into(),
                        ..make_item(i, request.kind)
                    })
                    .collect(),
                metadata: GenerationMetadata::default(),
            }),
        }
    }
}

struct FailingAnalytics;

#[async_trait]
impl AnalyticsStore for FailingAnalytics {
    async fn ensure_user_row(&self, _user_id: Uuid) -> BillingResult<bool> {
        Err(BillingError::Database("analytics unavailable".into()))
    }

    async fn record_completion(&self, _user_id: Uuid, _kind: ContentKind) -> BillingResult<()> {
        Err(BillingError::Database("analytics unavailable".into()))
    }

    async fn get(&self, _user_id: Uuid) -> BillingResult<Option<UserAnalytics>> {
        Ok(None)
    }
}

struct Harness {
    service: Arc<ContentService>,
    subscriptions: Arc<MemorySubscriptionStore>,
    sessions: Arc<MemorySessionStore>,
    analytics: Arc<MemoryAnalyticsStore>,
    generator: Arc<ScriptedGenerator>,
}

fn settings() -> GenerationSettings {
    GenerationSettings {
        exam_timeout: Duration::from_millis(200),
        practice_timeout: Duration::from_millis(50),
        exam_item_count: 6,
    }
}

fn harness_with(script: Script, analytics: Option<Arc<dyn AnalyticsStore>>) -> Harness {
    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let sessions = Arc::new(MemorySessionStore::new());
    let memory_analytics = Arc::new(MemoryAnalyticsStore::new());
    let generator = Arc::new(ScriptedGenerator::new(script));

    let service = ContentService::with_components(
        settings(),
        sessions.clone(),
        subscriptions.clone(),
        analytics.unwrap_or_else(|| memory_analytics.clone() as Arc<dyn AnalyticsStore>),
        generator.clone(),
    );

    Harness {
        service: Arc::new(service),
        subscriptions,
        sessions,
        analytics: memory_analytics,
        generator,
    }
}

fn harness() -> Harness {
    harness_with(Script::Items, None)
}

fn exam_request() -> GenerateRequest {
    GenerateRequest {
        kind: ContentKind::Exam,
        practice: None,
        request_id: None,
    }
}

fn practice_request(count: u32) -> GenerateRequest {
    GenerateRequest {
        kind: ContentKind::Practice,
        practice: Some(PracticeCriteria {
            section: "quantitative".into(),
            categories: vec!["algebra".into()],
            difficulty: Difficulty::Mixed,
            count,
        }),
        request_id: None,
    }
}

fn answers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn submission(pairs: &[(&str, &str)]) -> Submission {
    Submission {
        answers: answers(pairs),
        elapsed_seconds: Some(300),
    }
}

async fn make_premium(h: &Harness, user_id: Uuid) {
    let mut record = SubscriptionRecord::new_free(user_id, OffsetDateTime::now_utc());
    record.tier = SubscriptionTier::Premium;
    record.status = SubscriptionStatus::Active;
    record.customer_ref = Some("cus_premium".into());
    record.subscription_ref = Some("sub_premium".into());
    h.subscriptions.insert(record).await;
}

async fn seed_exam(h: &Harness, user_id: Uuid, status: SessionStatus) {
    let mut session = ContentSession::new_in_progress(
        user_id,
        ContentKind::Exam,
        None,
        None,
        vec![make_item(0, ContentKind::Exam)],
        GenerationMetadata::default(),
        OffsetDateTime::now_utc(),
    );
    session.status = status;
    h.sessions.put(session).await;
}

// ============ QUOTA ============

mod quota_tests {
    use super::*;

    #[tokio::test]
    async fn test_free_user_first_exam_is_eligible() {
        let h = harness();
        let user = Uuid::new_v4();

        let eligibility = h.service.ledger().check_eligibility(user, ContentKind::Exam).await.unwrap();

        assert!(eligibility.eligible);
        assert!(eligibility.next_available_at.is_none());
        assert_eq!(eligibility.tier, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn test_completed_exam_blocks_until_next_sunday() {
        let h = harness();
        let user = Uuid::new_v4();

        let session = h.service.generation.generate(user, exam_request()).await.unwrap();
        h.service
            .generation
            .submit(user, session.id, submission(&[("q1", "A")]))
            .await
            .unwrap();

        let eligibility = h.service.ledger().check_eligibility(user, ContentKind::Exam).await.unwrap();
        assert!(!eligibility.eligible);
        assert!(!eligibility.reason.is_empty());
        let (_, next_sunday) = week_window(OffsetDateTime::now_utc());
        assert_eq!(eligibility.next_available_at, Some(next_sunday));

        let err = h.service.generation.generate(user, exam_request()).await.unwrap_err();
        match err {
            ContentError::QuotaExceeded { next_available_at, .. } => {
                assert_eq!(next_available_at, Some(next_sunday))
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_and_in_progress_exams_do_not_count() {
        let h = harness();
        let user = Uuid::new_v4();

        for _ in 0..3 {
            seed_exam(&h, user, SessionStatus::Abandoned).await;
            seed_exam(&h, user, SessionStatus::InProgress).await;
        }

        let eligibility = h.service.ledger().check_eligibility(user, ContentKind::Exam).await.unwrap();
        assert!(eligibility.eligible);
    }

    #[tokio::test]
    async fn test_abandoning_generated_exam_keeps_quota() {
        let h = harness();
        let user = Uuid::new_v4();

        let session = h.service.generation.generate(user, exam_request()).await.unwrap();
        h.service.generation.abandon(user, session.id).await.unwrap();

        assert!(h.service.generation.generate(user, exam_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_premium_user_unlimited_exams() {
        let h = harness();
        let user = Uuid::new_v4();
        make_premium(&h, user).await;

        for _ in 0..3 {
            seed_exam(&h, user, SessionStatus::Completed).await;
        }

        let eligibility = h.service.ledger().check_eligibility(user, ContentKind::Exam).await.unwrap();
        assert!(eligibility.eligible);
        assert!(h.service.generation.generate(user, exam_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_other_users_exams_do_not_count() {
        let h = harness();
        seed_exam(&h, Uuid::new_v4(), SessionStatus::Completed).await;

        let eligibility = h
            .service
            .ledger()
            .check_eligibility(Uuid::new_v4(), ContentKind::Exam)
            .await
            .unwrap();
        assert!(eligibility.eligible);
    }
}

// ============ GENERATION ============

mod generation_tests {
    use super::*;

    #[tokio::test]
    async fn test_free_practice_over_cap_is_rejected() {
        let h = harness();
        let user = Uuid::new_v4();

        let err = h
            .service
            .generation
            .generate(user, practice_request(20))
            .await
            .unwrap_err();

        match err {
            ContentError::CriteriaExceedsLimit { allowed, requested } => {
                assert_eq!(allowed, 5);
                assert_eq!(requested, 20);
            }
            other => panic!("expected CriteriaExceedsLimit, got {other:?}"),
        }
        assert_eq!(h.sessions.session_count().await, 0);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_premium_practice_allows_larger_sets() {
        let h = harness();
        let user = Uuid::new_v4();
        make_premium(&h, user).await;

        let session = h.service.generation.generate(user, practice_request(20)).await.unwrap();
        assert_eq!(session.requested_count, 20);
    }

    #[tokio::test]
    async fn test_free_user_unlimited_practice_sessions() {
        let h = harness();
        let user = Uuid::new_v4();

        for _ in 0..4 {
            h.service.generation.generate(user, practice_request(5)).await.unwrap();
        }
        assert_eq!(h.sessions.session_count().await, 4);
    }

    #[tokio::test]
    async fn test_blank_item_ids_never_collide_with_supplied_ones() {
        let h = harness_with(Script::Ids(vec!["", "q1"]), None);
        let user = Uuid::new_v4();

        let session = h.service.generation.generate(user, practice_request(2)).await.unwrap();
        let ids: Vec<&str> = session.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["q2", "q1"]);

        let result = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q2", "A"), ("q1", "B")]))
            .await
            .unwrap();
        assert_eq!(result.report.overall_score, 100.0);
    }

    #[tokio::test]
    async fn test_short_item_set_counts_delivered_items() {
        let h = harness_with(Script::Ids(vec!["q1"]), None);
        let user = Uuid::new_v4();

        let session = h.service.generation.generate(user, practice_request(3)).await.unwrap();
        assert_eq!(session.requested_count, 1);
        assert_eq!(session.practice.as_ref().unwrap().count, 3);

        let result = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q1", "A")]))
            .await
            .unwrap();
        assert_eq!(result.report.overall_score, 100.0);
    }

    #[tokio::test]
    async fn test_repeated_item_ids_fail_generation() {
        let h = harness_with(Script::Ids(vec!["q1", "q1"]), None);
        let user = Uuid::new_v4();

        let err = h
            .service
            .generation
            .generate(user, practice_request(2))
            .await
            .unwrap_err();

        match err {
            ContentError::Generation(failure) => {
                assert_eq!(failure.kind, GenerationFailureKind::MalformedResponse);
            }
            other => panic!("expected Generation, got {other:?}"),
        }
        assert_eq!(h.sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_criteria() {
        let h = harness();
        let user = Uuid::new_v4();

        let mut missing = practice_request(3);
        missing.practice = None;
        let zero = practice_request(0);
        let mut exam_with_criteria = practice_request(3);
        exam_with_criteria.kind = ContentKind::Exam;

        for request in [missing, zero, exam_with_criteria] {
            let err = h.service.generation.generate(user, request).await.unwrap_err();
            assert!(matches!(err, ContentError::InvalidCriteria(_)));
            assert_eq!(err.category(), ErrorCategory::Validation);
            assert!(!err.is_retryable());
        }
        assert_eq!(h.sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_generated_session_hides_answer_keys() {
        let h = harness();
        let user = Uuid::new_v4();

        let session = h.service.generation.generate(user, exam_request()).await.unwrap();

        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.requested_count, 6);
        assert!(session.items.iter().all(|i| i.correct_answer.is_empty()));

        let stored = h.sessions.get(session.id).await.unwrap().unwrap();
        assert!(stored.items.iter().all(|i| i.correct_answer == "A"));
    }

    #[tokio::test]
    async fn test_failures_leave_no_session() {
        for (kind, retryable) in [
            (GenerationFailureKind::RateLimited, true),
            (GenerationFailureKind::Transient, true),
            (GenerationFailureKind::ContentFiltered, false),
            (GenerationFailureKind::InvalidInput, false),
            (GenerationFailureKind::UpstreamQuota, false),
        ] {
            let h = harness_with(Script::Fail(kind), None);
            let err = h
                .service
                .generation
                .generate(Uuid::new_v4(), practice_request(3))
                .await
                .unwrap_err();

            assert!(matches!(err, ContentError::Generation(ref f) if f.kind == kind));
            assert_eq!(err.is_retryable(), retryable, "{kind:?}");
            assert_eq!(h.sessions.session_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_generation_timeout_is_retryable() {
        let h = harness_with(Script::Hang, None);

        let err = h
            .service
            .generation
            .generate(Uuid::new_v4(), practice_request(3))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ContentError::Generation(ref f) if f.kind == GenerationFailureKind::Timeout
        ));
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Upstream);
        assert_eq!(h.sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_generation_is_malformed() {
        let h = harness_with(Script::Empty, None);

        let err = h
            .service
            .generation
            .generate(Uuid::new_v4(), exam_request())
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "generation_malformed");
        assert_eq!(h.sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_id_generates_once() {
        let h = harness();
        let user = Uuid::new_v4();
        let mut request = practice_request(3);
        request.request_id = Some(Uuid::new_v4());

        let first = h.service.generation.generate(user, request.clone()).await.unwrap();
        let second = h.service.generation.generate(user, request).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sessions.session_count().await, 1);
    }
}

// ============ SUBMISSION ============

mod submission_tests {
    use super::*;

    async fn two_item_practice(h: &Harness, user: Uuid) -> ContentSession {
        let mut session = ContentSession::new_in_progress(
            user,
            ContentKind::Practice,
            None,
            None,
            vec![make_item(0, ContentKind::Practice), make_item(1, ContentKind::Practice)],
            GenerationMetadata::default(),
            OffsetDateTime::now_utc(),
        );
        session.items[1].correct_answer = "C".into();
        h.sessions.put(session.clone()).await;
        session
    }

    #[tokio::test]
    async fn test_half_right_practice_scores_fifty() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        let result = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q1", "A"), ("q2", "B")]))
            .await
            .unwrap();

        assert_eq!(result.report.overall_score, 50.0);
        assert_eq!(result.report.weaknesses.len(), 1);
        assert_eq!(result.report.weaknesses[0].category, "category_1");
        assert_eq!(result.report.weaknesses[0].score, 0.0);

        let stored = h.sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.answered_count, 2);
        assert!(stored.completed_at.unwrap() >= stored.started_at);

        let analytics = h.analytics.get(user).await.unwrap().unwrap();
        assert_eq!(analytics.practice_sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_identical_resubmission_returns_same_result() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;
        let answers = [("q1", "A"), ("q2", "C")];

        let first = h.service.generation.submit(user, session.id, submission(&answers)).await.unwrap();
        let second = h.service.generation.submit(user, session.id, submission(&answers)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.sessions.result_count().await, 1);
        let analytics = h.analytics.get(user).await.unwrap().unwrap();
        assert_eq!(analytics.practice_sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_different_resubmission_is_integrity_error() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        h.service
            .generation
            .submit(user, session.id, submission(&[("q1", "A")]))
            .await
            .unwrap();
        let err = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q1", "B")]))
            .await
            .unwrap_err();

        assert!(matches!(err, ContentError::SubmissionConflict(id) if id == session.id));
        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert_eq!(h.sessions.result_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_converge_on_one_result() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = h.service.clone();
            let id = session.id;
            handles.push(tokio::spawn(async move {
                service
                    .generation
                    .submit(user, id, submission(&[("q1", "A"), ("q2", "C")]))
                    .await
            }));
        }

        let mut result_ids = Vec::new();
        for handle in handles {
            result_ids.push(handle.await.unwrap().unwrap().id);
        }
        result_ids.dedup();

        assert_eq!(result_ids.len(), 1);
        assert_eq!(h.sessions.result_count().await, 1);
    }

    #[tokio::test]
    async fn test_submit_on_abandoned_session_is_rejected() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        h.service.generation.abandon(user, session.id).await.unwrap();
        let err = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q1", "A")]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ContentError::SessionClosed { status: SessionStatus::Abandoned }
        ));
        assert!(!err.is_retryable());
        assert_eq!(h.sessions.result_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_items_rejected() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        let err = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q1", "A"), ("q99", "B")]))
            .await
            .unwrap_err();

        match err {
            ContentError::UnknownItems(ids) => assert_eq!(ids, vec!["q99".to_string()]),
            other => panic!("expected UnknownItems, got {other:?}"),
        }
        let stored = h.sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn test_other_users_session_is_not_found() {
        let h = harness();
        let owner = Uuid::new_v4();
        let session = two_item_practice(&h, owner).await;
        let stranger = Uuid::new_v4();

        let submit = h
            .service
            .generation
            .submit(stranger, session.id, submission(&[("q1", "A")]))
            .await
            .unwrap_err();
        let fetch = h.service.generation.get_session(stranger, session.id).await.unwrap_err();

        assert!(matches!(submit, ContentError::SessionNotFound(_)));
        assert!(matches!(fetch, ContentError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_abandon_is_noop_on_terminal_session() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        h.service
            .generation
            .submit(user, session.id, submission(&[("q1", "A")]))
            .await
            .unwrap();
        let after = h.service.generation.abandon(user, session.id).await.unwrap();

        assert_eq!(after.status, SessionStatus::Completed);
        assert!(h.service.generation.get_result(user, session.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_result_missing_before_submit() {
        let h = harness();
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        let err = h.service.generation.get_result(user, session.id).await.unwrap_err();
        assert!(matches!(err, ContentError::ResultNotFound(_)));
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn test_analytics_failure_does_not_fail_submit() {
        let h = harness_with(Script::Items, Some(Arc::new(FailingAnalytics)));
        let user = Uuid::new_v4();
        let session = two_item_practice(&h, user).await;

        let result = h
            .service
            .generation
            .submit(user, session.id, submission(&[("q1", "A")]))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_scores_bounded_for_any_answer_set() {
        let h = harness();
        let user = Uuid::new_v4();
        make_premium(&h, user).await;

        let answer_sets: Vec<Vec<(&str, &str)>> = vec![
            vec![],
            vec![("q1", "A")],
            vec![("q1", "B"), ("q2", "B"), ("q3", "B")],
            vec![("q1", "A"), ("q2", "A"), ("q3", "A"), ("q4", "A"), ("q5", "A"), ("q6", "A")],
            vec![("q1", "A"), ("q2", "D"), ("q3", "a"), ("q4", ""), ("q5", "A"), ("q6", "C")],
        ];

        for pairs in answer_sets {
            let session = h.service.generation.generate(user, exam_request()).await.unwrap();
            let result = h
                .service
                .generation
                .submit(user, session.id, submission(&pairs))
                .await
                .unwrap();

            assert!(result.report.all_scores().all(|s| (0.0..=100.0).contains(&s)));
            assert!(result.report.strengths.len() <= 3);
            assert!(result.report.weaknesses.len() <= 3);
            for strength in &result.report.strengths {
                assert!(result
                    .report
                    .weaknesses
                    .iter()
                    .all(|w| w.category != strength.category));
            }
        }
    }

    #[tokio::test]
    async fn test_list_sessions_newest_first_and_redacted() {
        let h = harness();
        let user = Uuid::new_v4();

        let first = h.service.generation.generate(user, practice_request(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h.service.generation.generate(user, practice_request(3)).await.unwrap();

        let listed = h.service.generation.list_sessions(user, None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert!(listed
            .iter()
            .flat_map(|s| s.items.iter())
            .all(|i| i.correct_answer.is_empty()));
    }
}
