//! Router tests against in-memory stores

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use examprep_billing::{
    BillingResult, BillingService, CheckoutBackend, CheckoutContext, MemoryAnalyticsStore,
    MemorySubscriptionStore, MemoryWebhookLedger, PaymentProcessor, ProcessorSubscription,
    SignatureVerifier, StripeConfig, SubscriptionStore,
};
use examprep_content::{
    ContentGenerator, ContentService, GeneratedItem, GenerationFailure, GenerationMetadata,
    GenerationRequest, GenerationResponse, GenerationSettings, MemorySessionStore,
};
use examprep_shared::{SubscriptionStatus, SubscriptionTier};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::auth::jwt::test_tokens::{issue, TEST_SECRET};
use crate::auth::JwtManager;
use crate::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_router_tests";

struct NoopBackend;

#[async_trait]
impl CheckoutBackend for NoopBackend {
    async fn create_checkout(&self, _user_id: Uuid, _price_id: &str) -> BillingResult<CheckoutContext> {
        Ok(CheckoutContext {
            client_secret: Some("pi_secret".into()),
            ephemeral_key: Some("ek_test".into()),
            customer: Some("cus_1".into()),
        })
    }
}

struct NoopProcessor;

#[async_trait]
impl PaymentProcessor for NoopProcessor {
    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<ProcessorSubscription> {
        Ok(ProcessorSubscription {
            subscription_ref: subscription_ref.to_string(),
            status: SubscriptionStatus::Active,
            cancel_at_period_end: cancel,
            canceled_at: None,
        })
    }
}

struct FixedGenerator;

#[async_trait]
impl ContentGenerator for FixedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationFailure> {
        let items = (0..request.count)
            .map(|i| GeneratedItem {
                id: format!("q{}", i + 1),
                section: "quantitative".into(),
                category: "algebra".into(),
                difficulty: "medium".into(),
                prompt: format!("Question {}", i + 1),
                options: vec!["A".into(), "B".into()],
                correct_answer: "A".into(),
                explanation: "Because A".into(),
                image_ref: None,
            })
            .collect();
        Ok(GenerationResponse {
            items,
            metadata: GenerationMetadata::default(),
        })
    }
}

struct TestApp {
    router: Router,
    subscriptions: Arc<MemorySubscriptionStore>,
}

fn test_app() -> TestApp {
    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let analytics = Arc::new(MemoryAnalyticsStore::new());

    let config = StripeConfig {
        secret_key: "sk_test".into(),
        webhook_secret: WEBHOOK_SECRET.into(),
        premium_price_id: "price_premium".into(),
        checkout_endpoint: "http://localhost/checkout".into(),
        checkout_token: None,
        payment_timeout: Duration::from_secs(5),
        webhook_tolerance: Duration::from_secs(300),
    };

    let billing = BillingService::with_components(
        &config,
        subscriptions.clone(),
        Arc::new(MemoryWebhookLedger::new()),
        analytics.clone(),
        Arc::new(NoopBackend),
        Arc::new(NoopProcessor),
    );

    let content = ContentService::with_components(
        GenerationSettings {
            exam_timeout: Duration::from_secs(1),
            practice_timeout: Duration::from_secs(1),
            exam_item_count: 4,
        },
        Arc::new(MemorySessionStore::new()),
        subscriptions.clone(),
        analytics,
        Arc::new(FixedGenerator),
    );

    let state = AppState::from_services(billing, content, JwtManager::new(TEST_SECRET));

    TestApp {
        router: create_router(state),
        subscriptions,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(&self, user_id: Uuid, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", issue(user_id, 3600)))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn post(&self, user_id: Uuid, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", issue(user_id, 3600)))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn webhook(&self, payload: &str, signature: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/stripe")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        self.send(builder.body(Body::from(payload.to_string())).unwrap())
            .await
    }
}

fn activation_payload(created: i64) -> String {
    json!({
        "id": "evt_router_1",
        "object": "event",
        "type": "customer.subscription.created",
        "created": created,
        "data": { "object": {
            "id": "sub_1",
            "object": "subscription",
            "customer": "cus_1",
            "status": "active",
            "cancel_at_period_end": false,
            "canceled_at": null,
            "trial_end": null,
            "current_period_start": created,
            "current_period_end": created + 2_592_000
        }}
    })
    .to_string()
}

fn sign(payload: &str) -> String {
    SignatureVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300))
        .sign(payload, OffsetDateTime::now_utc().unix_timestamp())
        .unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let app = test_app();
    let request = Request::builder()
        .uri("/v1/subscription")
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["category"], "unauthorized");
}

#[tokio::test]
async fn test_first_subscription_read_is_free() {
    let app = test_app();
    let user_id = Uuid::new_v4();
    let (status, body) = app.get(user_id, "/v1/subscription").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "free");
    assert_eq!(body["user_id"], user_id.to_string());
}

mod webhook_routes {
    use super::*;

    #[tokio::test]
    async fn test_missing_signature_is_rejected() {
        let app = test_app();
        let (status, body) = app.webhook(&activation_payload(1_000), None).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_mutation() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.subscriptions.get_or_create(user_id).await.unwrap();
        app.subscriptions.attach_customer(user_id, "cus_1").await.unwrap();

        let payload = activation_payload(1_000);
        let signature = SignatureVerifier::new("whsec_someone_else", Duration::from_secs(300))
            .sign(&payload, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap();
        let (status, _) = app.webhook(&payload, Some(&signature)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let record = app.subscriptions.find(user_id).await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn test_signed_activation_upgrades_linked_user() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.subscriptions.get_or_create(user_id).await.unwrap();
        app.subscriptions.attach_customer(user_id, "cus_1").await.unwrap();

        let payload = activation_payload(1_000);
        let (status, body) = app.webhook(&payload, Some(&sign(&payload))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processed");

        let (_, subscription) = app.get(user_id, "/v1/subscription").await;
        assert_eq!(subscription["tier"], "premium");
        assert_eq!(subscription["status"], "active");
    }

    #[tokio::test]
    async fn test_unlinked_customer_is_still_acknowledged() {
        let app = test_app();
        let payload = activation_payload(1_000);
        let (status, body) = app.webhook(&payload, Some(&sign(&payload))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
    }
}

mod content_routes {
    use super::*;

    #[tokio::test]
    async fn test_free_practice_over_cap_reports_limit() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let (status, body) = app
            .post(
                user_id,
                "/v1/sessions",
                json!({
                    "kind": "practice",
                    "practice": {
                        "section": "quantitative",
                        "categories": ["algebra"],
                        "difficulty": "medium",
                        "count": 20
                    }
                }),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "criteria_exceeds_limit");
        assert_eq!(body["error"]["details"]["allowed"], 5);
        assert_eq!(body["error"]["details"]["requested"], 20);
    }

    #[tokio::test]
    async fn test_exam_flow_then_weekly_limit() {
        let app = test_app();
        let user_id = Uuid::new_v4();

        let (status, eligibility) = app.get(user_id, "/v1/eligibility?kind=exam").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(eligibility["eligible"], true);

        let (status, session) = app.post(user_id, "/v1/sessions", json!({ "kind": "exam" })).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(session["status"], "in_progress");
        let session_id = session["id"].as_str().unwrap().to_string();

        let (status, result) = app
            .post(
                user_id,
                &format!("/v1/sessions/{}/submit", session_id),
                json!({ "answers": { "q1": "A", "q2": "B" }, "elapsed_seconds": 600 }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["overall_score"], 25.0);

        let (status, stored) = app
            .get(user_id, &format!("/v1/sessions/{}/result", session_id))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["id"], result["id"]);

        let (status, eligibility) = app.get(user_id, "/v1/eligibility?kind=exam").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(eligibility["eligible"], false);

        let (status, body) = app.post(user_id, "/v1/sessions", json!({ "kind": "exam" })).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "quota_exceeded");
        assert!(body["error"]["details"]["next_available_at"].is_string());
    }

    #[tokio::test]
    async fn test_abandoned_exam_does_not_use_quota() {
        let app = test_app();
        let user_id = Uuid::new_v4();

        let (_, session) = app.post(user_id, "/v1/sessions", json!({ "kind": "exam" })).await;
        let session_id = session["id"].as_str().unwrap().to_string();

        let (status, abandoned) = app
            .post(user_id, &format!("/v1/sessions/{}/abandon", session_id), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(abandoned["status"], "abandoned");

        let (status, _) = app.post(user_id, "/v1/sessions", json!({ "kind": "exam" })).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_sessions_are_private_to_owner() {
        let app = test_app();
        let owner = Uuid::new_v4();

        let (_, session) = app.post(owner, "/v1/sessions", json!({ "kind": "exam" })).await;
        let session_id = session["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .get(Uuid::new_v4(), &format!("/v1/sessions/{}", session_id))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, listed) = app.get(owner, "/v1/sessions?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let app = test_app();
        let (status, body) = app
            .get(Uuid::new_v4(), &format!("/v1/sessions/{}", Uuid::new_v4()))
            .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "session_not_found");
    }
}
