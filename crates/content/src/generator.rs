//! External content generation capability
//!
//! "Generate N items matching criteria" is treated as a remote contract. This
//! module owns the request/response shapes, the failure classification and the
//! HTTP client that speaks to the generation service.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use examprep_shared::ContentKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Mixed,
}

/// Practice request criteria chosen by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PracticeCriteria {
    pub section: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub difficulty: Difficulty,
    pub count: u32,
}

/// One generated question with its answer key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedItem {
    #[serde(default)]
    pub id: String,
    pub section: String,
    pub category: String,
    pub difficulty: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images_generated: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    pub kind: ContentKind,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub practice: Option<PracticeCriteria>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenerationResponse {
    pub items: Vec<GeneratedItem>,
    #[serde(default)]
    pub metadata: GenerationMetadata,
}

/// Why a generation call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFailureKind {
    Timeout,
    RateLimited,
    /// Upstream 5xx or connection failure
    Transient,
    /// Upstream returned something that is not a usable item list
    MalformedResponse,
    InvalidInput,
    ContentFiltered,
    /// Upstream account quota exhausted; needs operator action
    UpstreamQuota,
}

impl GenerationFailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationFailureKind::Timeout
                | GenerationFailureKind::RateLimited
                | GenerationFailureKind::Transient
                | GenerationFailureKind::MalformedResponse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationFailureKind::Timeout => "generation_timeout",
            GenerationFailureKind::RateLimited => "generation_rate_limited",
            GenerationFailureKind::Transient => "generation_unavailable",
            GenerationFailureKind::MalformedResponse => "generation_malformed",
            GenerationFailureKind::InvalidInput => "generation_invalid_input",
            GenerationFailureKind::ContentFiltered => "generation_content_filtered",
            GenerationFailureKind::UpstreamQuota => "generation_quota",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub kind: GenerationFailureKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl GenerationFailure {
    pub fn new(kind: GenerationFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GenerationFailure {}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationFailure>;
}

/// Generation settings, loaded once at startup
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub exam_timeout: Duration,
    pub practice_timeout: Duration,
    pub exam_item_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}")]
    Invalid(&'static str),
}

impl GeneratorConfig {
    pub fn from_env() -> Result<Self, GeneratorConfigError> {
        let url = std::env::var("CONTENT_GENERATOR_URL")
            .map_err(|_| GeneratorConfigError::Missing("CONTENT_GENERATOR_URL"))?;
        let api_key = std::env::var("CONTENT_GENERATOR_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let exam_timeout = Duration::from_secs(parse_or("EXAM_GENERATION_TIMEOUT_SECS", 120)?);
        let practice_timeout =
            Duration::from_secs(parse_or("PRACTICE_GENERATION_TIMEOUT_SECS", 45)?);
        let exam_item_count: u32 = parse_or("EXAM_ITEM_COUNT", 40)?;

        let config = Self {
            url,
            api_key,
            exam_timeout,
            practice_timeout,
            exam_item_count,
        };
        config.validate()?;
        Ok(config)
    }

    /// Practice calls must give up before exam calls, and exams need items
    pub fn validate(&self) -> Result<(), GeneratorConfigError> {
        if self.exam_item_count == 0 {
            return Err(GeneratorConfigError::Invalid("EXAM_ITEM_COUNT"));
        }
        if self.practice_timeout.is_zero() || self.practice_timeout >= self.exam_timeout {
            return Err(GeneratorConfigError::Invalid("PRACTICE_GENERATION_TIMEOUT_SECS"));
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, GeneratorConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| GeneratorConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: Option<UpstreamError>,
}

#[derive(Deserialize)]
struct UpstreamError {
    #[serde(default, alias = "type")]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Generation service reached over HTTP
pub struct HttpContentGenerator {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpContentGenerator {
    /// The per-kind deadline is enforced by the caller; the client timeout is a backstop
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorConfigError> {
        let backstop = config.exam_timeout.max(config.practice_timeout) + Duration::from_secs(5);
        let client = reqwest::Client::builder()
            .timeout(backstop)
            .build()
            .map_err(|_| GeneratorConfigError::Invalid("CONTENT_GENERATOR_URL"))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationFailure> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                GenerationFailureKind::Timeout
            } else {
                GenerationFailureKind::Transient
            };
            GenerationFailure::new(kind, e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<GenerationResponse>().await.map_err(|e| {
                GenerationFailure::new(GenerationFailureKind::MalformedResponse, e.to_string())
            });
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let upstream = serde_json::from_str::<UpstreamErrorBody>(&body)
            .ok()
            .and_then(|b| b.error);
        let code = upstream.as_ref().and_then(|e| e.code.clone());
        let message = upstream
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("generation service returned {}", status.as_u16()));

        let kind = classify_status(status.as_u16(), code.as_deref());
        tracing::warn!(
            status = status.as_u16(),
            code = ?code,
            failure = kind.as_str(),
            "Content generation request failed"
        );

        Err(GenerationFailure::new(kind, message).with_retry_after(retry_after))
    }
}

/// Map an upstream HTTP status (and optional error code) onto a failure kind
pub fn classify_status(status: u16, code: Option<&str>) -> GenerationFailureKind {
    match code {
        Some("content_filtered" | "content_policy_violation" | "safety") => {
            return GenerationFailureKind::ContentFiltered
        }
        Some("insufficient_quota" | "quota_exceeded" | "billing_hard_limit_reached") => {
            return GenerationFailureKind::UpstreamQuota
        }
        Some("rate_limit_exceeded" | "rate_limited") => return GenerationFailureKind::RateLimited,
        _ => {}
    }

    match status {
        408 | 504 => GenerationFailureKind::Timeout,
        429 => GenerationFailureKind::RateLimited,
        402 => GenerationFailureKind::UpstreamQuota,
        451 => GenerationFailureKind::ContentFiltered,
        400 | 404 | 422 => GenerationFailureKind::InvalidInput,
        _ => GenerationFailureKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: String) -> GeneratorConfig {
        GeneratorConfig {
            url,
            api_key: Some("gen-key".into()),
            exam_timeout: Duration::from_secs(10),
            practice_timeout: Duration::from_secs(5),
            exam_item_count: 40,
        }
    }

    fn practice_request() -> GenerationRequest {
        GenerationRequest {
            kind: ContentKind::Practice,
            count: 2,
            practice: Some(PracticeCriteria {
                section: "quantitative".into(),
                categories: vec!["algebra".into()],
                difficulty: Difficulty::Medium,
                count: 2,
            }),
        }
    }

    #[test]
    fn test_config_validation() {
        let base = config("http://localhost/generate".into());
        assert!(base.validate().is_ok());

        let mut slow_practice = base.clone();
        slow_practice.practice_timeout = base.exam_timeout;
        assert!(matches!(
            slow_practice.validate(),
            Err(GeneratorConfigError::Invalid("PRACTICE_GENERATION_TIMEOUT_SECS"))
        ));

        let mut no_items = base;
        no_items.exam_item_count = 0;
        assert!(matches!(
            no_items.validate(),
            Err(GeneratorConfigError::Invalid("EXAM_ITEM_COUNT"))
        ));
    }

    #[test]
    fn test_out_of_range_count_is_rejected() {
        std::env::set_var("GENERATOR_TEST_OVERSIZED_COUNT", "4294967297");
        let parsed: Result<u32, _> = parse_or("GENERATOR_TEST_OVERSIZED_COUNT", 40);
        assert!(matches!(
            parsed,
            Err(GeneratorConfigError::Invalid("GENERATOR_TEST_OVERSIZED_COUNT"))
        ));

        let fallback: u32 = parse_or("GENERATOR_TEST_UNSET_COUNT", 40).unwrap();
        assert_eq!(fallback, 40);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(429, None), GenerationFailureKind::RateLimited);
        assert_eq!(classify_status(503, None), GenerationFailureKind::Transient);
        assert_eq!(classify_status(422, None), GenerationFailureKind::InvalidInput);
        assert_eq!(
            classify_status(400, Some("content_filtered")),
            GenerationFailureKind::ContentFiltered
        );
        assert_eq!(
            classify_status(429, Some("insufficient_quota")),
            GenerationFailureKind::UpstreamQuota
        );
        assert!(!GenerationFailureKind::UpstreamQuota.is_retryable());
        assert!(GenerationFailureKind::Timeout.is_retryable());
    }

    #[tokio::test]
    async fn test_successful_generation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/generate")
            .match_header("authorization", "Bearer gen-key")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "kind": "practice",
                "count": 2
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "items": [{
                        "id": "q1",
                        "section": "quantitative",
                        "category": "algebra",
                        "difficulty": "medium",
                        "prompt": "2x = 4, x = ?",
                        "options": ["1", "2", "3", "4"],
                        "correct_answer": "2",
                        "explanation": "Divide by two"
                    }],
                    "metadata": { "duration_ms": 1200, "tokens_used": 512 }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let generator = HttpContentGenerator::new(&config(format!("{}/generate", server.url()))).unwrap();
        let response = generator.generate(&practice_request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].correct_answer, "2");
        assert_eq!(response.metadata.tokens_used, Some(512));
        assert!(response.items[0].image_ref.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/generate")
            .with_status(429)
            .with_header("retry-after", "30")
            .with_body(r#"{"error":{"type":"rate_limit_exceeded","message":"slow down"}}"#)
            .create_async()
            .await;

        let generator = HttpContentGenerator::new(&config(format!("{}/generate", server.url()))).unwrap();
        let failure = generator.generate(&practice_request()).await.unwrap_err();

        assert_eq!(failure.kind, GenerationFailureKind::RateLimited);
        assert_eq!(failure.retry_after, Some(Duration::from_secs(30)));
        assert_eq!(failure.message, "slow down");
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/generate")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let generator = HttpContentGenerator::new(&config(format!("{}/generate", server.url()))).unwrap();
        let failure = generator.generate(&practice_request()).await.unwrap_err();
        assert_eq!(failure.kind, GenerationFailureKind::MalformedResponse);
    }
}
