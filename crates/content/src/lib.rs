// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ExamPrep Content Module
//!
//! Everything between "the user asked for questions" and "the user saw a score".
//!
//! ## Features
//!
//! - **Quota Ledger**: Tier-based eligibility, fixed UTC weekly exam window
//! - **Generation**: Bounded calls to the external generator, classified failures
//! - **Sessions**: Persisted attempts with single, idempotent completion
//! - **Scoring**: Pure section, category, strength and weakness computation
//! - **Invariants**: Runnable consistency checks over sessions and results

pub mod error;
pub mod generator;
pub mod invariants;
pub mod quota;
pub mod scoring;
pub mod service;
pub mod sessions;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use examprep_billing::{AnalyticsStore, SubscriptionStore};
use sqlx::PgPool;

// Error
pub use error::{ContentError, ContentResult};

// Generator
pub use generator::{
    classify_status, ContentGenerator, Difficulty, GeneratedItem, GenerationFailure,
    GenerationFailureKind, GenerationMetadata, GenerationRequest, GenerationResponse,
    GeneratorConfig, GeneratorConfigError, HttpContentGenerator, PracticeCriteria,
};

// Invariants
pub use invariants::{session_violations, ContentInvariantChecker};

// Quota
pub use quota::{evaluate, week_window, Eligibility, EligibilityCode, QuotaLedger, TierLimits};

// Scoring
pub use scoring::{score, CategoryScore, Highlight, ScoreReport, SectionScore};

// Service
pub use service::{GenerateRequest, GenerationService, GenerationSettings, Submission};

// Sessions
pub use sessions::{
    CompleteOutcome, Completion, ContentSession, MemorySessionStore, PgSessionStore, ResultRecord,
    SessionStore,
};

/// Content service wired against Postgres and the HTTP generator
pub struct ContentService {
    pub sessions: Arc<dyn SessionStore>,
    pub generation: GenerationService,
}

impl ContentService {
    /// Create from environment variables, sharing the billing stores
    pub fn from_env(
        pool: PgPool,
        subscriptions: Arc<dyn SubscriptionStore>,
        analytics: Arc<dyn AnalyticsStore>,
    ) -> Result<Self, GeneratorConfigError> {
        Self::new(&GeneratorConfig::from_env()?, pool, subscriptions, analytics)
    }

    pub fn new(
        config: &GeneratorConfig,
        pool: PgPool,
        subscriptions: Arc<dyn SubscriptionStore>,
        analytics: Arc<dyn AnalyticsStore>,
    ) -> Result<Self, GeneratorConfigError> {
        let generator = Arc::new(HttpContentGenerator::new(config)?);

        Ok(Self::with_components(
            GenerationSettings::from(config),
            Arc::new(PgSessionStore::new(pool)),
            subscriptions,
            analytics,
            generator,
        ))
    }

    /// Assemble from explicit stores and generator
    pub fn with_components(
        settings: GenerationSettings,
        sessions: Arc<dyn SessionStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        analytics: Arc<dyn AnalyticsStore>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        let ledger = QuotaLedger::new(subscriptions, sessions.clone());

        Self {
            generation: GenerationService::new(
                ledger,
                sessions.clone(),
                generator,
                analytics,
                settings,
            ),
            sessions,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        self.generation.ledger()
    }
}
