//! Application state

use std::sync::Arc;

use examprep_billing::BillingService;
use examprep_content::ContentService;
use sqlx::PgPool;

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;

/// Shared application state, built once at startup and cloned into handlers
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub content: Arc<ContentService>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> anyhow::Result<Self> {
        let billing = BillingService::new(config.stripe.clone(), pool.clone())?;
        tracing::info!("Billing service initialized");

        let content = ContentService::new(
            &config.generator,
            pool,
            billing.subscriptions.clone(),
            billing.analytics.clone(),
        )?;
        tracing::info!(
            exam_items = config.generator.exam_item_count,
            exam_timeout_secs = config.generator.exam_timeout.as_secs(),
            practice_timeout_secs = config.generator.practice_timeout.as_secs(),
            "Content service initialized"
        );

        Ok(Self::from_services(
            billing,
            content,
            JwtManager::new(&config.supabase_jwt_secret),
        ))
    }

    pub fn from_services(billing: BillingService, content: ContentService, jwt_manager: JwtManager) -> Self {
        Self {
            billing: Arc::new(billing),
            content: Arc::new(content),
            auth: AuthState { jwt_manager },
        }
    }
}
