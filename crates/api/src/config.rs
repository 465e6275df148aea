//! Configuration for the API server.

use std::time::Duration;

use examprep_billing::{BillingError, StripeConfig};
use examprep_content::{GeneratorConfig, GeneratorConfigError};

/// API server configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Address the HTTP listener binds to
    pub bind_address: String,
    /// HS256 secret used by Supabase to sign access tokens
    pub supabase_jwt_secret: String,
    pub allowed_origins: Vec<String>,
    /// Upper bound on a single request; must exceed the exam generation timeout
    pub request_timeout: Duration,
    pub stripe: StripeConfig,
    pub generator: GeneratorConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let supabase_jwt_secret = std::env::var("SUPABASE_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("SUPABASE_JWT_SECRET"))?;

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "150".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("REQUEST_TIMEOUT_SECS"))?;

        let stripe = StripeConfig::from_env()?;
        let generator = GeneratorConfig::from_env()?;

        Ok(Self {
            database_url,
            bind_address,
            supabase_jwt_secret,
            allowed_origins,
            request_timeout: Duration::from_secs(request_timeout_secs),
            stripe,
            generator,
        })
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Billing configuration: {0}")]
    Billing(#[from] BillingError),

    #[error("Generator configuration: {0}")]
    Generator(#[from] GeneratorConfigError),
}
