#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ExamPrep API Library
//!
//! HTTP surface over the billing and content crates: Supabase token auth,
//! the Stripe webhook endpoint, checkout, eligibility and session routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
