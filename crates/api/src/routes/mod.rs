//! HTTP routes

pub mod content;
pub mod subscription;
pub mod webhooks;

#[cfg(test)]
mod tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::auth::require_auth;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/subscription", get(subscription::get_subscription))
        .route("/subscription/checkout", post(subscription::begin_checkout))
        .route(
            "/subscription/checkout/confirm",
            post(subscription::confirm_checkout),
        )
        .route("/subscription/cancel", post(subscription::cancel_subscription))
        .route(
            "/subscription/reactivate",
            post(subscription::reactivate_subscription),
        )
        .route("/eligibility", get(content::check_eligibility))
        .route(
            "/sessions",
            get(content::list_sessions).post(content::create_session),
        )
        .route("/sessions/{id}", get(content::get_session))
        .route("/sessions/{id}/submit", post(content::submit_session))
        .route("/sessions/{id}/abandon", post(content::abandon_session))
        .route("/sessions/{id}/result", get(content::get_result))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .nest("/v1", protected)
        .with_state(state)
}
