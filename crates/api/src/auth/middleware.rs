//! Authentication middleware for Axum

use axum::{
    extract::{FromRef, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use super::jwt::{JwtError, JwtManager};
use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated user extracted from the access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// State the auth middleware needs
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no bearer token");
        return ApiError::Unauthorized.into_response();
    };

    match auth_state.jwt_manager.validate(token) {
        Ok(claims) => {
            tracing::debug!(path = %path, user_id = %claims.sub, "require_auth: authenticated");
            request.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                email: claims.email,
            });
            next.run(request).await
        }
        Err(JwtError::Expired) => {
            tracing::debug!(path = %path, "require_auth: token expired");
            ApiError::Unauthorized.into_response()
        }
        Err(JwtError::Invalid(reason)) => {
            tracing::warn!(path = %path, reason = %reason, "require_auth: invalid token");
            ApiError::Unauthorized.into_response()
        }
    }
}
