//! Eligibility, session and result routes

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use examprep_content::{ContentSession, Eligibility, GenerateRequest, ResultRecord, Submission};
use examprep_shared::ContentKind;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EligibilityQuery {
    pub kind: ContentKind,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub limit: Option<i64>,
}

/// GET /v1/eligibility?kind=exam|practice
pub async fn check_eligibility(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<EligibilityQuery>,
) -> ApiResult<Json<Eligibility>> {
    let eligibility = state
        .content
        .ledger()
        .check_eligibility(auth_user.user_id, query.kind)
        .await?;
    Ok(Json(eligibility))
}

/// POST /v1/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<(StatusCode, Json<ContentSession>)> {
    let session = state
        .content
        .generation
        .generate(auth_user.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /v1/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Vec<ContentSession>>> {
    let sessions = state
        .content
        .generation
        .list_sessions(auth_user.user_id, query.limit)
        .await?;
    Ok(Json(sessions))
}

/// GET /v1/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<ContentSession>> {
    let session = state
        .content
        .generation
        .get_session(auth_user.user_id, session_id)
        .await?;
    Ok(Json(session))
}

/// POST /v1/sessions/{id}/submit
pub async fn submit_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
    Json(submission): Json<Submission>,
) -> ApiResult<Json<ResultRecord>> {
    let result = state
        .content
        .generation
        .submit(auth_user.user_id, session_id, submission)
        .await?;
    Ok(Json(result))
}

/// POST /v1/sessions/{id}/abandon
pub async fn abandon_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<ContentSession>> {
    let session = state
        .content
        .generation
        .abandon(auth_user.user_id, session_id)
        .await?;
    Ok(Json(session))
}

/// GET /v1/sessions/{id}/result
pub async fn get_result(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<ResultRecord>> {
    let result = state
        .content
        .generation
        .get_result(auth_user.user_id, session_id)
        .await?;
    Ok(Json(result))
}
