//! Subscription and checkout routes

use axum::extract::{Extension, State};
use axum::Json;
use examprep_billing::{CheckoutHandle, PaymentSheetResult, SubscriptionRecord, UpgradeOutcome};

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /v1/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let record = state.billing.subscriptions.get_or_create(auth_user.user_id).await?;
    Ok(Json(record))
}

/// POST /v1/subscription/checkout
///
/// Prepares the client-side payment sheet.
pub async fn begin_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CheckoutHandle>> {
    let handle = state.billing.checkout.begin_upgrade(auth_user.user_id).await?;
    Ok(Json(handle))
}

/// POST /v1/subscription/checkout/confirm
///
/// Body is the payment sheet result the client observed. On success this
/// waits (bounded) for the lifecycle webhook to activate premium.
pub async fn confirm_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(result): Json<PaymentSheetResult>,
) -> ApiResult<Json<UpgradeOutcome>> {
    let outcome = state
        .billing
        .checkout
        .resolve_payment(auth_user.user_id, result)
        .await?;
    Ok(Json(outcome))
}

/// POST /v1/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let record = state
        .billing
        .checkout
        .cancel_subscription(auth_user.user_id)
        .await?;
    Ok(Json(record))
}

/// POST /v1/subscription/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let record = state
        .billing
        .checkout
        .reactivate_subscription(auth_user.user_id)
        .await?;
    Ok(Json(record))
}
