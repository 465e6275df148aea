//! Stripe webhook handler

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use examprep_billing::{BillingError, WebhookReceipt};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/stripe
///
/// Rejects deliveries without a valid signature. Every verified delivery is
/// acknowledged with 200, including ones that failed to apply; those are in
/// the event ledger for replay.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookReceipt>> {
    let Some(sig_header) = headers.get("stripe-signature") else {
        tracing::warn!("Missing Stripe-Signature header");
        return Err(ApiError::WebhookRejected("missing signature header"));
    };

    let Ok(signature) = sig_header.to_str() else {
        tracing::warn!("Invalid Stripe-Signature header encoding");
        return Err(ApiError::WebhookRejected("invalid signature header"));
    };

    let Ok(payload) = std::str::from_utf8(&body) else {
        tracing::warn!(len = body.len(), "Webhook body is not UTF-8");
        return Err(ApiError::WebhookRejected("payload is not UTF-8"));
    };

    match state.billing.webhooks.receive(payload, signature).await {
        Ok(receipt) => Ok(Json(receipt)),
        Err(BillingError::WebhookSignatureInvalid) => {
            Err(ApiError::WebhookRejected("invalid signature"))
        }
        Err(e) => Err(e.into()),
    }
}
