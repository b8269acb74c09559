use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::Value;

use crate::{
    error::{AppError, AppResult},
    services::{stripe::verify_stripe_signature, webhooks::reconcile_event},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/webhooks/stripe", axum::routing::post(stripe_webhook))
}

/// Unauthenticated; trust comes from the `Stripe-Signature` header.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<impl IntoResponse> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| {
            AppError::Dependency("STRIPE_WEBHOOK_SECRET is not configured.".to_string())
        })?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_stripe_signature(&body, signature, secret) {
        tracing::warn!("Rejected Stripe webhook with an invalid signature");
        return Err(AppError::Unauthorized(
            "Invalid Stripe signature.".to_string(),
        ));
    }

    let event: Value = serde_json::from_str(&body)
        .map_err(|error| AppError::BadRequest(format!("Invalid Stripe event: {error}")))?;
    let store = state.rent_store()?;

    let summary = reconcile_event(&store, &event).await?;
    Ok(Json(summary))
}
