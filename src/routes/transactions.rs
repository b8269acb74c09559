use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    schemas::{parse_optional_body, validate_input, MarkPaidManuallyInput, TransactionPath},
    services::{
        charges::{charge_transaction, mark_transaction_paid_manually, switch_transaction_to_manual},
        rent_store::RentStore,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/transactions/{transaction_id}",
            axum::routing::get(get_transaction),
        )
        .route(
            "/transactions/{transaction_id}/charge",
            axum::routing::post(charge_transaction_handler),
        )
        .route(
            "/transactions/{transaction_id}/mark-paid-manually",
            axum::routing::post(mark_paid_manually_handler),
        )
        .route(
            "/transactions/{transaction_id}/switch-to-manual",
            axum::routing::post(switch_to_manual_handler),
        )
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(path): Path<TransactionPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;

    let transaction = store
        .transaction(&path.transaction_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Transaction not found.".to_string()))?;
    Ok(Json(json!({ "data": transaction })))
}

async fn charge_transaction_handler(
    State(state): State<AppState>,
    Path(path): Path<TransactionPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;
    let gateway = state.payment_gateway();

    let body = charge_transaction(&store, &gateway, Some(&user_id), &path.transaction_id).await?;
    Ok(Json(body))
}

async fn mark_paid_manually_handler(
    State(state): State<AppState>,
    Path(path): Path<TransactionPath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let payload: MarkPaidManuallyInput = parse_optional_body(&body)?;
    validate_input(&payload)?;
    let store = state.rent_store()?;

    let body = mark_transaction_paid_manually(
        &store,
        Some(&user_id),
        &path.transaction_id,
        payload.note.as_deref(),
    )
    .await?;
    Ok(Json(body))
}

async fn switch_to_manual_handler(
    State(state): State<AppState>,
    Path(path): Path<TransactionPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;

    let body = switch_transaction_to_manual(&store, Some(&user_id), &path.transaction_id).await?;
    Ok(Json(body))
}
