use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    schemas::{validate_input, BookingPath, CreateBookingInput},
    services::{
        bookings::{create_booking, schedule_invoices, BookingPolicy},
        charges::switch_booking_to_manual,
        rent_store::RentStore,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/bookings", axum::routing::post(create_booking_handler))
        .route("/bookings/{booking_id}", axum::routing::get(get_booking))
        .route(
            "/bookings/{booking_id}/transactions",
            axum::routing::get(list_booking_transactions),
        )
        .route(
            "/bookings/{booking_id}/switch-to-manual",
            axum::routing::post(switch_booking_to_manual_handler),
        )
        .route(
            "/bookings/{booking_id}/schedule-invoices",
            axum::routing::post(schedule_invoices_handler),
        )
}

async fn create_booking_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBookingInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let store = state.rent_store()?;
    let gateway = state.payment_gateway();

    let policy = BookingPolicy {
        min_booking_months: state.config.min_booking_months,
        invoice_scheduling_enabled: state.config.invoice_scheduling_enabled,
    };
    let body = create_booking(
        &store,
        &gateway,
        policy,
        Some(&user_id),
        payload.into(),
        Utc::now().date_naive(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(body)))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;

    let booking = store
        .booking(&path.booking_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Booking not found.".to_string()))?;
    Ok(Json(json!({ "data": booking })))
}

async fn list_booking_transactions(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;

    if store.booking(&path.booking_id).await?.is_none() {
        return Err(AppError::NotFound("Booking not found.".to_string()));
    }
    let transactions = store.booking_transactions(&path.booking_id).await?;
    Ok(Json(json!({ "data": transactions })))
}

async fn switch_booking_to_manual_handler(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;

    let body = switch_booking_to_manual(&store, Some(&user_id), &path.booking_id).await?;
    Ok(Json(body))
}

async fn schedule_invoices_handler(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let store = state.rent_store()?;
    let gateway = state.payment_gateway();

    let report = schedule_invoices(
        &store,
        &gateway,
        Some(&user_id),
        &path.booking_id,
        Utc::now().date_naive(),
    )
    .await?;

    Ok(Json(json!({
        "success": true,
        "booking_id": path.booking_id,
        "scheduled": report.scheduled,
        "warnings": report.warnings,
    })))
}
