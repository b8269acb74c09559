use axum::{body::Bytes, extract::State, http::HeaderMap, response::IntoResponse, Json};

use crate::{
    auth::require_user_id,
    error::AppResult,
    schemas::{parse_required_body, InitiateChargeInput},
    services::charges::initiate_booking_charge,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/charges/sepa", axum::routing::post(initiate_sepa_charge))
}

async fn initiate_sepa_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    // Invalid input here is a 400, not the extractor's 422.
    let payload: InitiateChargeInput = parse_required_body(&body)?;
    let store = state.rent_store()?;
    let gateway = state.payment_gateway();

    let body = initiate_booking_charge(
        &store,
        &gateway,
        Some(&user_id),
        payload.booking_id.trim(),
    )
    .await?;
    Ok(Json(body))
}
