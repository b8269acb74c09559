use axum::{routing::get, Router};

use crate::state::AppState;

pub mod bookings;
pub mod charges;
pub mod health;
pub mod transactions;
pub mod webhooks;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(bookings::router())
        .merge(charges::router())
        .merge(transactions::router())
        .merge(webhooks::router())
}
