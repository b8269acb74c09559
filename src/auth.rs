use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{config::AppConfig, error::AppError, state::AppState};

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseClaims {
    pub sub: String,
}

/// Resolve the operator behind the request. Every lifecycle action is an
/// operator action, so all non-webhook routes call this first.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    resolve_user_id(&state.config, headers)
}

fn resolve_user_id(config: &AppConfig, headers: &HeaderMap) -> Result<String, AppError> {
    if config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_str(headers, "x-user-id") {
            return Ok(user_id);
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;

    let secret = config.supabase_jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("SUPABASE_JWT_SECRET is not configured.".to_string())
    })?;

    let claims = decode_claims(&token, secret)?;
    if claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }
    Ok(claims.sub)
}

fn decode_claims(token: &str, secret: &str) -> Result<SupabaseClaims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["authenticated"]);

    decode::<SupabaseClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|error| {
        tracing::debug!(error = %error, "Rejected access token");
        AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_str(headers, "authorization")?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}
