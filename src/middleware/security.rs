use axum::body::Body;
use axum::extract::State;
use axum::http::{header::HOST, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::{error::AppError, state::AppState};

/// Reject requests whose `Host` is not listed in `TRUSTED_HOSTS`. An empty
/// list or `*` disables the check.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if host_allowed(&state.config.trusted_hosts, host) {
        return next.run(request).await;
    }
    tracing::warn!(host = %host, "Rejected request for untrusted host");
    AppError::BadRequest("Invalid host header.".to_string()).into_response()
}

fn host_allowed(trusted_hosts: &[String], host: &str) -> bool {
    if trusted_hosts.is_empty() || trusted_hosts.iter().any(|entry| entry == "*") {
        return true;
    }
    let hostname = strip_port(host).to_ascii_lowercase();
    trusted_hosts.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        match entry.strip_prefix("*.") {
            Some(suffix) => hostname.ends_with(&format!(".{suffix}")),
            None => hostname == entry,
        }
    })
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map_or(host, |v| v.trim_start_matches('['));
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}
