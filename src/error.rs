use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{Map, Value};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UnprocessableEntity(String),
    /// Upstream platform (database, auth) unavailable or misconfigured.
    #[error("{0}")]
    Dependency(String),
    /// The payment processor rejected or failed the call.
    #[error("{0}")]
    Processor(String),
    /// A local write failed after an external side effect already happened.
    /// `details` carries the identifiers an operator needs to reconcile.
    #[error("{message}")]
    Persistence {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Dependency(_) => StatusCode::BAD_GATEWAY,
            Self::Processor(_) | Self::Persistence { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn persistence(message: impl Into<String>, details: &[(&str, Value)]) -> Self {
        let mut map = Map::new();
        for (key, value) in details {
            map.insert((*key).to_string(), value.clone());
        }
        Self::Persistence {
            message: message.into(),
            details: map,
        }
    }

    fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(false));
        body.insert("error".to_string(), Value::String(self.to_string()));
        if let Self::Persistence { details, .. } = self {
            for (key, value) in details {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
