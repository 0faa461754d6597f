//! Mapping from typed bridge errors onto the HTTP surface.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use bridge_types::BridgeError;

/// Result alias for gateway handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Wire body every error returns.
#[derive(Debug, Serialize)]
struct ErrorBody {
    /// Stable identifier, e.g. `rate_limited`.
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

/// Newtype adapting [`BridgeError`] to an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            BridgeError::Forbidden(_) => StatusCode::FORBIDDEN,
            BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::Busy(_) | BridgeError::Degraded(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::SchemaViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::Replay(_) | BridgeError::Terminal(_) => StatusCode::CONFLICT,
            BridgeError::Expired(_) => StatusCode::GONE,
            BridgeError::IntegrityBreak(_) | BridgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let retry_after = self.0.retry_after();
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(d) = retry_after {
            if let Ok(value) = d.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
