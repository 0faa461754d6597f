//! Request extractors: bearer authentication and correlation ids.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;
use uuid::Uuid;

use bridge_auth::AuthContext;
use bridge_types::BridgeError;

use crate::error::ApiError;
use crate::GatewayState;

/// The authenticated caller, extracted from `Authorization: Bearer`.
pub struct Authed(pub AuthContext);

#[axum::async_trait]
impl FromRequestParts<Arc<GatewayState>> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(BridgeError::Unauthenticated("missing authorization header".into()))
            })?;
        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            ApiError(BridgeError::Unauthenticated("expected bearer scheme".into()))
        })?;
        let ctx = state.authority.authenticate(token).await?;
        Ok(Authed(ctx))
    }
}

/// Per-call correlation id, required on every mutating call.
pub struct Correlation(pub Uuid);

#[axum::async_trait]
impl FromRequestParts<Arc<GatewayState>> for Correlation {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<GatewayState>,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(BridgeError::SchemaViolation("missing X-Correlation-Id".into()))
            })?;
        let id = raw.parse().map_err(|_| {
            ApiError(BridgeError::SchemaViolation("malformed X-Correlation-Id".into()))
        })?;
        Ok(Correlation(id))
    }
}
