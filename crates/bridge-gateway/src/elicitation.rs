//! Elicitation endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use bridge_auth::{ScopeBase, ScopeTarget};
use bridge_elicitation::ElicitationView;
use bridge_types::{AgentId, BridgeError, EventId, ResponseType};

use crate::error::{ApiError, ApiResult};
use crate::extract::{Authed, Correlation};
use crate::GatewayState;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    /// Agent expected to respond.
    pub to: String,
    /// The request message.
    pub message: String,
    /// Schema accept payloads must satisfy.
    pub response_schema: Value,
    /// Deadline in seconds; server default applies when absent.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub event_id: EventId,
}

/// `POST /elicitation/create`.
pub async fn create(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
    Json(body): Json<CreateRequest>,
) -> ApiResult<Json<CreateResponse>> {
    let to = AgentId::new(body.to)?;
    let created = state
        .coordinator
        .create(
            &ctx,
            to,
            body.message,
            body.response_schema,
            body.timeout_secs.map(Duration::from_secs),
        )
        .await?;
    Ok(Json(CreateResponse {
        id: created.id,
        expires_at: created.expires_at,
        event_id: created.event_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub id: Uuid,
    pub response_type: ResponseType,
    pub payload: Value,
    /// Hex HMAC over the canonical response tuple.
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub event_id: EventId,
}

/// `POST /elicitation/respond`.
pub async fn respond(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
    Json(body): Json<RespondRequest>,
) -> ApiResult<Json<RespondResponse>> {
    let event_id = state
        .coordinator
        .respond(&ctx, body.id, body.response_type, body.payload, &body.signature)
        .await?;
    Ok(Json(RespondResponse { event_id }))
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct KeyResponse {
    /// Hex response key; derivable only by the addressed responder.
    pub response_key: String,
}

/// `POST /elicitation/key` – authenticated response-key derivation.
pub async fn derive_key(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
    Json(body): Json<KeyRequest>,
) -> ApiResult<Json<KeyResponse>> {
    let response_key = state.coordinator.derive_key(&ctx, body.id).await?;
    Ok(Json(KeyResponse { response_key }))
}

/// `GET /elicitation/pending/:agent`.
///
/// An agent may list its own pending elicitations; listing another agent's
/// requires `events.read:all`.
pub async fn pending(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Path(agent): Path<String>,
) -> ApiResult<Json<Vec<ElicitationView>>> {
    let agent = AgentId::new(agent)?;
    if agent != ctx.agent {
        let stream = agent.stream();
        state
            .authority
            .authorize(
                &ctx,
                ScopeBase::EventsRead,
                &ScopeTarget { agent: &ctx.agent, stream: Some(&stream) },
            )
            .map_err(|_| {
                ApiError(BridgeError::Forbidden(
                    "cannot list another agent's pending elicitations".into(),
                ))
            })?;
    }
    Ok(Json(state.coordinator.pending_for(&agent).await))
}
