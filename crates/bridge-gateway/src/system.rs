//! Validation, health, state, and operator endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use bridge_auth::{OpClass, ScopeBase, ScopeTarget};
use bridge_dispatch::{Decision, ValidationRequest};
use bridge_types::{
    AgentId, EventDraft, EventPayload, SecurityEvent, SecurityEventKind, SystemState,
};

use crate::error::ApiResult;
use crate::extract::{Authed, Correlation};
use crate::GatewayState;

//─────────────────────────────
//  Validation
//─────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub tool: String,
    pub args: Value,
}

/// `POST /validation/check` – synchronous speed-layer decision.
pub async fn validation_check(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
    Json(body): Json<CheckRequest>,
) -> ApiResult<Json<Decision>> {
    state.authority.authorize(
        &ctx,
        ScopeBase::ValidationCheck,
        &ScopeTarget { agent: &ctx.agent, stream: None },
    )?;
    if let Err(e) = state.authority.charge(&ctx.agent, OpClass::ValidationCheck) {
        if state.authority.sample_violation(&ctx.agent, OpClass::ValidationCheck) {
            let draft = EventDraft::new(
                ctx.agent.stream(),
                EventPayload::SecurityEvent(SecurityEvent {
                    kind: SecurityEventKind::RateLimitExceeded,
                    agent: Some(ctx.agent.clone()),
                    context: BTreeMap::from([(
                        "class".to_string(),
                        "validation_check".to_string(),
                    )]),
                }),
                AgentId::from("system"),
            );
            if let Err(err) = state.log.append_one(draft).await {
                warn!(error = %err, "failed to record rate violation");
            }
        }
        return Err(e.into());
    }

    let decision = state
        .dispatcher
        .check(ValidationRequest { tool: body.tool, args: body.args, agent: ctx.agent.clone() })
        .await?;
    Ok(Json(decision))
}

//─────────────────────────────
//  Health & state
//─────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub state: SystemState,
    pub latest_event: String,
    pub writer_backlog: usize,
    pub storage_high_water: bool,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub subscribers: usize,
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let log_health = state.log.health().borrow().clone();
    let (cache_hits, cache_misses) = state.dispatcher.cache_stats();
    Json(HealthResponse {
        state: state.controller.state(),
        latest_event: state.log.latest_id().to_string(),
        writer_backlog: log_health.backlog,
        storage_high_water: log_health.storage_high_water,
        cache_hits,
        cache_misses,
        subscribers: state.hub.subscriber_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: SystemState,
    pub drain_window_secs: u64,
}

/// `GET /state` – degradation state.
pub async fn system_state(State(state): State<Arc<GatewayState>>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.controller.state(),
        drain_window_secs: state.controller.drain_window().as_secs(),
    })
}

//─────────────────────────────
//  Operator transitions
//─────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DegradeRequest {
    pub reason: String,
}

/// `POST /admin/degrade` – operator-forced EMERGENCY.
pub async fn admin_degrade(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
    Json(body): Json<DegradeRequest>,
) -> ApiResult<Json<StateResponse>> {
    state
        .controller
        .trigger_emergency(&state.authority, &ctx, &body.reason)
        .await?;
    Ok(Json(StateResponse {
        state: state.controller.state(),
        drain_window_secs: state.controller.drain_window().as_secs(),
    }))
}

/// `POST /admin/recover/begin` – EMERGENCY → RECOVERING.
pub async fn admin_recover_begin(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
) -> ApiResult<Json<StateResponse>> {
    state.controller.begin_recovery(&state.authority, &ctx).await?;
    Ok(Json(StateResponse {
        state: state.controller.state(),
        drain_window_secs: state.controller.drain_window().as_secs(),
    }))
}

/// `POST /admin/recover/complete` – RECOVERING → NORMAL after health passes.
pub async fn admin_recover_complete(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(_correlation): Correlation,
) -> ApiResult<Json<StateResponse>> {
    let health = state.log.health().borrow().clone();
    state
        .controller
        .complete_recovery(&state.authority, &ctx, &health)
        .await?;
    Ok(Json(StateResponse {
        state: state.controller.state(),
        drain_window_secs: state.controller.drain_window().as_secs(),
    }))
}
