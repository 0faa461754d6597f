#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-gateway** – The external-facing surface of the Bridge.
//!
//! Every external call lands here: it is authenticated by the session
//! authority, wrapped in a correlation id, routed to the owning subsystem,
//! and answered with typed errors whose identifiers are stable for
//! programmatic handling. The gateway is the only component that knows
//! about HTTP framing; everything behind it speaks typed requests and
//! events.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use bridge_auth::SessionAuthority;
use bridge_degrade::DegradationController;
use bridge_dispatch::SpeedDispatcher;
use bridge_elicitation::ElicitationCoordinator;
use bridge_hub::SubscriptionHub;
use bridge_store::EventLog;
use bridge_types::BridgeResult;

mod elicitation;
mod error;
mod events;
mod extract;
mod system;

pub use error::{ApiError, ApiResult};
pub use extract::{Authed, Correlation};

/// Shared state behind every handler.
pub struct GatewayState {
    /// Identity and capability gate.
    pub authority: Arc<SessionAuthority>,
    /// The event log.
    pub log: EventLog,
    /// Real-time fan-out.
    pub hub: SubscriptionHub,
    /// Elicitation coordinator.
    pub coordinator: Arc<ElicitationCoordinator>,
    /// Speed-layer dispatcher.
    pub dispatcher: Arc<SpeedDispatcher>,
    /// Degradation controller.
    pub controller: Arc<DegradationController>,
}

/// Build the gateway router over the assembled components.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/events", post(events::append_one).get(events::read_events))
        .route("/events/batch", post(events::append_batch))
        .route("/events/async", post(events::append_async))
        .route("/events/query", post(events::query_events))
        .route("/events/stream", get(events::stream_events))
        .route("/elicitation/create", post(elicitation::create))
        .route("/elicitation/respond", post(elicitation::respond))
        .route("/elicitation/key", post(elicitation::derive_key))
        .route("/elicitation/pending/:agent", get(elicitation::pending))
        .route("/validation/check", post(system::validation_check))
        .route("/health", get(system::health))
        .route("/state", get(system::system_state))
        .route("/admin/degrade", post(system::admin_degrade))
        .route("/admin/recover/begin", post(system::admin_recover_begin))
        .route("/admin/recover/complete", post(system::admin_recover_complete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the gateway until the process shuts down.
pub async fn serve(state: Arc<GatewayState>, bind: &str) -> BridgeResult<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await.map_err(|e| {
        bridge_types::BridgeError::Internal(format!("cannot bind {bind}: {e}"))
    })?;
    info!(%bind, "gateway listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| bridge_types::BridgeError::Internal(format!("server error: {e}")))
}
