//! The elicitation coordinator: create, respond, expire.
//!
//! Every state change is an event on the elicitation's own stream, so a
//! crashed coordinator rebuilds its pending set by projection, audit comes
//! free, and requesters receive responses through the subscription hub with
//! the same ordering guarantees as any other event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bridge_auth::{AuthContext, NonceStore, OpClass, ScopeBase, ScopeTarget, SessionAuthority};
use bridge_store::{EventLog, ProjectionEngine};
use bridge_types::{
    AgentId, BridgeError, BridgeResult, ElicitationCreated, ElicitationExpired,
    ElicitationResponded, EventDraft, EventId, EventPayload, ResponseType, SecurityEvent,
    SecurityEventKind, StreamId, SystemState,
};

use crate::keys::ResponseKey;
use crate::projection::{ElicitationView, ElicitationsProjection};

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct ElicitationConfig {
    /// Deadline applied when the requester does not pass one.
    pub default_timeout: Duration,
    /// Upper bound on requester-supplied deadlines; also sizes the nonce
    /// store's retention window.
    pub max_timeout: Duration,
    /// How often the expiry sweeper scans for overdue elicitations.
    pub sweep_interval: Duration,
    /// How long coordinator calls wait for the projection to catch up.
    pub projection_wait: Duration,
}

impl Default for ElicitationConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(1),
            projection_wait: Duration::from_secs(5),
        }
    }
}

/// What `create` hands back to the requester. The response key is *not*
/// here: the responder derives it through [`ElicitationCoordinator::derive_key`].
#[derive(Debug, Clone)]
pub struct CreatedElicitation {
    /// Elicitation id.
    pub id: Uuid,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
    /// The `ElicitationCreated` event id.
    pub event_id: EventId,
}

/// Coordinator over the log, the elicitations projection, and the auth gate.
pub struct ElicitationCoordinator {
    log: EventLog,
    projection: Arc<ProjectionEngine<ElicitationsProjection>>,
    authority: Arc<SessionAuthority>,
    secret: [u8; 32],
    system_state: watch::Receiver<SystemState>,
    config: ElicitationConfig,
}

impl ElicitationCoordinator {
    /// Build a coordinator. `secret` is the key-derivation secret shared by
    /// nothing else; it never appears on the log.
    pub fn new(
        log: EventLog,
        projection: Arc<ProjectionEngine<ElicitationsProjection>>,
        authority: Arc<SessionAuthority>,
        secret: [u8; 32],
        system_state: watch::Receiver<SystemState>,
        config: ElicitationConfig,
    ) -> Arc<Self> {
        Arc::new(Self { log, projection, authority, secret, system_state, config })
    }

    /// The elicitations projection, for read surfaces.
    pub fn projection(&self) -> &Arc<ProjectionEngine<ElicitationsProjection>> {
        &self.projection
    }

    //───────────────────── create ─────────────────────

    /// Open an elicitation from the authenticated agent toward `to`.
    pub async fn create(
        &self,
        ctx: &AuthContext,
        to: AgentId,
        message: String,
        response_schema: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<CreatedElicitation> {
        self.authority.authorize(
            ctx,
            ScopeBase::ElicitationCreate,
            &ScopeTarget { agent: &ctx.agent, stream: None },
        )?;
        self.charge(ctx, OpClass::ElicitationCreate).await?;

        if !self.system_state.borrow().accepts_elicitation_create() {
            return Err(BridgeError::Degraded(
                "elicitation create refused while degraded".into(),
            ));
        }

        // The schema must compile now, not at response time.
        jsonschema::JSONSchema::compile(&response_schema).map_err(|e| {
            BridgeError::SchemaViolation(format!("response schema does not compile: {e}"))
        })?;

        let timeout = timeout.unwrap_or(self.config.default_timeout).min(self.config.max_timeout);
        let id = Uuid::new_v4();
        let nonce = NonceStore::generate();
        let key = ResponseKey::derive(&self.secret, id, &to, &nonce);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(timeout)
                .map_err(|e| BridgeError::Internal(format!("timeout out of range: {e}")))?;

        let draft = EventDraft::new(
            StreamId::elicitation(id.to_string()),
            EventPayload::ElicitationCreated(ElicitationCreated {
                id,
                from: ctx.agent.clone(),
                to,
                message,
                response_schema,
                nonce,
                key_fingerprint: key.fingerprint(),
                expires_at,
            }),
            ctx.agent.clone(),
        );
        let event_id = self.log.append_one(draft).await?;
        // Read-your-writes: the responder may look the elicitation up
        // immediately after the requester's call returns.
        self.projection.await_applied(event_id, self.config.projection_wait).await?;

        info!(%id, event = %event_id, "elicitation created");
        Ok(CreatedElicitation { id, expires_at, event_id })
    }

    //───────────────────── key derivation ─────────────────────

    /// Re-derive the response key for the authenticated responder.
    ///
    /// Only the elicitation's `to` agent may obtain the key; anyone else
    /// trips a security event. The key is returned hex encoded and is never
    /// persisted anywhere.
    pub async fn derive_key(&self, ctx: &AuthContext, id: Uuid) -> BridgeResult<String> {
        self.authority.authorize(
            ctx,
            ScopeBase::ElicitationRespond,
            &ScopeTarget { agent: &ctx.agent, stream: None },
        )?;
        let view = self.lookup_open(id).await?;
        if ctx.agent != view.to {
            self.record_security_event(
                SecurityEventKind::UnauthorizedResponse,
                &ctx.agent,
                [("elicitation".to_string(), id.to_string()), ("op".to_string(), "derive_key".to_string())],
            )
            .await;
            return Err(BridgeError::Forbidden("not the addressed responder".into()));
        }
        Ok(ResponseKey::derive(&self.secret, id, &view.to, &view.nonce).to_hex())
    }

    //───────────────────── respond ─────────────────────

    /// Submit the single terminal response to an elicitation.
    pub async fn respond(
        &self,
        ctx: &AuthContext,
        id: Uuid,
        response_type: ResponseType,
        payload: Value,
        signature_hex: &str,
    ) -> BridgeResult<EventId> {
        self.authority.authorize(
            ctx,
            ScopeBase::ElicitationRespond,
            &ScopeTarget { agent: &ctx.agent, stream: None },
        )?;
        self.charge(ctx, OpClass::ElicitationRespond).await?;

        let view = self.lookup_open(id).await?;

        // Identity before cryptography: a response from anyone but the
        // addressed agent is an impersonation attempt regardless of what
        // signature it carries.
        if ctx.agent != view.to {
            self.record_security_event(
                SecurityEventKind::UnauthorizedResponse,
                &ctx.agent,
                [("elicitation".to_string(), id.to_string())],
            )
            .await;
            return Err(BridgeError::Forbidden("not the addressed responder".into()));
        }

        let key = ResponseKey::derive(&self.secret, id, &view.to, &view.nonce);
        if let Err(e) = key.verify(id, &ctx.agent, response_type, &payload, signature_hex) {
            self.record_security_event(
                SecurityEventKind::InvalidSignature,
                &ctx.agent,
                [("elicitation".to_string(), id.to_string())],
            )
            .await;
            return Err(e);
        }

        // The nonce is the atomic arbiter of the single terminal
        // transition: whoever consumes it first wins.
        if let Err(e) = self.authority.nonces().consume(&view.nonce) {
            self.record_security_event(
                SecurityEventKind::ReplayAttempt,
                &ctx.agent,
                [("elicitation".to_string(), id.to_string())],
            )
            .await;
            return Err(e);
        }

        if response_type == ResponseType::Accept {
            let compiled = jsonschema::JSONSchema::compile(&view.response_schema)
                .map_err(|e| BridgeError::Internal(format!("stored schema rejected: {e}")))?;
            let validation_result = compiled.validate(&payload);
            if let Err(errors) = validation_result {
                let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(BridgeError::SchemaViolation(format!(
                    "accept payload rejected by schema: {}",
                    detail.join("; ")
                )));
            }
        }

        let draft = EventDraft::new(
            StreamId::elicitation(id.to_string()),
            EventPayload::ElicitationResponded(ElicitationResponded {
                id,
                responder: ctx.agent.clone(),
                response_type,
                payload,
                responded_at: Utc::now(),
            }),
            ctx.agent.clone(),
        );
        let event_id = self.log.append_one(draft).await?;
        self.projection.await_applied(event_id, self.config.projection_wait).await?;

        info!(%id, event = %event_id, ?response_type, "elicitation responded");
        Ok(event_id)
    }

    //───────────────────── queries ─────────────────────

    /// Pending elicitations addressed to `agent`, oldest deadline first.
    pub async fn pending_for(&self, agent: &AgentId) -> Vec<ElicitationView> {
        self.projection.read(|state| state.pending_for(agent)).await
    }

    /// Current view of one elicitation.
    pub async fn get(&self, id: Uuid) -> Option<ElicitationView> {
        self.projection.read(|state| state.items.get(&id).cloned()).await
    }

    //───────────────────── expiry ─────────────────────

    /// Expire overdue elicitations. Idempotent: an elicitation whose nonce
    /// is already consumed (a response just landed or a previous sweep got
    /// it) is skipped.
    pub async fn sweep_expired(&self) -> BridgeResult<usize> {
        // Best effort catch-up so the sweep sees recent responses.
        let head = self.log.latest_id();
        let _ = self.projection.await_applied(head, self.config.projection_wait).await;

        let now = Utc::now();
        let overdue = self.projection.read(|state| state.overdue(now)).await;
        let mut expired = 0usize;
        for view in overdue {
            if self.authority.nonces().consume(&view.nonce).is_err() {
                debug!(id = %view.id, "skipping expiry: nonce already consumed");
                continue;
            }
            let draft = EventDraft::new(
                StreamId::elicitation(view.id.to_string()),
                EventPayload::ElicitationExpired(ElicitationExpired {
                    id: view.id,
                    expired_at: now,
                }),
                AgentId::from("system"),
            );
            let event_id = self.log.append_one(draft).await?;
            let _ = self.projection.await_applied(event_id, self.config.projection_wait).await;
            expired += 1;
        }
        if expired > 0 {
            info!(expired, "expiry sweep completed");
        }
        Ok(expired)
    }

    /// Spawn the periodic expiry sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.sweep_expired().await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
        })
    }

    //───────────────────── internals ─────────────────────

    /// Look up an elicitation that is still open for a transition.
    async fn lookup_open(&self, id: Uuid) -> BridgeResult<ElicitationView> {
        let view = self
            .get(id)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("elicitation {id}")))?;
        if view.status.is_terminal() {
            return Err(BridgeError::Terminal(format!("elicitation {id}")));
        }
        if view.is_overdue(Utc::now()) {
            return Err(BridgeError::Expired(format!("elicitation {id}")));
        }
        Ok(view)
    }

    async fn charge(&self, ctx: &AuthContext, class: OpClass) -> BridgeResult<()> {
        match self.authority.charge(&ctx.agent, class) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.authority.sample_violation(&ctx.agent, class) {
                    self.record_security_event(
                        SecurityEventKind::RateLimitExceeded,
                        &ctx.agent,
                        [("class".to_string(), format!("{class:?}"))],
                    )
                    .await;
                }
                Err(e)
            }
        }
    }

    /// Append a security event; failures are logged, never masked over the
    /// caller's primary error.
    async fn record_security_event(
        &self,
        kind: SecurityEventKind,
        offender: &AgentId,
        context: impl IntoIterator<Item = (String, String)>,
    ) {
        let draft = EventDraft::new(
            offender.stream(),
            EventPayload::SecurityEvent(SecurityEvent {
                kind,
                agent: Some(offender.clone()),
                context: context.into_iter().collect::<BTreeMap<_, _>>(),
            }),
            AgentId::from("system"),
        );
        if let Err(e) = self.log.append_one(draft).await {
            warn!(error = %e, ?kind, "failed to record security event");
        }
    }
}
