#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-degrade** – The NORMAL ↔ EMERGENCY ↔ RECOVERING state machine.
//!
//! The controller owns the authoritative [`SystemState`], distributes it
//! over a watch channel every component reads atomically, and records each
//! transition as an event. Health failures (storage high-water, sustained
//! write latency, backlog, integrity breaks, virtual-filesystem failures)
//! force EMERGENCY from any state; the way back runs through an
//! operator-approved RECOVERING phase and a passing health check.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use bridge_auth::{AuthContext, ScopeBase, ScopeTarget, SessionAuthority};
use bridge_store::{EventLog, LogHealth, Projection};
use bridge_types::{
    AgentId, BridgeError, BridgeResult, Event, EventDraft, EventFilter, EventKind, EventPayload,
    StreamId, SystemDegraded, SystemRecovered, SystemRecovering, SystemState,
};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Health thresholds and drain behavior.
#[derive(Debug, Clone)]
pub struct DegradeConfig {
    /// Window granted to in-flight work when entering EMERGENCY.
    pub drain_window: Duration,
    /// Write latency above this is a health failure.
    pub max_write_latency: Duration,
    /// Producer backlog above this is a health failure.
    pub max_backlog: usize,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            drain_window: Duration::from_secs(30),
            max_write_latency: Duration::from_millis(500),
            max_backlog: 2048,
        }
    }
}

//─────────────────────────────
//  State projection
//─────────────────────────────

/// Replayable fold of the system-state events, used to recover the
/// authoritative state at startup.
#[derive(Debug, Default, Clone)]
pub struct SystemStateProjection;

/// Serialized state of [`SystemStateProjection`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SystemStateView {
    /// Current state.
    pub state: SystemState,
}

impl Default for SystemStateView {
    fn default() -> Self {
        Self { state: SystemState::Normal }
    }
}

impl Projection for SystemStateProjection {
    type State = SystemStateView;

    fn name(&self) -> &'static str {
        "system-state"
    }

    fn interest(&self) -> EventFilter {
        EventFilter::kinds([
            EventKind::SystemDegraded,
            EventKind::SystemRecovering,
            EventKind::SystemRecovered,
        ])
    }

    fn apply(&self, state: &mut Self::State, event: &Event) -> BridgeResult<()> {
        state.state = match &event.payload {
            EventPayload::SystemDegraded(_) => SystemState::Emergency,
            EventPayload::SystemRecovering(_) => SystemState::Recovering,
            EventPayload::SystemRecovered(_) => SystemState::Normal,
            other => {
                return Err(BridgeError::IntegrityBreak(format!(
                    "system-state projection cannot fold {}",
                    other.kind()
                )))
            }
        };
        Ok(())
    }
}

//─────────────────────────────
//  Controller
//─────────────────────────────

/// Owner of the system state machine.
pub struct DegradationController {
    log: EventLog,
    state_tx: watch::Sender<SystemState>,
    /// Serializes transitions so concurrent triggers cannot interleave.
    transition: Mutex<()>,
    config: DegradeConfig,
}

impl DegradationController {
    /// Create the controller with a recovered initial state.
    pub fn new(log: EventLog, initial: SystemState, config: DegradeConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(initial);
        Arc::new(Self { log, state_tx, transition: Mutex::new(()), config })
    }

    /// Current state.
    pub fn state(&self) -> SystemState {
        *self.state_tx.borrow()
    }

    /// Watch channel other components read the state from.
    pub fn watch(&self) -> watch::Receiver<SystemState> {
        self.state_tx.subscribe()
    }

    /// The drain window granted to in-flight work on degradation.
    pub fn drain_window(&self) -> Duration {
        self.config.drain_window
    }

    /// Force EMERGENCY from any state. Used by health monitors and
    /// integrity detection; no capability gate because the caller is the
    /// system itself.
    pub async fn report_failure(&self, reason: &str) -> BridgeResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() == SystemState::Emergency {
            return Ok(());
        }
        error!(reason, "entering EMERGENCY");
        self.append(EventPayload::SystemDegraded(SystemDegraded {
            reason: reason.to_string(),
            drain_window_secs: self.config.drain_window.as_secs(),
        }))
        .await?;
        let _ = self.state_tx.send(SystemState::Emergency);
        Ok(())
    }

    /// Operator-triggered EMERGENCY. Requires `admin.degrade`.
    pub async fn trigger_emergency(
        &self,
        authority: &SessionAuthority,
        ctx: &AuthContext,
        reason: &str,
    ) -> BridgeResult<()> {
        authority.authorize(ctx, ScopeBase::AdminDegrade, &ScopeTarget {
            agent: &ctx.agent,
            stream: None,
        })?;
        self.report_failure(&format!("operator {}: {reason}", ctx.agent)).await
    }

    /// EMERGENCY → RECOVERING, after the root cause is addressed.
    /// Requires `admin.degrade`.
    pub async fn begin_recovery(
        &self,
        authority: &SessionAuthority,
        ctx: &AuthContext,
    ) -> BridgeResult<()> {
        authority.authorize(ctx, ScopeBase::AdminDegrade, &ScopeTarget {
            agent: &ctx.agent,
            stream: None,
        })?;
        let _guard = self.transition.lock().await;
        if self.state() != SystemState::Emergency {
            return Err(BridgeError::SchemaViolation(format!(
                "cannot begin recovery from {}",
                self.state()
            )));
        }
        info!(operator = %ctx.agent, "entering RECOVERING");
        self.append(EventPayload::SystemRecovering(SystemRecovering {
            operator: ctx.agent.clone(),
        }))
        .await?;
        let _ = self.state_tx.send(SystemState::Recovering);
        Ok(())
    }

    /// RECOVERING → NORMAL, once the health check passes and the operator
    /// approves. Requires `admin.degrade`.
    pub async fn complete_recovery(
        &self,
        authority: &SessionAuthority,
        ctx: &AuthContext,
        health: &LogHealth,
    ) -> BridgeResult<()> {
        authority.authorize(ctx, ScopeBase::AdminDegrade, &ScopeTarget {
            agent: &ctx.agent,
            stream: None,
        })?;
        let _guard = self.transition.lock().await;
        if self.state() != SystemState::Recovering {
            return Err(BridgeError::SchemaViolation(format!(
                "cannot complete recovery from {}",
                self.state()
            )));
        }
        if let Some(reason) = self.health_failure(health) {
            return Err(BridgeError::Degraded(format!("health check failing: {reason}")));
        }
        info!(operator = %ctx.agent, "entering NORMAL");
        self.append(EventPayload::SystemRecovered(SystemRecovered {
            operator: ctx.agent.clone(),
        }))
        .await?;
        let _ = self.state_tx.send(SystemState::Normal);
        Ok(())
    }

    /// Watch log health and promote threshold violations to EMERGENCY.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        mut health: watch::Receiver<LogHealth>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while health.changed().await.is_ok() {
                let snapshot = health.borrow().clone();
                if let Some(reason) = controller.health_failure(&snapshot) {
                    if controller.state() == SystemState::Normal {
                        warn!(reason, "health monitor tripped");
                        if let Err(e) = controller.report_failure(&reason).await {
                            error!(error = %e, "failed to record degradation");
                        }
                    }
                }
            }
        })
    }

    fn health_failure(&self, health: &LogHealth) -> Option<String> {
        if health.storage_high_water {
            return Some("storage at high-water".into());
        }
        if health.last_batch_latency > self.config.max_write_latency {
            return Some(format!(
                "write latency {:?} above threshold",
                health.last_batch_latency
            ));
        }
        if health.backlog > self.config.max_backlog {
            return Some(format!("writer backlog {} above threshold", health.backlog));
        }
        if let Some(code) = &health.last_error {
            if code == "integrity_break" {
                return Some("integrity break reported by writer".into());
            }
        }
        None
    }

    async fn append(&self, payload: EventPayload) -> BridgeResult<()> {
        let draft = EventDraft::new(StreamId::system(), payload, AgentId::from("system"));
        self.log.append_one(draft).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_auth::{AgentsProjection, CapabilitySet, RateLimits, TokenAuthority};
    use bridge_store::{
        LogConfig, MemoryBackend, ProjectionEngine, SnapshotPolicy, SnapshotStore,
    };
    use bridge_types::Fingerprint;

    fn operator_ctx() -> AuthContext {
        AuthContext {
            agent: AgentId::from("operator"),
            capabilities: CapabilitySet::parse(&["admin.degrade".to_string()]).unwrap(),
            token_fingerprint: Fingerprint::of_bytes(b"op"),
        }
    }

    fn bare_ctx() -> AuthContext {
        AuthContext {
            agent: AgentId::from("intruder"),
            capabilities: CapabilitySet::default(),
            token_fingerprint: Fingerprint::of_bytes(b"x"),
        }
    }

    async fn setup() -> (EventLog, Arc<DegradationController>, Arc<SessionAuthority>) {
        let log = EventLog::start(Arc::new(MemoryBackend::new()), LogConfig::default())
            .await
            .unwrap();
        let agents = ProjectionEngine::new(
            AgentsProjection,
            SnapshotStore::disabled(),
            SnapshotPolicy::default(),
        );
        let authority = Arc::new(SessionAuthority::new(
            TokenAuthority::new(b"s"),
            agents,
            RateLimits::default(),
            600,
        ));
        let controller = DegradationController::new(
            log.clone(),
            SystemState::Normal,
            DegradeConfig::default(),
        );
        (log, controller, authority)
    }

    #[tokio::test]
    async fn full_degradation_sequence() {
        let (log, controller, authority) = setup().await;
        let op = operator_ctx();

        controller.report_failure("vfs health failure").await.unwrap();
        assert_eq!(controller.state(), SystemState::Emergency);
        // Repeated failures while degraded are a no-op.
        controller.report_failure("again").await.unwrap();

        controller.begin_recovery(&authority, &op).await.unwrap();
        assert_eq!(controller.state(), SystemState::Recovering);

        controller
            .complete_recovery(&authority, &op, &LogHealth::default())
            .await
            .unwrap();
        assert_eq!(controller.state(), SystemState::Normal);

        // The whole sequence is on the log, replayable into the same state.
        let events = log
            .read(
                bridge_types::EventId::ZERO,
                100,
                &EventFilter::stream("system"),
            )
            .await
            .unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::SystemDegraded,
                EventKind::SystemRecovering,
                EventKind::SystemRecovered
            ]
        );

        let projection = SystemStateProjection;
        let mut view = SystemStateView::default();
        for event in &events {
            projection.apply(&mut view, event).unwrap();
        }
        assert_eq!(view.state, SystemState::Normal);
    }

    #[tokio::test]
    async fn recovery_requires_admin_capability() {
        let (_log, controller, authority) = setup().await;
        controller.report_failure("storage").await.unwrap();

        let err = controller
            .begin_recovery(&authority, &bare_ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert_eq!(controller.state(), SystemState::Emergency);
    }

    #[tokio::test]
    async fn recovery_gated_on_health() {
        let (_log, controller, authority) = setup().await;
        let op = operator_ctx();
        controller.report_failure("storage").await.unwrap();
        controller.begin_recovery(&authority, &op).await.unwrap();

        let sick = LogHealth { storage_high_water: true, ..LogHealth::default() };
        let err = controller
            .complete_recovery(&authority, &op, &sick)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "degraded");
        assert_eq!(controller.state(), SystemState::Recovering);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let (_log, controller, authority) = setup().await;
        let op = operator_ctx();

        // NORMAL → RECOVERING is not a legal edge.
        assert!(controller.begin_recovery(&authority, &op).await.is_err());
        assert_eq!(controller.state(), SystemState::Normal);
    }

    #[tokio::test]
    async fn health_monitor_promotes_to_emergency() {
        let (log, controller, _authority) = setup().await;
        let (health_tx, health_rx) = watch::channel(LogHealth::default());
        controller.spawn_health_monitor(health_rx);

        health_tx
            .send(LogHealth { storage_high_water: true, ..LogHealth::default() })
            .unwrap();

        let mut state = controller.watch();
        tokio::time::timeout(Duration::from_secs(1), async {
            while *state.borrow() != SystemState::Emergency {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("controller never degraded");

        let events = log
            .read(
                bridge_types::EventId::ZERO,
                10,
                &EventFilter::kinds([EventKind::SystemDegraded]),
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
