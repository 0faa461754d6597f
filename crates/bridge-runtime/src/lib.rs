#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-runtime** – Construction-time context for a bridge node.
//!
//! There are no ambient singletons anywhere in the workspace: every
//! component (log, hub, authority, coordinator, dispatcher, controller) is
//! built here, handed its collaborators explicitly, and owned by the
//! [`Bridge`] for its lifetime. Startup order matters and lives in one
//! place: open storage → recover the log → rebuild projections → recover
//! the degradation state → start pumps, sweeper, monitors → expose the
//! gateway.

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use bridge_auth::{
    AgentsProjection, AuthContext, CapabilitySet, RateLimits, SessionAuthority, TokenAuthority,
};
use bridge_degrade::{DegradationController, DegradeConfig, SystemStateProjection};
use bridge_dispatch::{
    DispatchConfig, FeatureClassifier, PolicyRule, PolicyTier, SpeedDispatcher,
};
use bridge_elicitation::{
    ElicitationConfig, ElicitationCoordinator, ElicitationsProjection,
};
use bridge_gateway::GatewayState;
use bridge_hub::{Delivery, SubscriptionHub};
use bridge_store::{
    DiskBackend, EventLog, LogBackend, LogConfig, MemoryBackend, Projection, ProjectionEngine,
    SnapshotPolicy, SnapshotStore,
};
use bridge_types::{
    AgentId, EventDraft, EventPayload, Fingerprint, SnapshotTaken, StreamId,
};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Storage selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-memory, non-persistent; for tests and ephemeral nodes.
    Memory,
    /// Segmented files under a data directory.
    Disk {
        /// Data directory; the log lives in `<dir>/log`, snapshots in
        /// `<dir>/snapshots`.
        dir: String,
    },
}

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Storage backend.
    pub storage: StorageConfig,
    /// Event log tunables.
    pub log: LogConfig,
    /// Per-subscription hub buffer depth.
    pub hub_buffer: usize,
    /// Secret for capability-token signing.
    pub token_secret: String,
    /// Rate limits per operation class.
    pub rate_limits: RateLimits,
    /// Snapshotting policy shared by all projections.
    pub snapshots: SnapshotPolicy,
    /// Expert agents the speed layer escalates to.
    pub experts: Vec<String>,
    /// Declarative policy rules for the speed layer.
    pub policy_rules: Vec<PolicyRule>,
    /// Gateway bind address.
    pub bind: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            log: LogConfig::default(),
            hub_buffer: bridge_hub::DEFAULT_BUFFER,
            token_secret: String::new(),
            rate_limits: RateLimits::default(),
            snapshots: SnapshotPolicy::default(),
            experts: Vec::new(),
            policy_rules: Vec::new(),
            bind: "127.0.0.1:7411".to_string(),
        }
    }
}

//─────────────────────────────
//  Bridge
//─────────────────────────────

/// A fully wired bridge node.
pub struct Bridge {
    log: EventLog,
    hub: SubscriptionHub,
    authority: Arc<SessionAuthority>,
    coordinator: Arc<ElicitationCoordinator>,
    dispatcher: Arc<SpeedDispatcher>,
    controller: Arc<DegradationController>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Build and start every component.
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        // Storage and the recovered log come first; everything else is a
        // projection of what they hold.
        let (backend, snapshots): (Arc<dyn LogBackend>, SnapshotStore) = match &config.storage {
            StorageConfig::Memory => {
                (Arc::new(MemoryBackend::new()), SnapshotStore::disabled())
            }
            StorageConfig::Disk { dir } => {
                let dir = std::path::PathBuf::from(dir);
                let backend = DiskBackend::open(dir.join("log"), &config.log)
                    .await
                    .context("opening event log")?;
                (Arc::new(backend), SnapshotStore::on_disk(dir.join("snapshots")))
            }
        };
        let log = EventLog::start(backend, config.log.clone())
            .await
            .context("starting log writer")?;
        let hub = SubscriptionHub::start(log.clone(), config.hub_buffer);

        // Projections rebuild from snapshot + tail before anything reads
        // them.
        let agents = ProjectionEngine::new(
            AgentsProjection,
            snapshots.clone(),
            config.snapshots.clone(),
        );
        let elicitations = ProjectionEngine::new(
            ElicitationsProjection,
            snapshots.clone(),
            config.snapshots.clone(),
        );
        let system_state = ProjectionEngine::new(
            SystemStateProjection,
            snapshots.clone(),
            config.snapshots.clone(),
        );
        agents.rebuild(&log).await?;
        elicitations.rebuild(&log).await?;
        system_state.rebuild(&log).await?;

        // The controller resumes the state the log last recorded.
        let initial_state = system_state.read(|s| s.state).await;
        let controller = DegradationController::new(
            log.clone(),
            initial_state,
            DegradeConfig::default(),
        );
        let mut tasks = Vec::new();
        tasks.push(controller.spawn_health_monitor(log.health()));

        let token_secret = if config.token_secret.is_empty() {
            warn!("no token secret configured; generating an ephemeral one");
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        } else {
            config.token_secret.clone()
        };
        let authority = Arc::new(SessionAuthority::new(
            TokenAuthority::new(token_secret.as_bytes()),
            Arc::clone(&agents),
            config.rate_limits.clone(),
            ElicitationConfig::default().max_timeout.as_secs(),
        ));

        let mut elicitation_secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut elicitation_secret);
        let coordinator = ElicitationCoordinator::new(
            log.clone(),
            Arc::clone(&elicitations),
            Arc::clone(&authority),
            elicitation_secret,
            controller.watch(),
            ElicitationConfig::default(),
        );
        tasks.push(coordinator.spawn_sweeper());

        let dispatcher = SpeedDispatcher::new(
            PolicyTier::new(config.policy_rules.clone()),
            Arc::new(FeatureClassifier::default()),
            Arc::clone(&coordinator),
            log.clone(),
            Self::speed_layer_identity(),
            DispatchConfig {
                experts: config.experts.iter().map(|e| AgentId::from(e.as_str())).collect(),
                ..DispatchConfig::default()
            },
        );
        tasks.push(dispatcher.spawn_invalidation_listener());

        // Live pumps keep every projection at the committed tail.
        tasks.push(spawn_projection_pump(&hub, &log, Arc::clone(&agents), Arc::clone(&controller)));
        tasks.push(spawn_projection_pump(
            &hub,
            &log,
            Arc::clone(&elicitations),
            Arc::clone(&controller),
        ));
        tasks.push(spawn_projection_pump(
            &hub,
            &log,
            Arc::clone(&system_state),
            Arc::clone(&controller),
        ));

        info!(state = %controller.state(), "bridge node started");
        Ok(Self { log, hub, authority, coordinator, dispatcher, controller, tasks })
    }

    /// Identity the dispatcher escalates under. Internal: never minted as a
    /// bearer token.
    fn speed_layer_identity() -> AuthContext {
        AuthContext {
            agent: AgentId::from("speed-layer"),
            capabilities: CapabilitySet::parse(&["elicitation.create:all".to_string()])
                .expect("static scope parses"),
            token_fingerprint: Fingerprint::of_bytes(b"speed-layer-internal"),
        }
    }

    /// Register an agent and mint its first token. The registration and the
    /// token fingerprint land on the log; the raw token is returned to the
    /// caller and never stored.
    pub async fn register_agent(
        &self,
        agent: &AgentId,
        capabilities: Vec<String>,
        ttl_secs: u64,
    ) -> Result<String> {
        // Reject malformed scopes before anything reaches the log.
        CapabilitySet::parse(&capabilities)?;
        let issued = self.authority.tokens().issue(agent, capabilities.clone(), ttl_secs)?;
        let system = AgentId::from("system");
        let (_, last) = self
            .log
            .append(vec![
                EventDraft::new(
                    agent.stream(),
                    EventPayload::AgentRegistered(bridge_types::AgentRegistered {
                        agent: agent.clone(),
                        capabilities: capabilities.clone(),
                    }),
                    system.clone(),
                ),
                EventDraft::new(
                    agent.stream(),
                    EventPayload::TokenIssued(bridge_types::TokenIssued {
                        agent: agent.clone(),
                        token_fingerprint: issued.fingerprint,
                        capabilities,
                        expires_at: issued.expires_at(),
                    }),
                    system,
                ),
            ])
            .await?;
        self.authority
            .agents()
            .await_applied(last, std::time::Duration::from_secs(5))
            .await?;
        Ok(issued.token)
    }

    /// Gateway state over this node's components.
    pub fn gateway_state(&self) -> Arc<GatewayState> {
        Arc::new(GatewayState {
            authority: Arc::clone(&self.authority),
            log: self.log.clone(),
            hub: self.hub.clone(),
            coordinator: Arc::clone(&self.coordinator),
            dispatcher: Arc::clone(&self.dispatcher),
            controller: Arc::clone(&self.controller),
        })
    }

    /// Serve the gateway until shutdown.
    pub async fn serve(&self, bind: &str) -> Result<()> {
        bridge_gateway::serve(self.gateway_state(), bind).await?;
        Ok(())
    }

    /// The event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// The subscription hub.
    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    /// The session authority.
    pub fn authority(&self) -> &Arc<SessionAuthority> {
        &self.authority
    }

    /// The elicitation coordinator.
    pub fn coordinator(&self) -> &Arc<ElicitationCoordinator> {
        &self.coordinator
    }

    /// The speed-layer dispatcher.
    pub fn dispatcher(&self) -> &Arc<SpeedDispatcher> {
        &self.dispatcher
    }

    /// The degradation controller.
    pub fn controller(&self) -> &Arc<DegradationController> {
        &self.controller
    }

    /// Stop background tasks and drain the writer.
    pub async fn shutdown(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.log.close().await?;
        info!("bridge node stopped");
        Ok(())
    }
}

/// Feed one projection from the hub, resuming through parks, recording
/// `SnapshotTaken` events, and promoting fold failures to EMERGENCY.
fn spawn_projection_pump<P: Projection>(
    hub: &SubscriptionHub,
    log: &EventLog,
    engine: Arc<ProjectionEngine<P>>,
    controller: Arc<DegradationController>,
) -> JoinHandle<()> {
    let hub = hub.clone();
    let log = log.clone();
    tokio::spawn(async move {
        let mut sub = match hub.resume(engine.interest(), engine.last_applied().await).await {
            Ok(sub) => sub,
            Err(e) => {
                error!(projection = engine.name(), error = %e, "pump could not subscribe");
                return;
            }
        };
        loop {
            match sub.next().await {
                Some(Delivery::Event(event)) => match engine.apply_live(&event).await {
                    Ok(Some(snapshot)) => {
                        let draft = EventDraft::new(
                            StreamId::system(),
                            EventPayload::SnapshotTaken(SnapshotTaken {
                                projection: snapshot.projection,
                                up_to: snapshot.up_to,
                                integrity: snapshot.integrity,
                            }),
                            AgentId::from("system"),
                        );
                        if let Err(e) = log.append_one(draft).await {
                            warn!(error = %e, "failed to record snapshot event");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // A projection that cannot fold a selected event is
                        // an integrity failure, never something to skip.
                        error!(projection = engine.name(), error = %e, "projection fold failed");
                        let _ = controller
                            .report_failure(&format!("projection {} fold failed", engine.name()))
                            .await;
                        return;
                    }
                },
                Some(Delivery::Lagged { resume_from }) => {
                    match hub.resume(engine.interest(), resume_from).await {
                        Ok(resumed) => sub = resumed,
                        Err(e) => {
                            error!(projection = engine.name(), error = %e, "pump resume failed");
                            return;
                        }
                    }
                }
                None => return,
            }
        }
    })
}

/// Initialize tracing for a node binary. Library code never does this.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
