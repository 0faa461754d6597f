//! The tiered dispatcher: memory → policy → pattern → expert, default-deny.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bridge_auth::AuthContext;
use bridge_elicitation::ElicitationCoordinator;
use bridge_store::EventLog;
use bridge_types::{
    AgentId, BridgeResult, DecidedBy, EventDraft, EventPayload, Fingerprint, ResponseType,
    RiskLevel, StreamId, TierTrace, ValidationDecided, ValidationRequested, Verdict,
};
use uuid::Uuid;

use crate::memory::MemoryTier;
use crate::pattern::PatternClassifier;
use crate::policy::{PolicyEffect, PolicyTier};
use crate::request::{Decision, ValidationRequest};

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Minimum pattern-tier confidence to accept its answer.
    pub confidence_threshold: f64,
    /// Memory tier capacity.
    pub cache_capacity: usize,
    /// Memory tier TTL; stale entries are lazily refreshed.
    pub cache_ttl: Duration,
    /// Deadline for an expert to answer an escalation.
    pub escalation_timeout: Duration,
    /// Expert agents escalations rotate through.
    pub experts: Vec<AgentId>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.9,
            cache_capacity: 4096,
            cache_ttl: Duration::from_secs(300),
            escalation_timeout: Duration::from_secs(30),
            experts: Vec::new(),
        }
    }
}

/// The speed-layer dispatcher.
///
/// Tiers are consulted in order and any tier failure falls through to the
/// next; exhausting every tier yields `denied` with reason `unavailable`,
/// never an approval. Identical in-flight fingerprints are coalesced onto
/// one evaluation.
pub struct SpeedDispatcher {
    memory: MemoryTier,
    policy: PolicyTier,
    pattern: Arc<dyn PatternClassifier>,
    coordinator: Arc<ElicitationCoordinator>,
    log: EventLog,
    /// Identity the dispatcher escalates as; holds `elicitation.create`.
    system_ctx: AuthContext,
    inflight: DashMap<Fingerprint, watch::Receiver<Option<Decision>>>,
    next_expert: AtomicUsize,
    upstream_evaluations: AtomicU64,
    config: DispatchConfig,
}

impl SpeedDispatcher {
    /// Assemble the dispatcher.
    pub fn new(
        policy: PolicyTier,
        pattern: Arc<dyn PatternClassifier>,
        coordinator: Arc<ElicitationCoordinator>,
        log: EventLog,
        system_ctx: AuthContext,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory: MemoryTier::new(config.cache_capacity, config.cache_ttl),
            policy,
            pattern,
            coordinator,
            log,
            system_ctx,
            inflight: DashMap::new(),
            next_expert: AtomicUsize::new(0),
            upstream_evaluations: AtomicU64::new(0),
            config,
        })
    }

    /// Validate one request, returning the decision once some tier (or the
    /// default-deny backstop) produces one.
    pub async fn check(&self, req: ValidationRequest) -> BridgeResult<Decision> {
        let fp = req.fingerprint()?;
        loop {
            // Coalesce identical fingerprints onto one evaluation. The
            // shard guard must not be held across an await.
            enum Role {
                Leader(watch::Sender<Option<Decision>>),
                Follower(watch::Receiver<Option<Decision>>),
            }
            let role = match self.inflight.entry(fp) {
                dashmap::mapref::entry::Entry::Occupied(e) => Role::Follower(e.get().clone()),
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    let (tx, rx) = watch::channel(None);
                    v.insert(rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    let result = self.evaluate(&req, fp).await;
                    self.inflight.remove(&fp);
                    if let Ok(decision) = &result {
                        let _ = tx.send(Some(decision.clone()));
                    }
                    // On error the sender drops, waking followers to retry.
                    return result;
                }
                Role::Follower(mut rx) => {
                    loop {
                        if let Some(decision) = rx.borrow().clone() {
                            return Ok(decision);
                        }
                        if rx.changed().await.is_err() {
                            // Leader failed without a result; take over.
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Memory tier hit/miss counters.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.memory.stats()
    }

    /// Number of non-coalesced evaluations performed.
    pub fn upstream_evaluations(&self) -> u64 {
        self.upstream_evaluations.load(Ordering::Relaxed)
    }

    /// The policy tier, for rule-set management.
    pub fn policy(&self) -> &PolicyTier {
        &self.policy
    }

    //───────────────────── evaluation ─────────────────────

    async fn evaluate(&self, req: &ValidationRequest, fp: Fingerprint) -> BridgeResult<Decision> {
        self.upstream_evaluations.fetch_add(1, Ordering::Relaxed);
        let mut trace: Vec<TierTrace> = Vec::new();

        // Tier 1: memory.
        let t = Instant::now();
        if let Some(mut cached) = self.memory.get(&fp) {
            trace.push(tier(DecidedBy::Memory, "hit", t));
            cached.decided_by = DecidedBy::Memory;
            cached.trace = trace;
            self.emit(req, fp, &cached).await;
            return Ok(cached);
        }
        trace.push(tier(DecidedBy::Memory, "miss", t));

        // Tier 2: policy.
        let t = Instant::now();
        let mut force_escalation = false;
        match self.policy.evaluate(req).await {
            Some(m) if m.effect == PolicyEffect::Escalate => {
                trace.push(tier(DecidedBy::Policy, &format!("rule {} escalates", m.rule), t));
                force_escalation = true;
            }
            Some(m) => {
                trace.push(tier(DecidedBy::Policy, &format!("matched rule {}", m.rule), t));
                let decision = Decision {
                    verdict: match m.effect {
                        PolicyEffect::Allow => Verdict::Approved,
                        _ => Verdict::Denied,
                    },
                    risk: m.risk,
                    reasoning: m.reason,
                    decided_by: DecidedBy::Policy,
                    trace,
                };
                self.memory.insert(fp, &req.tool, decision.clone());
                self.emit(req, fp, &decision).await;
                return Ok(decision);
            }
            None => trace.push(tier(DecidedBy::Policy, "no rule matched", t)),
        }

        // Tier 3: pattern, unless a policy rule forced escalation.
        if !force_escalation {
            let t = Instant::now();
            match self.pattern.classify(req).await {
                Ok(score) if score.confidence >= self.config.confidence_threshold => {
                    trace.push(tier(
                        DecidedBy::Pattern,
                        &format!("confidence {:.2}", score.confidence),
                        t,
                    ));
                    let decision = Decision {
                        verdict: score.verdict,
                        risk: score.risk,
                        reasoning: score.reasoning,
                        decided_by: DecidedBy::Pattern,
                        trace,
                    };
                    self.memory.insert(fp, &req.tool, decision.clone());
                    self.emit(req, fp, &decision).await;
                    return Ok(decision);
                }
                Ok(score) => trace.push(tier(
                    DecidedBy::Pattern,
                    &format!("confidence {:.2} below threshold", score.confidence),
                    t,
                )),
                Err(e) => {
                    // Tier failure falls through, never decides.
                    warn!(error = %e, "pattern tier failed");
                    trace.push(tier(DecidedBy::Pattern, &format!("error: {e}"), t));
                }
            }
        }

        // Tier 4: expert escalation, with the default-deny backstop.
        let t = Instant::now();
        let decision = match self.escalate(req, &mut trace).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "escalation unavailable; default deny");
                trace.push(tier(DecidedBy::Expert, &format!("error: {e}"), t));
                Decision {
                    verdict: Verdict::Denied,
                    risk: RiskLevel::High,
                    reasoning: "unavailable".into(),
                    decided_by: DecidedBy::Expert,
                    trace: std::mem::take(&mut trace),
                }
            }
        };
        if !is_backstop_denial(&decision) {
            self.memory.insert(fp, &req.tool, decision.clone());
        }
        self.emit(req, fp, &decision).await;
        Ok(decision)
    }

    async fn escalate(
        &self,
        req: &ValidationRequest,
        trace: &mut Vec<TierTrace>,
    ) -> BridgeResult<Decision> {
        let t = Instant::now();
        let expert = self.pick_expert()?;

        // Subscribe before creating so the terminal event cannot slip past.
        let mut commits = self.log.subscribe_commits();
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "approved": {"type": "boolean"},
                "risk": {"type": "string"},
                "reasoning": {"type": "string"}
            },
            "required": ["approved"]
        });
        let message = serde_json::json!({
            "tool": req.tool,
            "args": req.args,
            "agent": req.agent,
        })
        .to_string();
        let created = self
            .coordinator
            .create(
                &self.system_ctx,
                expert.clone(),
                message,
                schema,
                Some(self.config.escalation_timeout),
            )
            .await?;
        debug!(elicitation = %created.id, expert = %expert, "escalated to expert");

        let deadline = tokio::time::Instant::now()
            + self.config.escalation_timeout
            + Duration::from_secs(1);
        loop {
            tokio::select! {
                batch = commits.recv() => match batch {
                    Ok(batch) => {
                        for event in batch.iter() {
                            if let Some(d) = self.interpret_terminal(event, created.id, expert.clone(), trace, t) {
                                return Ok(d);
                            }
                        }
                    }
                    Err(_) => {
                        // Missed commits; fall back to the projection.
                        if let Some(view) = self.coordinator.get(created.id).await {
                            if let Some((response_type, payload, _)) = view.response {
                                return Ok(self.decision_from_response(
                                    response_type, &payload, trace, t,
                                ));
                            }
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    trace.push(tier(DecidedBy::Expert, "expert_timeout", t));
                    return Ok(Decision {
                        verdict: Verdict::Denied,
                        risk: RiskLevel::High,
                        reasoning: "expert_timeout".into(),
                        decided_by: DecidedBy::Expert,
                        trace: std::mem::take(trace),
                    });
                }
            }
        }
    }

    fn interpret_terminal(
        &self,
        event: &bridge_types::Event,
        id: Uuid,
        expert: AgentId,
        trace: &mut Vec<TierTrace>,
        started: Instant,
    ) -> Option<Decision> {
        match &event.payload {
            EventPayload::ElicitationResponded(p) if p.id == id => {
                debug!(elicitation = %id, expert = %expert, "expert responded");
                Some(self.decision_from_response(p.response_type, &p.payload, trace, started))
            }
            EventPayload::ElicitationExpired(p) if p.id == id => {
                trace.push(tier(DecidedBy::Expert, "expert_timeout", started));
                Some(Decision {
                    verdict: Verdict::Denied,
                    risk: RiskLevel::High,
                    reasoning: "expert_timeout".into(),
                    decided_by: DecidedBy::Expert,
                    trace: std::mem::take(trace),
                })
            }
            _ => None,
        }
    }

    fn decision_from_response(
        &self,
        response_type: ResponseType,
        payload: &serde_json::Value,
        trace: &mut Vec<TierTrace>,
        started: Instant,
    ) -> Decision {
        match response_type {
            ResponseType::Accept => {
                let approved = payload.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
                let risk = payload
                    .get("risk")
                    .and_then(|v| v.as_str())
                    .map(parse_risk)
                    .unwrap_or(RiskLevel::Medium);
                let reasoning = payload
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or("expert judgment")
                    .to_string();
                trace.push(tier(
                    DecidedBy::Expert,
                    if approved { "expert approved" } else { "expert denied" },
                    started,
                ));
                Decision {
                    verdict: if approved { Verdict::Approved } else { Verdict::Denied },
                    risk,
                    reasoning,
                    decided_by: DecidedBy::Expert,
                    trace: std::mem::take(trace),
                }
            }
            ResponseType::Decline | ResponseType::Cancel => {
                trace.push(tier(DecidedBy::Expert, "expert declined", started));
                Decision {
                    verdict: Verdict::Denied,
                    risk: RiskLevel::High,
                    reasoning: "expert_declined".into(),
                    decided_by: DecidedBy::Expert,
                    trace: std::mem::take(trace),
                }
            }
        }
    }

    fn pick_expert(&self) -> BridgeResult<AgentId> {
        if self.config.experts.is_empty() {
            return Err(bridge_types::BridgeError::Internal("no experts configured".into()));
        }
        let i = self.next_expert.fetch_add(1, Ordering::Relaxed) % self.config.experts.len();
        Ok(self.config.experts[i].clone())
    }

    /// Append the `ValidationRequested` + `ValidationDecided` pair for one
    /// decision. Failures are logged; the caller still gets its answer.
    async fn emit(&self, req: &ValidationRequest, fp: Fingerprint, decision: &Decision) {
        let correlation = Uuid::new_v4();
        let stream = StreamId::validation(fp.to_hex());
        let batch = vec![
            EventDraft::new(
                stream.clone(),
                EventPayload::ValidationRequested(ValidationRequested {
                    fingerprint: fp,
                    tool: req.tool.clone(),
                    args: req.args.clone(),
                    agent: req.agent.clone(),
                }),
                req.agent.clone(),
            )
            .with_correlation(correlation),
            EventDraft::new(
                stream,
                EventPayload::ValidationDecided(ValidationDecided {
                    fingerprint: fp,
                    verdict: decision.verdict,
                    risk: decision.risk,
                    reasoning: decision.reasoning.clone(),
                    decided_by: decision.decided_by,
                    trace: decision.trace.clone(),
                }),
                req.agent.clone(),
            )
            .with_correlation(correlation),
        ];
        if let Err(e) = self.log.append(batch).await {
            warn!(error = %e, "failed to record validation decision");
        }
    }

    //───────────────────── cache coherency ─────────────────────

    /// Watch the log for invalidation events and drop matching cache
    /// entries.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut commits = dispatcher.log.subscribe_commits();
            loop {
                match commits.recv().await {
                    Ok(batch) => {
                        for event in batch.iter() {
                            dispatcher.apply_invalidation(event);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Missed invalidations cannot be reconstructed
                        // cheaply; drop everything.
                        info!("invalidation listener lagged; flushing memory tier");
                        dispatcher.memory.clear();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn apply_invalidation(&self, event: &bridge_types::Event) {
        match &event.payload {
            EventPayload::PolicyUpdated(p) => {
                debug!(policy = %p.policy_id, revision = p.revision, "invalidating by policy update");
                self.memory.invalidate_tools(&p.tools);
            }
            EventPayload::CacheInvalidated(p) => {
                self.memory.invalidate(&p.fingerprints);
            }
            EventPayload::TokenRevoked(_) | EventPayload::AgentRevoked(_) => {
                // Fingerprints do not key by agent, so a revocation flushes
                // conservatively.
                self.memory.clear();
            }
            _ => {}
        }
    }
}

/// Backstop denials say nothing about the request itself, only that no
/// authoritative answer arrived in time. Caching one would deny the exact
/// tool and arguments for every agent until the TTL lapses.
fn is_backstop_denial(decision: &Decision) -> bool {
    decision.verdict == Verdict::Denied
        && matches!(
            decision.reasoning.as_str(),
            "unavailable" | "expert_timeout" | "expert_declined"
        )
}

fn tier(t: DecidedBy, outcome: &str, started: Instant) -> TierTrace {
    TierTrace {
        tier: t,
        outcome: outcome.to_string(),
        elapsed_us: started.elapsed().as_micros() as u64,
    }
}

fn parse_risk(s: &str) -> RiskLevel {
    match s {
        "low" => RiskLevel::Low,
        "medium" => RiskLevel::Medium,
        "high" => RiskLevel::High,
        "critical" => RiskLevel::Critical,
        _ => RiskLevel::Medium,
    }
}
