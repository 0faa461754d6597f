//! The `agents` projection: sessions, tokens, and capabilities, folded from
//! the log.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bridge_store::Projection;
use bridge_types::{
    AgentId, BridgeError, BridgeResult, Event, EventFilter, EventKind, EventPayload, Fingerprint,
};

/// One issued token as the log records it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Scopes granted to the token at issuance.
    pub capabilities: Vec<String>,
    /// Expiry recorded at issuance.
    pub expires_at: DateTime<Utc>,
    /// Whether a `TokenRevoked` event has landed for it.
    pub revoked: bool,
}

/// Current view of one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Scopes granted at registration plus later grants.
    pub capabilities: BTreeSet<String>,
    /// Whether the agent has been revoked.
    pub revoked: bool,
    /// Issued tokens keyed by fingerprint hex.
    pub tokens: BTreeMap<String, TokenRecord>,
}

/// Full projection state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsState {
    /// All agents ever registered.
    pub agents: BTreeMap<AgentId, AgentRecord>,
}

impl AgentsState {
    /// Whether `agent` is registered and not revoked.
    pub fn is_active(&self, agent: &AgentId) -> bool {
        self.agents.get(agent).map(|r| !r.revoked).unwrap_or(false)
    }

    /// Look up a live token record: known fingerprint, not revoked, not past
    /// its recorded expiry.
    pub fn live_token(
        &self,
        agent: &AgentId,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Option<&TokenRecord> {
        self.agents
            .get(agent)
            .filter(|r| !r.revoked)?
            .tokens
            .get(&fingerprint.to_hex())
            .filter(|t| !t.revoked && t.expires_at > now)
    }
}

/// Projection over agent/session lifecycle events.
#[derive(Debug, Default, Clone)]
pub struct AgentsProjection;

impl Projection for AgentsProjection {
    type State = AgentsState;

    fn name(&self) -> &'static str {
        "agents"
    }

    fn interest(&self) -> EventFilter {
        EventFilter::kinds([
            EventKind::AgentRegistered,
            EventKind::AgentRevoked,
            EventKind::TokenIssued,
            EventKind::TokenRevoked,
            EventKind::CapabilityGranted,
        ])
    }

    fn apply(&self, state: &mut Self::State, event: &Event) -> BridgeResult<()> {
        match &event.payload {
            EventPayload::AgentRegistered(p) => {
                let record = state.agents.entry(p.agent.clone()).or_default();
                record.revoked = false;
                record.capabilities.extend(p.capabilities.iter().cloned());
            }
            EventPayload::AgentRevoked(p) => {
                state.agents.entry(p.agent.clone()).or_default().revoked = true;
            }
            EventPayload::TokenIssued(p) => {
                state.agents.entry(p.agent.clone()).or_default().tokens.insert(
                    p.token_fingerprint.to_hex(),
                    TokenRecord {
                        capabilities: p.capabilities.clone(),
                        expires_at: p.expires_at,
                        revoked: false,
                    },
                );
            }
            EventPayload::TokenRevoked(p) => {
                if let Some(record) = state.agents.get_mut(&p.agent) {
                    if let Some(token) = record.tokens.get_mut(&p.token_fingerprint.to_hex()) {
                        token.revoked = true;
                    }
                }
            }
            EventPayload::CapabilityGranted(p) => {
                state
                    .agents
                    .entry(p.agent.clone())
                    .or_default()
                    .capabilities
                    .insert(p.scope.clone());
            }
            other => {
                return Err(BridgeError::IntegrityBreak(format!(
                    "agents projection cannot fold {}",
                    other.kind()
                )))
            }
        }
        Ok(())
    }
}
