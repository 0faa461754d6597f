//! The session authority: the single gate every request passes through.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use bridge_store::ProjectionEngine;
use bridge_types::{AgentId, BridgeError, BridgeResult, Fingerprint};

use crate::agents::AgentsProjection;
use crate::nonce::NonceStore;
use crate::rate::{OpClass, RateLimiter, RateLimits};
use crate::scope::{CapabilitySet, ScopeBase, ScopeTarget};
use crate::token::{Claims, TokenAuthority};

/// The authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The authenticated agent.
    pub agent: AgentId,
    /// Capabilities carried by the presented token.
    pub capabilities: CapabilitySet,
    /// Fingerprint of the presented token.
    pub token_fingerprint: Fingerprint,
}

/// Identity, capability, and rate gate applied to every operation.
///
/// Token issuance and revocation live on the log; validation combines the
/// cryptographic check (signature, expiry) with a lookup against the
/// `agents` projection, so a revocation event takes effect as soon as the
/// projection folds it.
pub struct SessionAuthority {
    tokens: TokenAuthority,
    agents: Arc<ProjectionEngine<AgentsProjection>>,
    limiter: RateLimiter,
    nonces: NonceStore,
}

impl SessionAuthority {
    /// Build the authority around a token secret and the agents projection.
    pub fn new(
        tokens: TokenAuthority,
        agents: Arc<ProjectionEngine<AgentsProjection>>,
        limits: RateLimits,
        nonce_retention_secs: u64,
    ) -> Self {
        Self {
            tokens,
            agents,
            limiter: RateLimiter::new(limits),
            nonces: NonceStore::new(nonce_retention_secs, 100_000),
        }
    }

    /// Authenticate a bearer token: cryptographic validity plus projection
    /// state (agent active, fingerprint issued, not revoked).
    pub async fn authenticate(&self, bearer: &str) -> BridgeResult<AuthContext> {
        let claims: Claims = self.tokens.validate(bearer)?;
        let agent = AgentId::new(claims.sub.clone())
            .map_err(|_| BridgeError::Unauthenticated("malformed subject".into()))?;
        let fingerprint = TokenAuthority::fingerprint(bearer);

        let now = Utc::now();
        let token_caps = self
            .agents
            .read(|state| {
                if !state.is_active(&agent) {
                    return None;
                }
                state
                    .live_token(&agent, &fingerprint, now)
                    .map(|t| t.capabilities.clone())
            })
            .await
            .ok_or_else(|| {
                debug!(agent = %agent, "token not live in agents projection");
                BridgeError::Unauthenticated("token not recognized".into())
            })?;

        // The log is authoritative for what the token may do; the embedded
        // claims only have to agree on identity.
        let capabilities = CapabilitySet::parse(&token_caps)?;
        Ok(AuthContext { agent, capabilities, token_fingerprint: fingerprint })
    }

    /// Require `base` against `target`, or fail with `Forbidden`.
    pub fn authorize(
        &self,
        ctx: &AuthContext,
        base: ScopeBase,
        target: &ScopeTarget<'_>,
    ) -> BridgeResult<()> {
        if ctx.capabilities.allows(base, target) {
            Ok(())
        } else {
            Err(BridgeError::Forbidden(format!(
                "agent {} lacks {}",
                ctx.agent,
                base.as_str()
            )))
        }
    }

    /// Charge the caller's bucket for one operation of `class`.
    pub fn charge(&self, agent: &AgentId, class: OpClass) -> BridgeResult<()> {
        self.limiter.charge(agent, class)
    }

    /// Whether a rate violation should be recorded on the log right now.
    pub fn sample_violation(&self, agent: &AgentId, class: OpClass) -> bool {
        self.limiter.sample_violation(agent, class)
    }

    /// The replay-protection nonce store.
    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    /// The token minting half, for the registration surface.
    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    /// The agents projection, for read surfaces.
    pub fn agents(&self) -> &Arc<ProjectionEngine<AgentsProjection>> {
        &self.agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_store::{
        EventLog, LogConfig, MemoryBackend, SnapshotPolicy, SnapshotStore,
    };
    use bridge_types::{
        AgentRegistered, EventDraft, EventPayload, StreamId, TokenIssued, TokenRevoked,
    };

    async fn bootstrapped() -> (EventLog, SessionAuthority, String) {
        let log = EventLog::start(Arc::new(MemoryBackend::new()), LogConfig::default())
            .await
            .unwrap();
        let tokens = TokenAuthority::new(b"secret");
        let agents = ProjectionEngine::new(
            AgentsProjection,
            SnapshotStore::disabled(),
            SnapshotPolicy::default(),
        );

        let alpha = AgentId::from("alpha");
        let caps = vec!["events.read:own".to_string(), "elicitation.respond".to_string()];
        let issued = tokens.issue(&alpha, caps.clone(), 3600).unwrap();

        let system = AgentId::from("system");
        log.append(vec![
            EventDraft::new(
                StreamId::agent("alpha"),
                EventPayload::AgentRegistered(AgentRegistered {
                    agent: alpha.clone(),
                    capabilities: caps.clone(),
                }),
                system.clone(),
            ),
            EventDraft::new(
                StreamId::agent("alpha"),
                EventPayload::TokenIssued(TokenIssued {
                    agent: alpha.clone(),
                    token_fingerprint: issued.fingerprint,
                    capabilities: caps,
                    expires_at: issued.expires_at(),
                }),
                system,
            ),
        ])
        .await
        .unwrap();
        agents.rebuild(&log).await.unwrap();

        let authority =
            SessionAuthority::new(tokens, agents, RateLimits::default(), 600);
        (log, authority, issued.token)
    }

    #[tokio::test]
    async fn authenticate_happy_path() {
        let (_log, authority, token) = bootstrapped().await;
        let ctx = authority.authenticate(&token).await.unwrap();
        assert_eq!(ctx.agent, AgentId::from("alpha"));
        authority
            .authorize(&ctx, ScopeBase::ElicitationRespond, &ScopeTarget {
                agent: &ctx.agent,
                stream: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let (_log, authority, _token) = bootstrapped().await;
        // Cryptographically valid but never recorded on the log.
        let stray = authority
            .tokens()
            .issue(&AgentId::from("alpha"), vec![], 3600)
            .unwrap();
        let err = authority.authenticate(&stray.token).await.unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
    }

    #[tokio::test]
    async fn revocation_takes_effect_through_the_projection() {
        let (log, authority, token) = bootstrapped().await;
        authority.authenticate(&token).await.unwrap();

        let fp = TokenAuthority::fingerprint(&token);
        let id = log
            .append_one(EventDraft::new(
                StreamId::agent("alpha"),
                EventPayload::TokenRevoked(TokenRevoked {
                    agent: AgentId::from("alpha"),
                    token_fingerprint: fp,
                    reason: "compromised".into(),
                }),
                AgentId::from("system"),
            ))
            .await
            .unwrap();
        authority.agents().rebuild(&log).await.unwrap();
        authority
            .agents()
            .await_applied(id, std::time::Duration::from_secs(1))
            .await
            .unwrap();

        let err = authority.authenticate(&token).await.unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
    }

    #[tokio::test]
    async fn missing_capability_is_forbidden() {
        let (_log, authority, token) = bootstrapped().await;
        let ctx = authority.authenticate(&token).await.unwrap();
        let err = authority
            .authorize(&ctx, ScopeBase::AdminDegrade, &ScopeTarget {
                agent: &ctx.agent,
                stream: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }
}
