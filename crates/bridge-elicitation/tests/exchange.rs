//! End-to-end elicitation exchange scenarios.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use bridge_auth::{
    AgentsProjection, AuthContext, RateLimits, SessionAuthority, TokenAuthority,
};
use bridge_elicitation::{
    ElicitationConfig, ElicitationCoordinator, ElicitationStatus, ElicitationsProjection,
    ResponseKey,
};
use bridge_store::{
    EventLog, LogConfig, MemoryBackend, ProjectionEngine, SnapshotPolicy, SnapshotStore,
};
use bridge_types::{
    AgentId, AgentRegistered, EventDraft, EventFilter, EventId, EventKind, EventPayload,
    ResponseType, SecurityEventKind, SystemState, TokenIssued,
};

struct Harness {
    log: EventLog,
    coordinator: Arc<ElicitationCoordinator>,
    authority: Arc<SessionAuthority>,
    tokens: std::collections::HashMap<&'static str, String>,
    state_tx: watch::Sender<SystemState>,
}

impl Harness {
    async fn ctx(&self, agent: &'static str) -> AuthContext {
        self.authority.authenticate(&self.tokens[agent]).await.unwrap()
    }

    async fn count_kind(&self, kind: EventKind) -> usize {
        self.log
            .read(EventId::ZERO, 10_000, &EventFilter::kinds([kind]))
            .await
            .unwrap()
            .len()
    }
}

/// Register agents, mint tokens, start projections with a live pump.
async fn harness() -> Harness {
    let log = EventLog::start(Arc::new(MemoryBackend::new()), LogConfig::default())
        .await
        .unwrap();
    let token_authority = TokenAuthority::new(b"test-secret");
    let agents = ProjectionEngine::new(
        AgentsProjection,
        SnapshotStore::disabled(),
        SnapshotPolicy::default(),
    );
    let elicitations = ProjectionEngine::new(
        ElicitationsProjection,
        SnapshotStore::disabled(),
        SnapshotPolicy::default(),
    );

    // Pump committed events into both projections the way the runtime does.
    let mut commits = log.subscribe_commits();
    let agents_pump = Arc::clone(&agents);
    let elic_pump = Arc::clone(&elicitations);
    tokio::spawn(async move {
        while let Ok(batch) = commits.recv().await {
            for event in batch.iter() {
                agents_pump.apply_live(event).await.unwrap();
                elic_pump.apply_live(event).await.unwrap();
            }
        }
    });

    let mut tokens = std::collections::HashMap::new();
    let system = AgentId::from("system");
    for (name, caps) in [
        ("alice", vec!["elicitation.create".to_string(), "events.read:own".to_string()]),
        ("bob", vec!["elicitation.respond".to_string()]),
        ("mallory", vec!["elicitation.respond".to_string()]),
    ] {
        let agent = AgentId::from(name);
        let issued = token_authority.issue(&agent, caps.clone(), 3600).unwrap();
        log.append(vec![
            EventDraft::new(
                agent.stream(),
                EventPayload::AgentRegistered(AgentRegistered {
                    agent: agent.clone(),
                    capabilities: caps.clone(),
                }),
                system.clone(),
            ),
            EventDraft::new(
                agent.stream(),
                EventPayload::TokenIssued(TokenIssued {
                    agent: agent.clone(),
                    token_fingerprint: issued.fingerprint,
                    capabilities: caps,
                    expires_at: issued.expires_at(),
                }),
                system.clone(),
            ),
        ])
        .await
        .unwrap();
        tokens.insert(name, issued.token);
    }
    agents.await_applied(log.latest_id(), Duration::from_secs(1)).await.unwrap();

    let authority = Arc::new(SessionAuthority::new(
        token_authority,
        agents,
        RateLimits::default(),
        600,
    ));
    let (state_tx, state_rx) = watch::channel(SystemState::Normal);
    let coordinator = ElicitationCoordinator::new(
        log.clone(),
        elicitations,
        Arc::clone(&authority),
        [9u8; 32],
        state_rx,
        ElicitationConfig::default(),
    );

    Harness { log, coordinator, authority, tokens, state_tx }
}

fn accept_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {"accepted": {"type": "boolean"}},
        "required": ["accepted"],
        "additionalProperties": false
    })
}

#[tokio::test]
async fn happy_path_appends_exactly_two_events() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;

    let created = h
        .coordinator
        .create(
            &alice,
            AgentId::from("bob"),
            "approve this refactor".into(),
            accept_schema(),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    // Bob sees it pending, derives his key, and responds accept.
    let pending = h.coordinator.pending_for(&AgentId::from("bob")).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, created.id);

    let key_hex = h.coordinator.derive_key(&bob, created.id).await.unwrap();
    let key = ResponseKey::from_hex(&key_hex).unwrap();
    let payload = serde_json::json!({"accepted": true});
    let sig = key
        .sign(created.id, &AgentId::from("bob"), ResponseType::Accept, &payload)
        .unwrap();
    h.coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, &sig)
        .await
        .unwrap();

    let view = h.coordinator.get(created.id).await.unwrap();
    assert_eq!(view.status, ElicitationStatus::Responded);
    assert_eq!(view.response.as_ref().unwrap().0, ResponseType::Accept);

    // The whole exchange is exactly two events on the elicitation stream.
    let stream_events = h
        .log
        .read(
            EventId::ZERO,
            100,
            &EventFilter::stream(format!("elicitation:{}", created.id)),
        )
        .await
        .unwrap();
    assert_eq!(stream_events.len(), 2);
}

#[tokio::test]
async fn impersonation_is_rejected_and_recorded() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;
    let mallory = h.ctx("mallory").await;

    let created = h
        .coordinator
        .create(&alice, AgentId::from("bob"), "review".into(), accept_schema(), None)
        .await
        .unwrap();

    // Mallory cannot derive the key, so she forges a signature.
    assert_eq!(
        h.coordinator.derive_key(&mallory, created.id).await.unwrap_err().code(),
        "forbidden"
    );
    let payload = serde_json::json!({"accepted": true});
    let err = h
        .coordinator
        .respond(&mallory, created.id, ResponseType::Accept, payload.clone(), "deadbeef")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");

    assert_eq!(h.count_kind(EventKind::ElicitationResponded).await, 0);
    assert!(h.count_kind(EventKind::SecurityEvent).await >= 1);

    // Bob can still respond validly afterwards.
    let key = ResponseKey::from_hex(&h.coordinator.derive_key(&bob, created.id).await.unwrap())
        .unwrap();
    let sig = key
        .sign(created.id, &AgentId::from("bob"), ResponseType::Accept, &payload)
        .unwrap();
    h.coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, &sig)
        .await
        .unwrap();
    assert_eq!(h.count_kind(EventKind::ElicitationResponded).await, 1);
}

#[tokio::test]
async fn replayed_response_is_rejected() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;

    let created = h
        .coordinator
        .create(&alice, AgentId::from("bob"), "review".into(), accept_schema(), None)
        .await
        .unwrap();
    let key = ResponseKey::from_hex(&h.coordinator.derive_key(&bob, created.id).await.unwrap())
        .unwrap();
    let payload = serde_json::json!({"accepted": true});
    let sig = key
        .sign(created.id, &AgentId::from("bob"), ResponseType::Accept, &payload)
        .unwrap();

    h.coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload.clone(), &sig)
        .await
        .unwrap();
    // The identical response again: terminal state is reported first.
    let err = h
        .coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, &sig)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "terminal");

    assert_eq!(h.count_kind(EventKind::ElicitationResponded).await, 1);
}

#[tokio::test]
async fn wrong_signature_trips_security_event() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;

    let created = h
        .coordinator
        .create(&alice, AgentId::from("bob"), "review".into(), accept_schema(), None)
        .await
        .unwrap();
    let payload = serde_json::json!({"accepted": true});
    let err = h
        .coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, "00ff00ff")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");

    let security = h
        .log
        .read(EventId::ZERO, 100, &EventFilter::kinds([EventKind::SecurityEvent]))
        .await
        .unwrap();
    assert!(security.iter().any(|e| matches!(
        &e.payload,
        EventPayload::SecurityEvent(s) if s.kind == SecurityEventKind::InvalidSignature
    )));
}

#[tokio::test]
async fn schema_violation_on_accept() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;

    let created = h
        .coordinator
        .create(&alice, AgentId::from("bob"), "review".into(), accept_schema(), None)
        .await
        .unwrap();
    let key = ResponseKey::from_hex(&h.coordinator.derive_key(&bob, created.id).await.unwrap())
        .unwrap();
    let payload = serde_json::json!({"verdict": "yes"}); // wrong shape
    let sig = key
        .sign(created.id, &AgentId::from("bob"), ResponseType::Accept, &payload)
        .unwrap();
    let err = h
        .coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, &sig)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "schema_violation");
    assert_eq!(h.count_kind(EventKind::ElicitationResponded).await, 0);
}

#[tokio::test]
async fn expiry_is_idempotent_and_blocks_late_responses() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;

    let created = h
        .coordinator
        .create(
            &alice,
            AgentId::from("bob"),
            "review".into(),
            accept_schema(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    let key = ResponseKey::from_hex(&h.coordinator.derive_key(&bob, created.id).await.unwrap())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 1);
    // Repeated sweeps do not produce duplicate expiry events.
    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 0);
    assert_eq!(h.count_kind(EventKind::ElicitationExpired).await, 1);

    let payload = serde_json::json!({"accepted": true});
    let sig = key
        .sign(created.id, &AgentId::from("bob"), ResponseType::Accept, &payload)
        .unwrap();
    let err = h
        .coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, &sig)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "terminal");
}

#[tokio::test]
async fn degraded_mode_refuses_create_but_allows_respond() {
    let h = harness().await;
    let alice = h.ctx("alice").await;
    let bob = h.ctx("bob").await;

    let created = h
        .coordinator
        .create(&alice, AgentId::from("bob"), "review".into(), accept_schema(), None)
        .await
        .unwrap();

    h.state_tx.send(SystemState::Emergency).unwrap();
    let err = h
        .coordinator
        .create(&alice, AgentId::from("bob"), "another".into(), accept_schema(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "degraded");

    // The pre-existing exchange may still terminate normally.
    let key = ResponseKey::from_hex(&h.coordinator.derive_key(&bob, created.id).await.unwrap())
        .unwrap();
    let payload = serde_json::json!({"accepted": false});
    let sig = key
        .sign(created.id, &AgentId::from("bob"), ResponseType::Accept, &payload)
        .unwrap();
    h.coordinator
        .respond(&bob, created.id, ResponseType::Accept, payload, &sig)
        .await
        .unwrap();
}
