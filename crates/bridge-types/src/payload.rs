//! The closed event enumeration and its per-variant payloads.
//!
//! Adding a variant is a deliberate, versioned change: replay code treats an
//! unrecognized kind as an integrity error, never as something to skip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::canonical::Fingerprint;
use crate::id::EventId;
use crate::AgentId;

//─────────────────────────────
//  Event kinds
//─────────────────────────────

/// Discriminant of every event on the log. Closed set.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentRegistered,
    AgentRevoked,
    TokenIssued,
    TokenRevoked,
    CapabilityGranted,
    ElicitationCreated,
    ElicitationResponded,
    ElicitationExpired,
    ValidationRequested,
    ValidationDecided,
    PolicyUpdated,
    CacheInvalidated,
    SystemDegraded,
    SystemRecovering,
    SystemRecovered,
    IntegrityAlert,
    SecurityEvent,
    FileMutated,
    SnapshotTaken,
}

impl EventKind {
    /// Dotted wire name, e.g. `elicitation.created`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentRegistered => "agent.registered",
            EventKind::AgentRevoked => "agent.revoked",
            EventKind::TokenIssued => "token.issued",
            EventKind::TokenRevoked => "token.revoked",
            EventKind::CapabilityGranted => "capability.granted",
            EventKind::ElicitationCreated => "elicitation.created",
            EventKind::ElicitationResponded => "elicitation.responded",
            EventKind::ElicitationExpired => "elicitation.expired",
            EventKind::ValidationRequested => "validation.requested",
            EventKind::ValidationDecided => "validation.decided",
            EventKind::PolicyUpdated => "policy.updated",
            EventKind::CacheInvalidated => "cache.invalidated",
            EventKind::SystemDegraded => "system.degraded",
            EventKind::SystemRecovering => "system.recovering",
            EventKind::SystemRecovered => "system.recovered",
            EventKind::IntegrityAlert => "integrity.alert",
            EventKind::SecurityEvent => "security.event",
            EventKind::FileMutated => "file.mutated",
            EventKind::SnapshotTaken => "snapshot.taken",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Elicitation vocabulary
//─────────────────────────────

/// Terminal disposition chosen by an elicitation's responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Responder accepted; the payload must validate against the schema.
    Accept,
    /// Responder declined; payload is informational only.
    Decline,
    /// Responder cancelled the exchange without judging it, e.g. wrong
    /// addressee or withdrawn request.
    Cancel,
}

//─────────────────────────────
//  Validation vocabulary
//─────────────────────────────

/// Outcome of a validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The action may proceed.
    Approved,
    /// The action is refused.
    Denied,
    /// No tier was confident; an expert review is required.
    Escalate,
}

/// Which tier produced a validation decision.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    Memory,
    Policy,
    Pattern,
    Expert,
    Human,
}

/// Coarse risk classification attached to decisions.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// One entry in a decision's tier trace, recording what each consulted tier
/// concluded and how long it took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTrace {
    /// The tier that was consulted.
    pub tier: DecidedBy,
    /// Outcome summary, e.g. `miss`, `matched rule deny-shell`, `confidence 0.62`.
    pub outcome: String,
    /// Time the tier spent, in microseconds.
    pub elapsed_us: u64,
}

//─────────────────────────────
//  Security vocabulary
//─────────────────────────────

/// Classification of security-relevant incidents recorded on the log.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    UnauthorizedResponse,
    ReplayAttempt,
    InvalidSignature,
    RateLimitExceeded,
    CapabilityDenied,
    TokenRejected,
}

//─────────────────────────────
//  Per-variant payloads
//─────────────────────────────

/// An agent joined the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistered {
    /// The registered agent.
    pub agent: AgentId,
    /// Capability scopes granted at registration.
    pub capabilities: Vec<String>,
}

/// An agent was removed; its tokens stop validating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRevoked {
    /// The revoked agent.
    pub agent: AgentId,
    /// Operator-supplied reason.
    pub reason: String,
}

/// A bearer token was issued for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenIssued {
    /// Token owner.
    pub agent: AgentId,
    /// Blake3 fingerprint of the raw token string. The token itself is
    /// never written to the log.
    pub token_fingerprint: Fingerprint,
    /// Capability scopes carried by the token.
    pub capabilities: Vec<String>,
    /// Expiry of the token.
    pub expires_at: DateTime<Utc>,
}

/// A previously issued token was revoked before expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRevoked {
    /// Token owner.
    pub agent: AgentId,
    /// Fingerprint of the revoked token.
    pub token_fingerprint: Fingerprint,
    /// Operator-supplied reason.
    pub reason: String,
}

/// An additional capability scope was granted to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGranted {
    /// Receiving agent.
    pub agent: AgentId,
    /// The granted scope string.
    pub scope: String,
    /// Agent (usually an operator) that granted it.
    pub granted_by: AgentId,
}

/// An elicitation was opened from one agent to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationCreated {
    /// Elicitation id; also names the `elicitation:<id>` stream.
    pub id: Uuid,
    /// Requesting agent.
    pub from: AgentId,
    /// Agent expected to respond.
    pub to: AgentId,
    /// Human/agent-readable request.
    pub message: String,
    /// JSON Schema the accept payload must satisfy.
    pub response_schema: Value,
    /// One-shot nonce (hex). Consumed when the response is verified.
    pub nonce: String,
    /// Fingerprint of the derived response key. The key itself is never
    /// persisted; the responder re-derives it through an authenticated call.
    pub key_fingerprint: Fingerprint,
    /// Deadline after which the exchange expires.
    pub expires_at: DateTime<Utc>,
}

/// The single terminal response to an elicitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationResponded {
    /// Elicitation id.
    pub id: Uuid,
    /// The responding agent (always the elicitation's `to` agent).
    pub responder: AgentId,
    /// Terminal disposition.
    pub response_type: ResponseType,
    /// Response payload; schema-validated when `response_type` is accept.
    pub payload: Value,
    /// When the response was verified.
    pub responded_at: DateTime<Utc>,
}

/// An elicitation passed its deadline without a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationExpired {
    /// Elicitation id.
    pub id: Uuid,
    /// When the sweeper observed the expiry.
    pub expired_at: DateTime<Utc>,
}

/// A validation request entered the speed layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequested {
    /// Cache key: blake3 of tool name and canonical arguments.
    pub fingerprint: Fingerprint,
    /// Tool the agent wants to invoke.
    pub tool: String,
    /// Canonicalized tool arguments.
    pub args: Value,
    /// Invoking agent.
    pub agent: AgentId,
}

/// A validation request was decided; carries the full tier trace for audit
/// and learning loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDecided {
    /// Cache key of the decided request.
    pub fingerprint: Fingerprint,
    /// Final outcome.
    pub verdict: Verdict,
    /// Assessed risk.
    pub risk: RiskLevel,
    /// Explanation suitable for audit.
    pub reasoning: String,
    /// Tier that produced the final answer.
    pub decided_by: DecidedBy,
    /// Every tier consulted, in order.
    pub trace: Vec<TierTrace>,
}

/// The policy rule set changed; caches covering affected tools must drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdated {
    /// Identifier of the policy set.
    pub policy_id: String,
    /// Monotonic revision of the rule set.
    pub revision: u64,
    /// Tools whose cached decisions are invalidated by this update; empty
    /// means all.
    pub tools: Vec<String>,
}

/// Explicit cache invalidation, e.g. after a manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInvalidated {
    /// Fingerprints to drop; empty means flush everything.
    pub fingerprints: Vec<Fingerprint>,
    /// Why the entries were dropped.
    pub reason: String,
}

/// The controller moved the system into EMERGENCY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDegraded {
    /// Trigger description, e.g. `vfs health failure`, `storage high-water`.
    pub reason: String,
    /// Seconds in-flight work is given to drain before cancellation.
    pub drain_window_secs: u64,
}

/// An operator started the supervised path back to normal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRecovering {
    /// Operator that approved the transition.
    pub operator: AgentId,
}

/// Health checks passed and the operator approved full operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRecovered {
    /// Operator that approved the transition.
    pub operator: AgentId,
}

/// Integrity violation detected in stored or replayed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityAlert {
    /// What broke and where.
    pub detail: String,
    /// Quarantined artifact, if any (segment file, snapshot path).
    pub quarantined: Option<String>,
}

/// Security-relevant incident, recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Incident classification.
    pub kind: SecurityEventKind,
    /// Agent the incident is attributed to, when known.
    pub agent: Option<AgentId>,
    /// Free-form context. Never contains secrets, nonces, or token material.
    pub context: BTreeMap<String, String>,
}

/// A file mutation observed by the virtual-filesystem collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMutated {
    /// Mutated path.
    pub path: String,
    /// Mutation kind, e.g. `write`, `delete`, `rename`.
    pub mutation: String,
    /// Agent whose action produced the mutation.
    pub agent: AgentId,
    /// Content hash after the mutation, if the file still exists.
    pub content_hash: Option<Fingerprint>,
}

/// A projection snapshot was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTaken {
    /// Projection the snapshot belongs to.
    pub projection: String,
    /// Last event id folded into the snapshot.
    pub up_to: EventId,
    /// Blake3 digest of the serialized snapshot state.
    pub integrity: Fingerprint,
}

//─────────────────────────────
//  Tagged payload union
//─────────────────────────────

/// Typed payload of an event, tagged by kind.
///
/// Every variant wraps exactly one payload struct; [`EventPayload::kind`]
/// recovers the discriminant without deserializing anything.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    AgentRegistered(AgentRegistered),
    AgentRevoked(AgentRevoked),
    TokenIssued(TokenIssued),
    TokenRevoked(TokenRevoked),
    CapabilityGranted(CapabilityGranted),
    ElicitationCreated(ElicitationCreated),
    ElicitationResponded(ElicitationResponded),
    ElicitationExpired(ElicitationExpired),
    ValidationRequested(ValidationRequested),
    ValidationDecided(ValidationDecided),
    PolicyUpdated(PolicyUpdated),
    CacheInvalidated(CacheInvalidated),
    SystemDegraded(SystemDegraded),
    SystemRecovering(SystemRecovering),
    SystemRecovered(SystemRecovered),
    IntegrityAlert(IntegrityAlert),
    SecurityEvent(SecurityEvent),
    FileMutated(FileMutated),
    SnapshotTaken(SnapshotTaken),
}

impl EventPayload {
    /// The discriminant of this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AgentRegistered(_) => EventKind::AgentRegistered,
            EventPayload::AgentRevoked(_) => EventKind::AgentRevoked,
            EventPayload::TokenIssued(_) => EventKind::TokenIssued,
            EventPayload::TokenRevoked(_) => EventKind::TokenRevoked,
            EventPayload::CapabilityGranted(_) => EventKind::CapabilityGranted,
            EventPayload::ElicitationCreated(_) => EventKind::ElicitationCreated,
            EventPayload::ElicitationResponded(_) => EventKind::ElicitationResponded,
            EventPayload::ElicitationExpired(_) => EventKind::ElicitationExpired,
            EventPayload::ValidationRequested(_) => EventKind::ValidationRequested,
            EventPayload::ValidationDecided(_) => EventKind::ValidationDecided,
            EventPayload::PolicyUpdated(_) => EventKind::PolicyUpdated,
            EventPayload::CacheInvalidated(_) => EventKind::CacheInvalidated,
            EventPayload::SystemDegraded(_) => EventKind::SystemDegraded,
            EventPayload::SystemRecovering(_) => EventKind::SystemRecovering,
            EventPayload::SystemRecovered(_) => EventKind::SystemRecovered,
            EventPayload::IntegrityAlert(_) => EventKind::IntegrityAlert,
            EventPayload::SecurityEvent(_) => EventKind::SecurityEvent,
            EventPayload::FileMutated(_) => EventKind::FileMutated,
            EventPayload::SnapshotTaken(_) => EventKind::SnapshotTaken,
        }
    }

    /// Structural validation applied before a payload reaches the writer.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            EventPayload::ElicitationCreated(e) => {
                if e.message.len() > crate::MAX_MESSAGE_LEN {
                    return Err(format!(
                        "elicitation message too long: {} > {}",
                        e.message.len(),
                        crate::MAX_MESSAGE_LEN
                    ));
                }
                if e.from == e.to {
                    return Err("elicitation cannot address its own creator".to_string());
                }
                Ok(())
            }
            EventPayload::ElicitationResponded(e) => {
                let len = e.payload.to_string().len();
                if len > crate::MAX_PAYLOAD_LEN {
                    return Err(format!(
                        "response payload too large: {} > {}",
                        len,
                        crate::MAX_PAYLOAD_LEN
                    ));
                }
                Ok(())
            }
            EventPayload::AgentRegistered(e) => {
                if e.agent.as_str().trim().is_empty() {
                    return Err("agent id cannot be empty".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonical_json, decanonicalize};

    #[test]
    fn payload_kind_tagging() {
        let payload = EventPayload::ElicitationExpired(ElicitationExpired {
            id: Uuid::nil(),
            expired_at: Utc::now(),
        });
        assert_eq!(payload.kind(), EventKind::ElicitationExpired);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "elicitation_expired");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let bogus = serde_json::json!({"kind": "agent.teleported", "data": {}});
        assert!(serde_json::from_value::<EventPayload>(bogus).is_err());
    }

    #[test]
    fn canonical_round_trip_every_simple_variant() {
        let samples = vec![
            EventPayload::AgentRegistered(AgentRegistered {
                agent: AgentId::from("alpha"),
                capabilities: vec!["events.read:own".into()],
            }),
            EventPayload::SystemDegraded(SystemDegraded {
                reason: "vfs health failure".into(),
                drain_window_secs: 30,
            }),
            EventPayload::SecurityEvent(SecurityEvent {
                kind: SecurityEventKind::ReplayAttempt,
                agent: Some(AgentId::from("mallory")),
                context: BTreeMap::from([("elicitation".to_string(), "abc".to_string())]),
            }),
        ];
        for payload in samples {
            let bytes = canonical_json(&payload).unwrap();
            let back: EventPayload = decanonicalize(&bytes).unwrap();
            assert_eq!(payload, back);
        }
    }

    #[test]
    fn self_addressed_elicitation_rejected() {
        let p = EventPayload::ElicitationCreated(ElicitationCreated {
            id: Uuid::nil(),
            from: AgentId::from("a"),
            to: AgentId::from("a"),
            message: "hi".into(),
            response_schema: serde_json::json!({}),
            nonce: "00".into(),
            key_fingerprint: Fingerprint::of_bytes(b"k"),
            expires_at: Utc::now(),
        });
        assert!(p.validate().is_err());
    }
}
