//! The event envelope – the atomic unit on the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::canonical::{canonical_json, Fingerprint};
use crate::error::{BridgeError, BridgeResult};
use crate::id::{EventId, NodeId};
use crate::payload::{EventKind, EventPayload};
use crate::stream::StreamId;
use crate::AgentId;

/// Digest type used for the per-event hash chain.
pub type ChainDigest = Fingerprint;

//─────────────────────────────
//  Causality & metadata
//─────────────────────────────

/// Causal references carried by an event. Informational: the log's total
/// order is authoritative; parents and correlation are for tracing and
/// projection joins, resolved by id lookup on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Causality {
    /// Ids of events this one causally depends on.
    pub parents: SmallVec<[EventId; 4]>,
    /// Correlation id tying a request to everything it spawned.
    pub correlation: Uuid,
    /// Session the event belongs to, when one exists.
    pub session: Option<Uuid>,
}

impl Causality {
    /// Fresh causality with a new correlation id and no parents.
    pub fn root() -> Self {
        Self { parents: SmallVec::new(), correlation: Uuid::new_v4(), session: None }
    }

    /// Causality continuing an existing correlation.
    pub fn correlated(correlation: Uuid) -> Self {
        Self { parents: SmallVec::new(), correlation, session: None }
    }
}

/// Envelope metadata. The timestamp is wall-clock for humans only; ordering
/// always comes from the event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Agent on whose behalf the event was appended.
    pub agent: AgentId,
    /// Node that committed the event.
    pub node: NodeId,
    /// Commit wall-clock time.
    pub timestamp: DateTime<Utc>,
}

/// Hash-chain link stored with every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integrity {
    /// Chain head before this event (all-zero for the first event).
    pub prev: ChainDigest,
    /// `blake3(prev ‖ canonical(envelope-without-integrity))`.
    pub hash: ChainDigest,
}

//─────────────────────────────
//  Event
//─────────────────────────────

/// A committed, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Totally ordered identifier assigned by the writer.
    pub id: EventId,
    /// Partition key.
    pub stream_id: StreamId,
    /// Typed, kind-tagged payload.
    pub payload: EventPayload,
    /// Causal references.
    pub causality: Causality,
    /// Envelope metadata.
    pub metadata: Metadata,
    /// Hash-chain link.
    pub integrity: Integrity,
}

/// Canonical view hashed into the chain: everything except the integrity
/// envelope itself.
#[derive(Serialize)]
struct ChainBody<'a> {
    id: &'a EventId,
    stream_id: &'a StreamId,
    payload: &'a EventPayload,
    causality: &'a Causality,
    metadata: &'a Metadata,
}

impl Event {
    /// The kind discriminant of this event's payload.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Seal a draft into a committed event, extending the hash chain.
    ///
    /// Only the log writer calls this: `id` must be the next id in the total
    /// order and `prev` the current chain head.
    pub fn seal(
        id: EventId,
        draft: EventDraft,
        node: NodeId,
        prev: ChainDigest,
    ) -> BridgeResult<Event> {
        let metadata = Metadata { agent: draft.agent, node, timestamp: Utc::now() };
        let body = ChainBody {
            id: &id,
            stream_id: &draft.stream_id,
            payload: &draft.payload,
            causality: &draft.causality,
            metadata: &metadata,
        };
        let hash = chain_hash(&prev, &canonical_json(&body)?);
        Ok(Event {
            id,
            stream_id: draft.stream_id,
            payload: draft.payload,
            causality: draft.causality,
            metadata,
            integrity: Integrity { prev, hash },
        })
    }

    /// Recompute this event's chain hash and compare against the stored one.
    ///
    /// `prev` is the chain head the event claims to extend. Recovery and
    /// integrity-checked reads call this; a mismatch means a torn or
    /// tampered frame.
    pub fn verify_chain(&self, prev: &ChainDigest) -> BridgeResult<()> {
        if self.integrity.prev != *prev {
            return Err(BridgeError::IntegrityBreak(format!(
                "event {} does not extend the current chain head",
                self.id
            )));
        }
        let body = ChainBody {
            id: &self.id,
            stream_id: &self.stream_id,
            payload: &self.payload,
            causality: &self.causality,
            metadata: &self.metadata,
        };
        let expected = chain_hash(prev, &canonical_json(&body)?);
        if expected != self.integrity.hash {
            return Err(BridgeError::IntegrityBreak(format!(
                "event {} hash mismatch",
                self.id
            )));
        }
        Ok(())
    }
}

/// Chain step: `blake3(prev ‖ body_bytes)`.
fn chain_hash(prev: &ChainDigest, body_bytes: &[u8]) -> ChainDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev.as_bytes());
    hasher.update(body_bytes);
    Fingerprint::from_bytes(*hasher.finalize().as_bytes())
}

/// The all-zero digest that roots every chain.
pub const CHAIN_ROOT: ChainDigest = Fingerprint::from_bytes([0u8; 32]);

//─────────────────────────────
//  Draft
//─────────────────────────────

/// What producers hand to the writer: an event minus the parts only the
/// writer may assign (id, node, commit timestamp, chain link).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Partition key.
    pub stream_id: StreamId,
    /// Typed payload.
    pub payload: EventPayload,
    /// Causal references.
    pub causality: Causality,
    /// Agent on whose behalf the event is appended.
    pub agent: AgentId,
}

impl EventDraft {
    /// Draft an event with fresh root causality.
    pub fn new(stream_id: StreamId, payload: EventPayload, agent: AgentId) -> Self {
        Self { stream_id, payload, causality: Causality::root(), agent }
    }

    /// Continue an existing correlation.
    pub fn with_correlation(mut self, correlation: Uuid) -> Self {
        self.causality.correlation = correlation;
        self
    }

    /// Record causal parents.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = EventId>) -> Self {
        self.causality.parents = parents.into_iter().collect();
        self
    }

    /// Attach a session id.
    pub fn with_session(mut self, session: Uuid) -> Self {
        self.causality.session = Some(session);
        self
    }

    /// Structural validation run before the draft is queued.
    pub fn validate(&self) -> BridgeResult<()> {
        self.payload
            .validate()
            .map_err(BridgeError::SchemaViolation)
    }
}

//─────────────────────────────
//  Filter
//─────────────────────────────

/// Predicate evaluated during log scans and subscription fan-out.
///
/// All present clauses must match (conjunction). An empty filter matches
/// every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Match events whose stream id starts with this prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_prefix: Option<String>,
    /// Match events whose kind is in this set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<EventKind>>,
    /// Match events with this correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Uuid>,
    /// Match events strictly after this id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<EventId>,
}

impl EventFilter {
    /// Filter matching everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a stream prefix.
    pub fn stream(prefix: impl Into<String>) -> Self {
        Self { stream_prefix: Some(prefix.into()), ..Self::default() }
    }

    /// Restrict to a set of kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self { kinds: Some(kinds.into_iter().collect()), ..Self::default() }
    }

    /// Restrict an existing filter to events after `id`.
    pub fn after(mut self, id: EventId) -> Self {
        self.since = Some(id);
        self
    }

    /// Evaluate the filter against one event.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(prefix) = &self.stream_prefix {
            if !event.stream_id.has_prefix(prefix) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(correlation) = &self.correlation {
            if event.causality.correlation != *correlation {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if event.id <= *since {
                return false;
            }
        }
        true
    }
}
