#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-types** – Shared primitive data structures for the Bridge.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It owns the event data model (ids, streams, kinds, payloads, integrity
//! envelope), the typed error surface exposed by the gateway, and the
//! canonical serialization used for hashing and signing. It makes no
//! assumptions about I/O, storage, or transport.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Size ceilings
//─────────────────────────────

/// Maximum allowed size for an elicitation message to prevent memory
/// exhaustion through oversized requests.
pub const MAX_MESSAGE_LEN: usize = 65_536;

/// Maximum allowed size for a serialized event payload.
pub const MAX_PAYLOAD_LEN: usize = 1_048_576; // 1MB

/// Maximum number of events accepted in a single batch append.
pub const MAX_BATCH_LEN: usize = 100;

/// Maximum allowed size for a capability token string.
pub const MAX_TOKEN_LEN: usize = 8192;

//─────────────────────────────
//  Modules
//─────────────────────────────

mod canonical;
mod error;
mod event;
mod id;
mod payload;
mod state;
mod stream;

pub use canonical::{canonical_json, decanonicalize, fingerprint_of, Fingerprint};
pub use error::{BridgeError, BridgeResult};
pub use event::{
    Causality, ChainDigest, Event, EventDraft, EventFilter, Integrity, Metadata, CHAIN_ROOT,
};
pub use id::{EventId, HlcClock, NodeId};
pub use payload::{
    AgentRegistered, AgentRevoked, CacheInvalidated, CapabilityGranted, DecidedBy,
    ElicitationCreated, ElicitationExpired, ElicitationResponded, EventKind, EventPayload,
    FileMutated, IntegrityAlert, PolicyUpdated, ResponseType, RiskLevel, SecurityEvent,
    SecurityEventKind, SnapshotTaken, SystemDegraded, SystemRecovered, SystemRecovering,
    TierTrace, TokenIssued, TokenRevoked, ValidationDecided, ValidationRequested, Verdict,
};
pub use state::SystemState;
pub use stream::StreamId;

//─────────────────────────────
//  Agent identity
//─────────────────────────────

/// Opaque identifier for an agent participating in the bridge.
///
/// Agents are external actors (coding agents, expert validators, operators).
/// The id is the stable half of every capability check: tokens bind to it,
/// streams are partitioned by it, and elicitations address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create an agent id, rejecting empty or oversized identifiers.
    pub fn new(id: impl Into<String>) -> Result<Self, BridgeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(BridgeError::SchemaViolation("agent id cannot be empty".into()));
        }
        if id.len() > 256 {
            return Err(BridgeError::SchemaViolation("agent id too long".into()));
        }
        Ok(Self(id))
    }

    /// Borrow the raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The event stream owned by this agent.
    pub fn stream(&self) -> StreamId {
        StreamId::agent(&self.0)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
