//! The `elicitations` projection: lifecycle state folded from the
//! `elicitation:<id>` streams.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use bridge_store::Projection;
use bridge_types::{
    AgentId, BridgeError, BridgeResult, Event, EventFilter, EventKind, EventPayload, Fingerprint,
    ResponseType,
};

/// Lifecycle position of one elicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationStatus {
    /// Awaiting its single terminal transition.
    Pending,
    /// Terminal: a verified response landed.
    Responded,
    /// Terminal: the deadline passed.
    Expired,
}

impl ElicitationStatus {
    /// Whether a terminal transition has happened.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ElicitationStatus::Pending)
    }
}

/// Everything the coordinator needs to know about one elicitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationView {
    /// Elicitation id.
    pub id: Uuid,
    /// Requesting agent.
    pub from: AgentId,
    /// Agent expected to respond.
    pub to: AgentId,
    /// The request message.
    pub message: String,
    /// Schema accept payloads must satisfy.
    pub response_schema: Value,
    /// One-shot nonce bound into the response key.
    pub nonce: String,
    /// Fingerprint of the derivable response key.
    pub key_fingerprint: Fingerprint,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
    /// Lifecycle position.
    pub status: ElicitationStatus,
    /// Terminal response, when one landed.
    pub response: Option<(ResponseType, Value, DateTime<Utc>)>,
}

impl ElicitationView {
    /// Whether the deadline has passed at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Projection state: all elicitations by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElicitationsState {
    /// Elicitations keyed by id.
    pub items: BTreeMap<Uuid, ElicitationView>,
}

impl ElicitationsState {
    /// Pending elicitations addressed to `agent`, oldest deadline first.
    pub fn pending_for(&self, agent: &AgentId) -> Vec<ElicitationView> {
        let mut out: Vec<ElicitationView> = self
            .items
            .values()
            .filter(|v| v.status == ElicitationStatus::Pending && &v.to == agent)
            .cloned()
            .collect();
        out.sort_by_key(|v| v.expires_at);
        out
    }

    /// Pending elicitations whose deadline has passed at `now`.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<ElicitationView> {
        self.items
            .values()
            .filter(|v| v.status == ElicitationStatus::Pending && v.is_overdue(now))
            .cloned()
            .collect()
    }
}

/// Projection over elicitation lifecycle events.
///
/// Exactly one terminal transition survives: because events on one
/// `elicitation:<id>` stream are totally ordered, the first terminal event
/// wins and later ones are ignored by the fold.
#[derive(Debug, Default, Clone)]
pub struct ElicitationsProjection;

impl Projection for ElicitationsProjection {
    type State = ElicitationsState;

    fn name(&self) -> &'static str {
        "elicitations"
    }

    fn interest(&self) -> EventFilter {
        EventFilter::kinds([
            EventKind::ElicitationCreated,
            EventKind::ElicitationResponded,
            EventKind::ElicitationExpired,
        ])
    }

    fn apply(&self, state: &mut Self::State, event: &Event) -> BridgeResult<()> {
        match &event.payload {
            EventPayload::ElicitationCreated(p) => {
                state.items.entry(p.id).or_insert_with(|| ElicitationView {
                    id: p.id,
                    from: p.from.clone(),
                    to: p.to.clone(),
                    message: p.message.clone(),
                    response_schema: p.response_schema.clone(),
                    nonce: p.nonce.clone(),
                    key_fingerprint: p.key_fingerprint,
                    expires_at: p.expires_at,
                    status: ElicitationStatus::Pending,
                    response: None,
                });
            }
            EventPayload::ElicitationResponded(p) => {
                if let Some(item) = state.items.get_mut(&p.id) {
                    if !item.status.is_terminal() {
                        item.status = ElicitationStatus::Responded;
                        item.response =
                            Some((p.response_type, p.payload.clone(), p.responded_at));
                    }
                }
            }
            EventPayload::ElicitationExpired(p) => {
                if let Some(item) = state.items.get_mut(&p.id) {
                    if !item.status.is_terminal() {
                        item.status = ElicitationStatus::Expired;
                    }
                }
            }
            other => {
                return Err(BridgeError::IntegrityBreak(format!(
                    "elicitations projection cannot fold {}",
                    other.kind()
                )))
            }
        }
        Ok(())
    }
}
