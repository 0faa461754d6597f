#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-elicitation** – Cryptographically bound agent-to-agent exchange.
//!
//! An elicitation is a one-shot request/response between two agents carried
//! entirely as events: `ElicitationCreated` opens it, exactly one of
//! `ElicitationResponded` / `ElicitationExpired` closes it. Responses are
//! bound to the addressed agent by an HMAC over a derived key whose
//! fingerprint (never the key) sits on the log, and replays are stopped by a
//! one-shot nonce. This replaces long-poll RPC: the requester learns the
//! outcome through its event subscription like everything else.

mod coordinator;
mod keys;
mod projection;

pub use coordinator::{CreatedElicitation, ElicitationConfig, ElicitationCoordinator};
pub use keys::ResponseKey;
pub use projection::{
    ElicitationStatus, ElicitationView, ElicitationsProjection, ElicitationsState,
};
