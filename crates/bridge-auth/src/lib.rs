#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-auth** – Identity, capability, and rate-limiting gate.
//!
//! Every operation on the bridge passes through this crate: bearer tokens
//! are validated against the `agents` projection (issuance and revocation
//! are themselves events on the log), capability scopes gate what the
//! authenticated agent may do, token buckets bound how often, and the nonce
//! store rejects replays of security-sensitive exchanges.
//!
//! Derived state only: the projection, buckets, and nonce set can all be
//! discarded and rebuilt without loss.

mod agents;
mod authority;
mod nonce;
mod rate;
mod scope;
mod token;

pub use agents::{AgentRecord, AgentsProjection, AgentsState, TokenRecord};
pub use authority::{AuthContext, SessionAuthority};
pub use nonce::NonceStore;
pub use rate::{BucketConfig, OpClass, RateLimiter, RateLimits};
pub use scope::{CapabilitySet, Qualifier, Scope, ScopeBase, ScopeTarget};
pub use token::{Claims, IssuedToken, TokenAuthority};
