//! Typed error surface shared by every component and exposed by the gateway.

use std::time::Duration;

/// Result alias used across the bridge crates.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Deterministic error kinds produced by the bridge.
///
/// Each variant has a stable wire identifier (see [`BridgeError::code`]) so
/// callers can handle failures programmatically. Messages never include
/// secrets, nonces, or token material.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Missing or invalid bearer token.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated caller lacks the required capability or identity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A rate bucket for the caller is exhausted.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long to wait before the bucket refills enough to retry.
        retry_after: Duration,
    },

    /// A bounded queue is full; the caller should retry with backoff.
    #[error("busy: {0}")]
    Busy(String),

    /// Referenced aggregate or event does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input failed structural validation.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A nonce or event id was presented more than once.
    #[error("replay detected: {0}")]
    Replay(String),

    /// The elicitation's deadline has passed.
    #[error("expired: {0}")]
    Expired(String),

    /// The elicitation already took its terminal transition.
    #[error("already terminal: {0}")]
    Terminal(String),

    /// The system refuses this operation in its current degradation state.
    #[error("degraded: {0}")]
    Degraded(String),

    /// Hash chain break, torn batch, or unknown event kind during replay.
    #[error("integrity break: {0}")]
    IntegrityBreak(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable identifier for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Unauthenticated(_) => "unauthenticated",
            BridgeError::Forbidden(_) => "forbidden",
            BridgeError::RateLimited { .. } => "rate_limited",
            BridgeError::Busy(_) => "busy",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::SchemaViolation(_) => "schema_violation",
            BridgeError::Replay(_) => "replay",
            BridgeError::Expired(_) => "expired",
            BridgeError::Terminal(_) => "terminal",
            BridgeError::Degraded(_) => "degraded",
            BridgeError::IntegrityBreak(_) => "integrity_break",
            BridgeError::Internal(_) => "internal",
        }
    }

    /// Retry hint for transient errors, if one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BridgeError::RateLimited { retry_after } => Some(*retry_after),
            BridgeError::Busy(_) => Some(Duration::from_millis(100)),
            _ => None,
        }
    }

    /// Whether the caller may retry the identical request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::RateLimited { .. } | BridgeError::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BridgeError::Replay("x".into()).code(), "replay");
        assert_eq!(
            BridgeError::RateLimited { retry_after: Duration::from_secs(1) }.code(),
            "rate_limited"
        );
    }

    #[test]
    fn transient_errors_carry_retry_hint() {
        let err = BridgeError::RateLimited { retry_after: Duration::from_secs(3) };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(BridgeError::NotFound("x".into()).retry_after().is_none());
    }
}
