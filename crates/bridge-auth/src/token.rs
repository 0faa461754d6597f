//! Bearer token minting and validation (HS256 JWT).
//!
//! The token string is opaque to callers; server-side it decodes to a claim
//! set binding an agent id, its capability scopes, and an expiry. The log
//! never stores the token itself, only its blake3 fingerprint, which is also
//! what validation compares (digest equality is constant-time).

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bridge_types::{AgentId, BridgeError, BridgeResult, Fingerprint, MAX_TOKEN_LEN};

/// Claim set embedded in every capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the agent identifier.
    pub sub: String,
    /// Capability scope strings.
    pub caps: Vec<String>,
    /// Issued-at (seconds since Unix epoch).
    pub iat: u64,
    /// Absolute expiry (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token id for audit trails.
    pub jti: String,
}

/// A freshly minted token together with what gets recorded on the log.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The raw bearer string handed to the agent.
    pub token: String,
    /// Blake3 fingerprint recorded in the `TokenIssued` event.
    pub fingerprint: Fingerprint,
    /// The embedded claims.
    pub claims: Claims,
}

impl IssuedToken {
    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.claims.exp as i64, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Mints and verifies HS256 capability tokens with a shared secret.
#[derive(Clone)]
pub struct TokenAuthority {
    secret: Vec<u8>,
    validation: Validation,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output.
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /// Create an authority around a shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        Self { secret: secret.as_ref().to_vec(), validation }
    }

    /// Mint a token for `agent` carrying `caps`, valid for `ttl_secs`.
    pub fn issue(
        &self,
        agent: &AgentId,
        caps: Vec<String>,
        ttl_secs: u64,
    ) -> BridgeResult<IssuedToken> {
        let iat = Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: agent.as_str().to_string(),
            caps,
            iat,
            exp: iat + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("bridge.cap+jwt".into());
        let token = encode(&header, &claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|e| BridgeError::Internal(format!("token mint failed: {e}")))?;
        let fingerprint = Self::fingerprint(&token);
        Ok(IssuedToken { token, fingerprint, claims })
    }

    /// Verify authenticity and expiry, returning the embedded claims.
    pub fn validate(&self, raw: &str) -> BridgeResult<Claims> {
        if raw.len() > MAX_TOKEN_LEN {
            return Err(BridgeError::Unauthenticated("token too long".into()));
        }
        decode::<Claims>(raw, &DecodingKey::from_secret(&self.secret), &self.validation)
            .map(|data| data.claims)
            .map_err(|_| BridgeError::Unauthenticated("token rejected".into()))
    }

    /// Blake3 fingerprint of a raw token string.
    pub fn fingerprint(raw: &str) -> Fingerprint {
        Fingerprint::of_bytes(raw.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_validate() {
        let authority = TokenAuthority::new(b"test-secret");
        let issued = authority
            .issue(&AgentId::from("alpha"), vec!["events.read:own".into()], 600)
            .unwrap();

        let claims = authority.validate(&issued.token).unwrap();
        assert_eq!(claims.sub, "alpha");
        assert_eq!(claims.caps, vec!["events.read:own".to_string()]);
        assert_eq!(TokenAuthority::fingerprint(&issued.token), issued.fingerprint);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let minting = TokenAuthority::new(b"secret-a");
        let verifying = TokenAuthority::new(b"secret-b");
        let issued = minting.issue(&AgentId::from("alpha"), vec![], 600).unwrap();

        let err = verifying.validate(&issued.token).unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let authority = TokenAuthority::new(b"secret");
        let issued = authority.issue(&AgentId::from("alpha"), vec![], 600).unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');
        assert!(authority.validate(&tampered).is_err());
    }
}
