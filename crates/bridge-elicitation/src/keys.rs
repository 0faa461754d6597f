//! Response key derivation and response signatures.
//!
//! The coordinator never stores the response key, only its fingerprint. The
//! responding agent obtains the key through an authenticated derivation call
//! that requires its identity to equal the elicitation's `to` agent; both
//! sides then agree on `HMAC-SHA256(key, canonical(response))` without the
//! key ever crossing the log.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use bridge_types::{canonical_json, AgentId, BridgeError, BridgeResult, Fingerprint, ResponseType};

type HmacSha256 = Hmac<Sha256>;

/// A derived response key. Kept out of Debug output.
#[derive(Clone)]
pub struct ResponseKey([u8; 32]);

impl std::fmt::Debug for ResponseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseKey").finish_non_exhaustive()
    }
}

impl ResponseKey {
    /// Derive the key for `(id, to, nonce)` under the coordinator secret:
    /// `blake3::keyed_hash(secret, id ‖ to ‖ nonce)`.
    pub fn derive(secret: &[u8; 32], id: Uuid, to: &AgentId, nonce: &str) -> Self {
        let mut input = Vec::with_capacity(16 + to.as_str().len() + nonce.len());
        input.extend_from_slice(id.as_bytes());
        input.extend_from_slice(to.as_str().as_bytes());
        input.extend_from_slice(nonce.as_bytes());
        Self(*blake3::keyed_hash(secret, &input).as_bytes())
    }

    /// Fingerprint recorded on the `ElicitationCreated` event.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_bytes(&self.0)
    }

    /// Hex form handed to the authenticated responder.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse the hex form back into a key.
    pub fn from_hex(s: &str) -> BridgeResult<Self> {
        let bytes = decode_hex(s)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BridgeError::SchemaViolation("malformed response key".into()))?;
        Ok(Self(key))
    }

    /// Sign a response: `HMAC-SHA256(key, canonical([id, responder, type, payload]))`.
    pub fn sign(
        &self,
        id: Uuid,
        responder: &AgentId,
        response_type: ResponseType,
        payload: &serde_json::Value,
    ) -> BridgeResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .map_err(|e| BridgeError::Internal(format!("hmac init: {e}")))?;
        mac.update(&signing_input(id, responder, response_type, payload)?);
        let out = mac.finalize().into_bytes();
        Ok(out.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Verify a hex signature in constant time.
    pub fn verify(
        &self,
        id: Uuid,
        responder: &AgentId,
        response_type: ResponseType,
        payload: &serde_json::Value,
        signature_hex: &str,
    ) -> BridgeResult<()> {
        let signature = decode_hex(signature_hex)?;
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .map_err(|e| BridgeError::Internal(format!("hmac init: {e}")))?;
        mac.update(&signing_input(id, responder, response_type, payload)?);
        mac.verify_slice(&signature)
            .map_err(|_| BridgeError::Forbidden("response signature rejected".into()))
    }
}

fn signing_input(
    id: Uuid,
    responder: &AgentId,
    response_type: ResponseType,
    payload: &serde_json::Value,
) -> BridgeResult<Vec<u8>> {
    canonical_json(&serde_json::json!([id, responder, response_type, payload]))
}

fn decode_hex(s: &str) -> BridgeResult<Vec<u8>> {
    if s.len() % 2 != 0 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BridgeError::SchemaViolation("malformed hex".into()));
    }
    Ok((0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("checked hexdigit"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derivation_is_deterministic_and_bound() {
        let secret = [7u8; 32];
        let id = Uuid::new_v4();
        let to = AgentId::from("expert");

        let a = ResponseKey::derive(&secret, id, &to, "aabb");
        let b = ResponseKey::derive(&secret, id, &to, "aabb");
        assert_eq!(a.fingerprint(), b.fingerprint());

        // Any changed input yields a different key.
        assert_ne!(
            a.fingerprint(),
            ResponseKey::derive(&secret, id, &to, "aabc").fingerprint()
        );
        assert_ne!(
            a.fingerprint(),
            ResponseKey::derive(&secret, id, &AgentId::from("other"), "aabb").fingerprint()
        );
        assert_ne!(
            a.fingerprint(),
            ResponseKey::derive(&[8u8; 32], id, &to, "aabb").fingerprint()
        );
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = ResponseKey::derive(&[1u8; 32], Uuid::new_v4(), &AgentId::from("b"), "00ff");
        let id = Uuid::new_v4();
        let responder = AgentId::from("b");
        let payload = json!({"accepted": true});

        let sig = key.sign(id, &responder, ResponseType::Accept, &payload).unwrap();
        key.verify(id, &responder, ResponseType::Accept, &payload, &sig).unwrap();

        // A different payload or identity invalidates the signature.
        assert!(key
            .verify(id, &responder, ResponseType::Accept, &json!({"accepted": false}), &sig)
            .is_err());
        assert!(key
            .verify(id, &AgentId::from("c"), ResponseType::Accept, &payload, &sig)
            .is_err());
        assert!(key
            .verify(id, &responder, ResponseType::Decline, &payload, &sig)
            .is_err());
    }

    #[test]
    fn hex_round_trip() {
        let key = ResponseKey::derive(&[2u8; 32], Uuid::new_v4(), &AgentId::from("x"), "01");
        let back = ResponseKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.fingerprint(), back.fingerprint());
        assert!(ResponseKey::from_hex("zz").is_err());
        assert!(ResponseKey::from_hex("00ff").is_err()); // wrong length
    }
}
