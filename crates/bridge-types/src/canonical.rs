//! Canonical serialization and content fingerprints.
//!
//! Hashing and signing must agree byte-for-byte on every machine, so both
//! operate on *canonical JSON*: compact encoding with object keys in sorted
//! order. `serde_json`'s default map is ordered, which makes the encoding
//! deterministic once a value has been lifted into `serde_json::Value`.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Serialize `value` into canonical JSON bytes.
///
/// The result is stable across processes and suitable as hash or HMAC input.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, BridgeError> {
    let v = serde_json::to_value(value)
        .map_err(|e| BridgeError::Internal(format!("canonicalization failed: {e}")))?;
    serde_json::to_vec(&v)
        .map_err(|e| BridgeError::Internal(format!("canonicalization failed: {e}")))
}

/// Inverse of [`canonical_json`].
pub fn decanonicalize<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, BridgeError> {
    serde_json::from_slice(bytes)
        .map_err(|e| BridgeError::SchemaViolation(format!("malformed canonical payload: {e}")))
}

/// Blake3 fingerprint of a value's canonical encoding.
pub fn fingerprint_of<T: Serialize>(value: &T) -> Result<Fingerprint, BridgeError> {
    Ok(Fingerprint::of_bytes(&canonical_json(value)?))
}

//─────────────────────────────
//  Fingerprint
//─────────────────────────────

/// A 256-bit blake3 digest used as a content address.
///
/// Fingerprints identify validation requests, token material, snapshot
/// bodies, and chain links. Equality on the inner digest is constant-time
/// via [`blake3::Hash`], which matters when a fingerprint stands in for a
/// secret (token fingerprints, key fingerprints).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap an existing digest.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality check against another fingerprint.
    pub fn ct_eq(&self, other: &Fingerprint) -> bool {
        blake3::Hash::from(self.0) == blake3::Hash::from(other.0)
    }

    /// Lowercase hex rendering, as used on the wire and in stream names.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse the hex rendering produced by [`Fingerprint::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self, BridgeError> {
        let hash = blake3::Hash::from_hex(s)
            .map_err(|_| BridgeError::SchemaViolation(format!("malformed fingerprint: {s}")))?;
        Ok(Self(*hash.as_bytes()))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
