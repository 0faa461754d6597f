//! Bounded, time-windowed store of consumed nonces.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;

use bridge_types::{BridgeError, BridgeResult};

/// Tracks nonces that have already been consumed.
///
/// Consumption is an atomic check-and-insert: the second presentation of a
/// nonce fails with `Replay`. Entries older than the retention window (the
/// longest possible elicitation timeout) are evicted lazily; the store is
/// derived state and can always be rebuilt by replaying unexpired
/// elicitations.
#[derive(Debug)]
pub struct NonceStore {
    seen: DashMap<String, DateTime<Utc>>,
    retention: Duration,
    max_entries: usize,
}

impl NonceStore {
    /// Create a store retaining nonces for `retention_secs`, holding at most
    /// `max_entries` before forced eviction sweeps.
    pub fn new(retention_secs: u64, max_entries: usize) -> Self {
        Self {
            seen: DashMap::new(),
            retention: Duration::seconds(retention_secs as i64),
            max_entries,
        }
    }

    /// Generate a fresh 128-bit nonce, hex encoded.
    pub fn generate() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Atomically consume `nonce`. The first call wins; any repeat within
    /// the retention window is a replay.
    pub fn consume(&self, nonce: &str) -> BridgeResult<()> {
        self.consume_at(nonce, Utc::now())
    }

    /// Clock-injected variant of [`consume`](NonceStore::consume).
    pub fn consume_at(&self, nonce: &str, now: DateTime<Utc>) -> BridgeResult<()> {
        if self.seen.len() >= self.max_entries {
            self.evict(now);
        }
        match self.seen.entry(nonce.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BridgeError::Replay("nonce already consumed".into()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(now);
                Ok(())
            }
        }
    }

    /// Drop entries past the retention window.
    fn evict(&self, now: DateTime<Utc>) {
        self.seen.retain(|_, consumed_at| now - *consumed_at < self.retention);
    }

    /// Current number of retained nonces.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_consume_is_a_replay() {
        let store = NonceStore::new(300, 1000);
        let nonce = NonceStore::generate();
        store.consume(&nonce).unwrap();
        let err = store.consume(&nonce).unwrap_err();
        assert_eq!(err.code(), "replay");
    }

    #[test]
    fn generated_nonces_are_unique_and_hex() {
        let a = NonceStore::generate();
        let b = NonceStore::generate();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn expired_entries_are_evicted_under_pressure() {
        let store = NonceStore::new(60, 2);
        let t0 = Utc::now();
        store.consume_at("a", t0).unwrap();
        store.consume_at("b", t0).unwrap();

        // At capacity; a consume far in the future sweeps the stale entries.
        let t1 = t0 + Duration::seconds(120);
        store.consume_at("c", t1).unwrap();
        assert_eq!(store.len(), 1);
        // An evicted nonce is past its window, so replay protection for it
        // has been handed over to the elicitation's own expiry.
        store.consume_at("a", t1).unwrap();
    }
}
