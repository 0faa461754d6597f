//! Memory tier: sharded LRU of recent decisions with a Bloom front filter.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use bridge_types::Fingerprint;

use crate::bloom::BloomFilter;
use crate::request::Decision;

/// Shard count; fingerprints spread uniformly, so a small power of two
/// keeps lock contention negligible.
const SHARDS: usize = 16;

struct CachedEntry {
    decision: Decision,
    tool: String,
    inserted_at: Instant,
}

/// Hit/miss counters for the health surface and tests.
#[derive(Debug, Default)]
pub struct MemoryTierStats {
    /// Lookups answered from the table.
    pub hits: AtomicU64,
    /// Lookups that missed (including Bloom short-circuits).
    pub misses: AtomicU64,
}

/// Exact-fingerprint cache of recent decisions.
///
/// Entries expire after the TTL and are dropped lazily on access. The Bloom
/// filter in front short-circuits lookups for fingerprints that were never
/// inserted; it is append-only and merely costs an extra probe after
/// invalidations.
pub struct MemoryTier {
    shards: Vec<Mutex<LruCache<Fingerprint, CachedEntry>>>,
    bloom: BloomFilter,
    ttl: Duration,
    stats: MemoryTierStats,
}

impl MemoryTier {
    /// Create a tier holding up to `capacity` decisions for `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let per_shard = NonZeroUsize::new((capacity / SHARDS).max(1)).expect("nonzero");
        let shards = (0..SHARDS).map(|_| Mutex::new(LruCache::new(per_shard))).collect();
        Self {
            shards,
            bloom: BloomFilter::new(capacity / 8),
            ttl,
            stats: MemoryTierStats::default(),
        }
    }

    fn shard(&self, fp: &Fingerprint) -> &Mutex<LruCache<Fingerprint, CachedEntry>> {
        &self.shards[(fp.as_bytes()[0] as usize) % SHARDS]
    }

    /// Look up a fresh cached decision.
    pub fn get(&self, fp: &Fingerprint) -> Option<Decision> {
        if !self.bloom.maybe_contains(fp) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut shard = self.shard(fp).lock().expect("memory tier shard");
        match shard.get(fp) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.decision.clone())
            }
            Some(_) => {
                // Past TTL: drop so the next tier refreshes it.
                shard.pop(fp);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a decision under its fingerprint.
    pub fn insert(&self, fp: Fingerprint, tool: &str, decision: Decision) {
        self.bloom.insert(&fp);
        self.shard(&fp).lock().expect("memory tier shard").put(
            fp,
            CachedEntry { decision, tool: tool.to_string(), inserted_at: Instant::now() },
        );
    }

    /// Drop specific fingerprints, or everything when `fps` is empty.
    pub fn invalidate(&self, fps: &[Fingerprint]) {
        if fps.is_empty() {
            self.clear();
            return;
        }
        for fp in fps {
            self.shard(fp).lock().expect("memory tier shard").pop(fp);
        }
    }

    /// Drop every cached decision for the given tools.
    pub fn invalidate_tools(&self, tools: &[String]) {
        if tools.is_empty() {
            self.clear();
            return;
        }
        for shard in &self.shards {
            let mut shard = shard.lock().expect("memory tier shard");
            let doomed: Vec<Fingerprint> = shard
                .iter()
                .filter(|(_, e)| tools.contains(&e.tool))
                .map(|(fp, _)| *fp)
                .collect();
            for fp in doomed {
                shard.pop(&fp);
            }
        }
    }

    /// Drop every cached decision.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("memory tier shard").clear();
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().expect("memory tier shard").len()).sum()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters.
    pub fn stats(&self) -> (u64, u64) {
        (self.stats.hits.load(Ordering::Relaxed), self.stats.misses.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::{DecidedBy, RiskLevel, Verdict};

    fn decision() -> Decision {
        Decision {
            verdict: Verdict::Approved,
            risk: RiskLevel::Low,
            reasoning: "policy allow".into(),
            decided_by: DecidedBy::Policy,
            trace: Vec::new(),
        }
    }

    #[test]
    fn insert_get_roundtrip_and_stats() {
        let tier = MemoryTier::new(64, Duration::from_secs(60));
        let fp = Fingerprint::of_bytes(b"req");

        assert!(tier.get(&fp).is_none());
        tier.insert(fp, "shell", decision());
        assert!(tier.get(&fp).is_some());
        let (hits, misses) = tier.stats();
        assert_eq!((hits, misses), (1, 1));
    }

    #[test]
    fn ttl_expiry_is_lazy() {
        let tier = MemoryTier::new(64, Duration::from_millis(0));
        let fp = Fingerprint::of_bytes(b"req");
        tier.insert(fp, "shell", decision());
        assert!(tier.get(&fp).is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn invalidation_by_fingerprint_and_tool() {
        let tier = MemoryTier::new(64, Duration::from_secs(60));
        let a = Fingerprint::of_bytes(b"a");
        let b = Fingerprint::of_bytes(b"b");
        tier.insert(a, "shell", decision());
        tier.insert(b, "file_write", decision());

        tier.invalidate(&[a]);
        assert!(tier.get(&a).is_none());
        assert!(tier.get(&b).is_some());

        tier.invalidate_tools(&["file_write".to_string()]);
        assert!(tier.get(&b).is_none());
    }
}
