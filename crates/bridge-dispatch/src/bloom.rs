//! A compact concurrent Bloom filter fronting the memory tier.
//!
//! Membership is approximate in one direction only: `maybe_contains` can
//! return a false positive (costing one harmless table probe) but never a
//! false negative, so a miss short-circuits without touching the cache.

use std::sync::atomic::{AtomicU64, Ordering};

use bridge_types::Fingerprint;

/// Number of hash probes per key.
const PROBES: usize = 4;

/// Fixed-size Bloom filter over fingerprints.
#[derive(Debug)]
pub(crate) struct BloomFilter {
    bits: Vec<AtomicU64>,
    mask: u64,
}

impl BloomFilter {
    /// Create a filter with `words * 64` bits; `words` is rounded up to a
    /// power of two.
    pub(crate) fn new(words: usize) -> Self {
        let words = words.next_power_of_two().max(16);
        let bits = (0..words).map(|_| AtomicU64::new(0)).collect();
        Self { bits, mask: (words as u64 * 64) - 1 }
    }

    /// Derive probe positions from the fingerprint via double hashing: the
    /// digest already has uniform bytes, so two 64-bit lanes suffice.
    fn positions(&self, fp: &Fingerprint) -> [u64; PROBES] {
        let bytes = fp.as_bytes();
        let h1 = u64::from_le_bytes(bytes[0..8].try_into().expect("digest width"));
        let h2 = u64::from_le_bytes(bytes[8..16].try_into().expect("digest width"))
            | 1; // odd stride so probes cycle the whole table
        let mut out = [0u64; PROBES];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = h1.wrapping_add(h2.wrapping_mul(i as u64)) & self.mask;
        }
        out
    }

    pub(crate) fn insert(&self, fp: &Fingerprint) {
        for pos in self.positions(fp) {
            let word = (pos / 64) as usize;
            let bit = 1u64 << (pos % 64);
            self.bits[word].fetch_or(bit, Ordering::Relaxed);
        }
    }

    pub(crate) fn maybe_contains(&self, fp: &Fingerprint) -> bool {
        self.positions(fp).iter().all(|pos| {
            let word = (*pos / 64) as usize;
            let bit = 1u64 << (pos % 64);
            self.bits[word].load(Ordering::Relaxed) & bit != 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let bloom = BloomFilter::new(64);
        let fps: Vec<Fingerprint> = (0..500u32)
            .map(|i| Fingerprint::of_bytes(&i.to_le_bytes()))
            .collect();
        for fp in &fps {
            bloom.insert(fp);
        }
        for fp in &fps {
            assert!(bloom.maybe_contains(fp));
        }
    }

    #[test]
    fn unknown_keys_mostly_miss() {
        let bloom = BloomFilter::new(1024);
        for i in 0..500u32 {
            bloom.insert(&Fingerprint::of_bytes(&i.to_le_bytes()));
        }
        let false_positives = (10_000..11_000u32)
            .filter(|i| bloom.maybe_contains(&Fingerprint::of_bytes(&i.to_le_bytes())))
            .count();
        // Sized generously for the load above; a handful of collisions is
        // expected, wholesale failure is not.
        assert!(false_positives < 100, "false positive rate too high: {false_positives}");
    }
}
