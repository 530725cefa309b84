//! Visited-URL deduplication
//!
//! Two layers over normalized URLs: a Bloom filter sized for the configured
//! page budget (no false negatives, ≤1% false positives) in front of an
//! exact set. The exact set is the authority; the Bloom filter exists so the
//! common "never seen" case is decided from a few atomic loads instead of a
//! lock. `insert` is linearizable, so two workers discovering the same link
//! concurrently can never both see "new".

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Fixed-size Bloom filter over atomic words.
struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size for `capacity` items at `fp_rate` false positives.
    fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(64) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(capacity * fp_rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(512);
        let num_hashes = ((num_bits as f64 / capacity) * ln2).round().max(1.0) as u32;

        let words = num_bits.div_ceil(64) as usize;
        let bits = (0..words).map(|_| AtomicU64::new(0)).collect();

        Self {
            bits,
            num_bits: words as u64 * 64,
            num_hashes,
        }
    }

    fn bit_index(&self, key: &str, i: u32) -> u64 {
        // Double hashing: h1 + i*h2 over the bit space
        let h1 = xxh3_64_with_seed(key.as_bytes(), 0);
        let h2 = xxh3_64_with_seed(key.as_bytes(), 0x9e37_79b9);
        h1.wrapping_add((i as u64).wrapping_mul(h2 | 1)) % self.num_bits
    }

    /// True if the key is possibly present.
    fn contains(&self, key: &str) -> bool {
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(key, i);
            let word = &self.bits[(idx / 64) as usize];
            word.load(Ordering::Relaxed) & (1 << (idx % 64)) != 0
        })
    }

    fn set(&self, key: &str) {
        for i in 0..self.num_hashes {
            let idx = self.bit_index(key, i);
            let word = &self.bits[(idx / 64) as usize];
            word.fetch_or(1 << (idx % 64), Ordering::Relaxed);
        }
    }
}

/// Session-scoped visited-URL filter.
pub struct VisitedFilter {
    bloom: BloomFilter,
    exact: Mutex<HashSet<String>>,
}

impl VisitedFilter {
    /// `capacity` should be the session's page budget with headroom for
    /// discovered-but-never-crawled URLs.
    pub fn new(capacity: usize) -> Self {
        Self {
            bloom: BloomFilter::new(capacity, 0.01),
            exact: Mutex::new(HashSet::new()),
        }
    }

    /// Record a normalized URL. Returns true if it was newly added.
    pub fn insert(&self, url: &str) -> bool {
        if !self.bloom.contains(url) {
            // Definitely new; record in both layers. The exact set still
            // decides, covering the race where two callers pass the Bloom
            // check together.
            self.bloom.set(url);
            return self.exact.lock().insert(url.to_string());
        }
        // Bloom hit: either a duplicate or a false positive; the exact set
        // settles it.
        let newly = self.exact.lock().insert(url.to_string());
        if newly {
            self.bloom.set(url);
        }
        newly
    }

    /// Number of distinct URLs recorded.
    pub fn len(&self) -> usize {
        self.exact.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_once() {
        let filter = VisitedFilter::new(1000);
        assert!(filter.insert("https://example.com/a"));
        assert!(!filter.insert("https://example.com/a"));
        assert!(filter.insert("https://example.com/b"));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = VisitedFilter::new(10_000);
        let urls: Vec<String> = (0..5000)
            .map(|i| format!("https://example.com/page/{}", i))
            .collect();
        for url in &urls {
            assert!(filter.insert(url));
        }
        for url in &urls {
            assert!(!filter.insert(url), "lost {}", url);
        }
    }

    #[test]
    fn test_bloom_fp_rate_within_bound() {
        let bloom = BloomFilter::new(10_000, 0.01);
        for i in 0..10_000 {
            bloom.set(&format!("in-{}", i));
        }
        let false_positives = (0..10_000)
            .filter(|i| bloom.contains(&format!("out-{}", i)))
            .count();
        // Generous 3x margin over the target rate
        assert!(false_positives < 300, "fp count {}", false_positives);
    }

    #[test]
    fn test_concurrent_inserts_single_winner() {
        let filter = Arc::new(VisitedFilter::new(1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .filter(|i| f.insert(&format!("https://example.com/{}", i)))
                    .count()
            }));
        }
        let total_new: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Exactly one thread wins each URL
        assert_eq!(total_new, 100);
    }
}
