//! Bloom filter over raw property-value strings.
//!
//! One filter per discovery cycle, populated during the index build and
//! consulted before issuing fuzzy queries: a negative answer proves the
//! value appears nowhere in the corpus, so the (much more expensive)
//! ranked search can be skipped. False positives only cost a wasted
//! query; false negatives cannot occur.
//!
//! Classic double hashing: two seeded hash functions combined as
//! `h1 + i*h2` index `k` bits per value.

use std::hash::{BuildHasher, Hash, Hasher};

// Fixed seeds keep membership deterministic across processes.
const SEEDS_A: (u64, u64, u64, u64) = (0x9e37_79b9, 0x85eb_ca6b, 0xc2b2_ae35, 0x27d4_eb2f);
const SEEDS_B: (u64, u64, u64, u64) = (0x1656_67b1, 0x9e37_79b1, 0x5851_f42d, 0x4c95_7f2d);

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    items: usize,
    hasher_a: ahash::RandomState,
    hasher_b: ahash::RandomState,
}

impl BloomFilter {
    /// Size the filter for an expected item count and target false-positive
    /// rate.
    pub fn with_capacity(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
            items: 0,
            hasher_a: ahash::RandomState::with_seeds(SEEDS_A.0, SEEDS_A.1, SEEDS_A.2, SEEDS_A.3),
            hasher_b: ahash::RandomState::with_seeds(SEEDS_B.0, SEEDS_B.1, SEEDS_B.2, SEEDS_B.3),
        }
    }

    fn hash_pair(&self, value: &str) -> (u64, u64) {
        let mut ha = self.hasher_a.build_hasher();
        value.hash(&mut ha);
        let mut hb = self.hasher_b.build_hasher();
        value.hash(&mut hb);
        // h2 must be odd so the probe sequence covers the bit space.
        (ha.finish(), hb.finish() | 1)
    }

    pub fn insert(&mut self, value: &str) {
        let normalized = value.trim().to_ascii_lowercase();
        let (h1, h2) = self.hash_pair(&normalized);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.items += 1;
    }

    /// Membership check: `false` is definitive, `true` may be a false
    /// positive.
    pub fn contains(&self, value: &str) -> bool {
        let normalized = value.trim().to_ascii_lowercase();
        let (h1, h2) = self.hash_pair(&normalized);
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }
}
