//! Negative-lookup filter: a probabilistic set of known-absent keys.
//!
//! A plain Bloom filter sized from expected cardinality and target
//! false-positive rate. Membership can only be added, so the owning cache
//! clears the whole filter whenever a write lands on a key the filter
//! claims absent, and re-creates it on a coarse wall-clock schedule to
//! bound false positives over long runs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub struct NegativeFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    items: usize,
}

impl NegativeFilter {
    /// Size the filter for `expected_items` at `fp_rate` false positives.
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(1e-6, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = (((num_bits as f64 / n) * ln2).round() as u32).clamp(1, 16);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
            items: 0,
        }
    }

    fn index_pair(key: &str) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        key.hash(&mut h1);
        let a = h1.finish();
        let mut h2 = DefaultHasher::new();
        // Independent second hash via a salt.
        0xa5a5_5a5a_u64.hash(&mut h2);
        key.hash(&mut h2);
        let b = h2.finish() | 1; // odd stride
        (a, b)
    }

    pub fn insert(&mut self, key: &str) {
        let (a, b) = Self::index_pair(key);
        for i in 0..self.num_hashes as u64 {
            let bit = a.wrapping_add(i.wrapping_mul(b)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.items += 1;
    }

    pub fn contains(&self, key: &str) -> bool {
        let (a, b) = Self::index_pair(key);
        (0..self.num_hashes as u64).all(|i| {
            let bit = a.wrapping_add(i.wrapping_mul(b)) % self.num_bits;
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.items = 0;
    }

    /// Approximate insert count since the last clear.
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }
}
