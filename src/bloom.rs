//! Probabilistic membership filter fronting MemTable/SSTable lookups.
//!
//! Not persisted: rebuilt at open by scanning every SSTable (see
//! `Engine::open`). No deletion is supported — once a bit is set it stays
//! set until the whole filter is rebuilt.

use bit_vec::BitVec;
use sha2::{Digest, Sha256};

pub const DEFAULT_BITS: usize = 10_000;
pub const DEFAULT_HASHES: usize = 4;

pub struct BloomFilter {
    bits: BitVec,
    m: usize,
    k: usize,
}

impl BloomFilter {
    pub fn new(m: usize, k: usize) -> Self {
        Self {
            bits: BitVec::from_elem(m, false),
            m,
            k,
        }
    }

    pub fn add(&mut self, item: &str) {
        for idx in self.indices(item) {
            self.bits.set(idx, true);
        }
    }

    pub fn check(&self, item: &str) -> bool {
        self.indices(item).all(|idx| self.bits.get(idx).unwrap_or(false))
    }

    /// Kirsch-Mitzenmacher double hashing: derive `k` indices from two
    /// halves of a SHA-256 digest instead of hashing `k` times.
    fn indices(&self, item: &str) -> impl Iterator<Item = usize> + '_ {
        let digest = Sha256::digest(item.as_bytes());
        let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        let m = self.m as u64;
        (0..self.k).map(move |i| (h1.wrapping_add((i as u64).wrapping_mul(h2)) % m) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_indices() {
        let filter = BloomFilter::new(DEFAULT_BITS, DEFAULT_HASHES);
        let a: Vec<_> = filter.indices("col:key").collect();
        let b: Vec<_> = filter.indices("col:key").collect();
        assert_eq!(a, b);
    }

    #[test]
    fn add_then_check_is_always_true() {
        let mut filter = BloomFilter::new(DEFAULT_BITS, DEFAULT_HASHES);
        filter.add("col:k1");
        assert!(filter.check("col:k1"));
    }

    #[test]
    fn never_added_is_usually_false() {
        let mut filter = BloomFilter::new(DEFAULT_BITS, DEFAULT_HASHES);
        filter.add("col:k1");
        // Not a correctness guarantee (false positives are allowed), but
        // with m=10000/k=4 and a single inserted item this should hold.
        assert!(!filter.check("col:totally-different-key"));
    }
}
