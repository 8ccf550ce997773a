//! Bloom filter for SST point-lookup prefiltering.
//!
//! Sized from the expected entry count and a target false-positive
//! rate, probed by **double hashing** over the two halves of the
//! 128-bit SipHash key fingerprint: probe `i` tests bit
//! `(h1 + i·h2) mod bit_count`. No false negatives, ever.
//!
//! The filter's bit array, bit count, and probe count are exactly what
//! the SST bloom block (`AKBL`) serializes — see the builder for the
//! on-disk framing.

use crate::codec;

/// Minimum bit count so tiny tables still get a real filter.
const MIN_BITS: u32 = 64;

/// A fixed-size bloom filter over SipHash-fingerprinted keys.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Bit array, LSB-first within each byte.
    bits: Vec<u8>,

    /// Total bits in use (≤ `bits.len() * 8`).
    bit_count: u32,

    /// Probes per key.
    hash_count: u32,
}

impl BloomFilter {
    /// Builds an empty filter sized for `expected` entries at the given
    /// false-positive rate.
    pub fn with_capacity(expected: usize, fp_rate: f64) -> Self {
        let expected = expected.max(1) as f64;
        let fp_rate = fp_rate.clamp(1e-6, 0.5);

        // Standard sizing: bits = -n·ln(p) / ln(2)², probes = bits/n·ln(2).
        let ln2 = std::f64::consts::LN_2;
        let bit_count = ((-expected * fp_rate.ln()) / (ln2 * ln2)).ceil() as u32;
        let bit_count = bit_count.max(MIN_BITS);
        let hash_count = ((bit_count as f64 / expected) * ln2).round().clamp(1.0, 16.0) as u32;

        Self {
            bits: vec![0u8; bit_count.div_ceil(8) as usize],
            bit_count,
            hash_count,
        }
    }

    /// Rebuilds a filter from its serialized parts.
    pub fn from_parts(bits: Vec<u8>, bit_count: u32, hash_count: u32) -> Self {
        Self {
            bits,
            bit_count: bit_count.max(1),
            hash_count: hash_count.clamp(1, 16),
        }
    }

    /// Serialized bit bytes.
    pub fn bit_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Total bits.
    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    /// Probes per key.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    #[inline]
    fn probe_bits(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = codec::key_hash128(key);
        (0..self.hash_count as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count as u64)
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = codec::key_hash128(key);
        for i in 0..self.hash_count as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count as u64;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Membership test: `false` means definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.probe_bits(key)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }
}
