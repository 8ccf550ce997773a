//! Checksums, key hashing, and pooled buffers.
//!
//! Every on-disk structure in the engine is protected by **CRC32C**
//! (Castagnoli polynomial, hardware-accelerated where the platform
//! supports it), and every key is fingerprinted with **SipHash-2-4**
//! under a single fixed, process-wide seed. This module is the only
//! place either algorithm is invoked directly — the block, WAL, SST,
//! stripe, and manifest formats all go through these helpers so the
//! whole database hashes and checksums identically.
//!
//! # SipHash seed
//!
//! The 128-bit seed is a fixed constant ([`SIP_SEED_K0`], [`SIP_SEED_K1`]).
//! All keys in a database use the same seed; `keyFP64` values and bloom
//! filter bits are only comparable across files written under it.
//! Changing the seed is a format break.
//!
//! # Buffer pool
//!
//! [`pool::BufPool`] recycles scratch buffers for the WAL encode path and
//! the stripe writer. Buffers are size-classed to powers of two in
//! `[32 B, 8 MiB]` with bounded per-class free lists; see the submodule
//! docs for the checkout/release contract.

pub mod pool;


use std::hash::Hasher;

use siphasher::sip::SipHasher24;
use siphasher::sip128::{Hasher128, SipHasher24 as SipHasher24x128};

// ------------------------------------------------------------------------------------------------
// SipHash seed — fixed, process-wide, part of the on-disk format
// ------------------------------------------------------------------------------------------------

/// First half of the fixed SipHash-2-4 seed: the ASCII bytes `"AkkaraDB"`
/// packed little-endian.
pub const SIP_SEED_K0: u64 = u64::from_le_bytes(*b"AkkaraDB");

/// Second half of the fixed SipHash-2-4 seed: the ASCII bytes `"AKV_0001"`
/// packed little-endian. The trailing digits version the seed itself.
pub const SIP_SEED_K1: u64 = u64::from_le_bytes(*b"AKV_0001");

// ------------------------------------------------------------------------------------------------
// CRC32C
// ------------------------------------------------------------------------------------------------

/// Computes the CRC32C (Castagnoli) checksum of `data`.
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Continues a CRC32C computation over an additional chunk.
///
/// `crc32c_append(crc32c(a), b)` equals `crc32c` over `a || b`, which the
/// block and SST writers use to checksum discontiguous regions without
/// copying.
#[inline]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

// ------------------------------------------------------------------------------------------------
// SipHash-2-4 key hashing
// ------------------------------------------------------------------------------------------------

/// 64-bit SipHash-2-4 fingerprint of `key` under the fixed seed.
///
/// Stored in the `keyFP64` field of every record header and used to skip
/// full key comparisons on the read path.
#[inline]
pub fn key_fp64(key: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(SIP_SEED_K0, SIP_SEED_K1);
    hasher.write(key);
    hasher.finish()
}

/// 32-bit shard/bucket hash of `key`: the low half of [`key_fp64`].
#[inline]
pub fn key_hash32(key: &[u8]) -> u32 {
    key_fp64(key) as u32
}

/// 128-bit SipHash-2-4 of `key` under the fixed seed, split into the two
/// independent halves used for bloom filter double hashing.
#[inline]
pub fn key_hash128(key: &[u8]) -> (u64, u64) {
    let mut hasher = SipHasher24x128::new_with_keys(SIP_SEED_K0, SIP_SEED_K1);
    hasher.write(key);
    let hash = hasher.finish128();
    (hash.h1, hash.h2)
}

/// Packs the first `min(8, key.len())` bytes of `key` into a `u64`,
/// little-endian, zero-padded.
///
/// This is the `miniKey` header field: an order-free prefix that lets the
/// block scan reject most non-matching records with one integer compare.
#[inline]
pub fn mini_key(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = key.len().min(8);
    bytes[..n].copy_from_slice(&key[..n]);
    u64::from_le_bytes(bytes)
}
