//! Bloom-filter library.
//!
//! Computes parameter-optimal filters from an expected entry count and a
//! target false-positive probability:
//!
//! ```text
//! m = ceil(-n * ln(p) / (ln 2)^2)      bits
//! k = round((m / n) * ln 2)            hash functions
//! ```
//!
//! Probes use Kirsch-Mitzenmacher double hashing (`h1 + i*h2`) over a
//! selectable base hash. The xx variants come from `xxhash-rust`; FNV-1a
//! and Murmur3 are written out in full because their bit patterns are part
//! of the serialized filter contract.
//!
//! Three layouts trade memory for locality:
//!
//! - `Flat`: k independent positions over the whole bit array
//! - `Blocked`: the first hash picks a 512-byte block, probes stay inside
//! - `RegisterBlocked`: the first hash picks a single u64 word
//!
//! A filter serializes as a typed block (see [`crate::block`]); the header
//! `reserved` field carries the exact bit count, and reload restores the
//! bit count from that field, never from the payload byte length.

use crate::block::{open_block, seal_block, BlockType};
use concord_core::error::{Error, Result};
use std::f64::consts::LN_2;
use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

/// Bytes per block in the `Blocked` layout.
const BLOOM_BLOCK_BYTES: u64 = 512;
/// Bits per block in the `Blocked` layout.
const BLOOM_BLOCK_BITS: u64 = BLOOM_BLOCK_BYTES * 8;

/// Base hash algorithm for probe derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomHashKind {
    /// Murmur3 32-bit finalizer family
    Murmur3_32 = 1,
    /// Murmur3 128-bit x64 variant, truncated to 64 bits
    Murmur3_64 = 2,
    /// FNV-1a, 32-bit
    Fnv1a32 = 3,
    /// FNV-1a, 64-bit
    Fnv1a64 = 4,
    /// xxHash, 32-bit
    Xx32 = 5,
    /// xxHash, 64-bit
    Xx64 = 6,
}

impl BloomHashKind {
    /// Pick a hash for the workload: throughput for large filters,
    /// distribution quality for small ones.
    pub fn auto(expected_entries: u64) -> Self {
        if expected_entries >= 100_000 {
            BloomHashKind::Xx64
        } else {
            BloomHashKind::Murmur3_64
        }
    }

    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(BloomHashKind::Murmur3_32),
            2 => Some(BloomHashKind::Murmur3_64),
            3 => Some(BloomHashKind::Fnv1a32),
            4 => Some(BloomHashKind::Fnv1a64),
            5 => Some(BloomHashKind::Xx32),
            6 => Some(BloomHashKind::Xx64),
            _ => None,
        }
    }

    fn hash(self, data: &[u8], seed: u64) -> u64 {
        match self {
            BloomHashKind::Murmur3_32 => murmur3_32(data, seed as u32) as u64,
            BloomHashKind::Murmur3_64 => murmur3_x64_64(data, seed),
            BloomHashKind::Fnv1a32 => fnv1a_32(data, seed as u32) as u64,
            BloomHashKind::Fnv1a64 => fnv1a_64(data, seed),
            BloomHashKind::Xx32 => xxh32(data, seed as u32) as u64,
            BloomHashKind::Xx64 => xxh64(data, seed),
        }
    }
}

/// Bit-array layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomVariant {
    /// Probes anywhere in the array
    Flat = 1,
    /// Probes confined to one 512-byte block
    Blocked = 2,
    /// Probes confined to one u64 word
    RegisterBlocked = 3,
}

impl BloomVariant {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(BloomVariant::Flat),
            2 => Some(BloomVariant::Blocked),
            3 => Some(BloomVariant::RegisterBlocked),
            _ => None,
        }
    }
}

/// Parameter-optimal bloom filter.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    /// Exact bit count; the word vector may carry up to 63 slack bits.
    bit_count: u64,
    num_hashes: u32,
    hash_kind: BloomHashKind,
    variant: BloomVariant,
    inserted: u32,
}

impl BloomFilter {
    /// Build a filter for `expected_entries` keys at `fp_rate`.
    ///
    /// `InvalidArg` unless `expected_entries > 0` and `fp_rate` is in
    /// the open interval (0, 1).
    pub fn new(expected_entries: u64, fp_rate: f64, hash_kind: BloomHashKind) -> Result<Self> {
        Self::with_variant(expected_entries, fp_rate, hash_kind, BloomVariant::Flat)
    }

    /// Build a filter with an explicit layout variant.
    pub fn with_variant(
        expected_entries: u64,
        fp_rate: f64,
        hash_kind: BloomHashKind,
        variant: BloomVariant,
    ) -> Result<Self> {
        if expected_entries == 0 {
            return Err(Error::InvalidArg(
                "bloom.expected_entries must be > 0".into(),
            ));
        }
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(Error::InvalidArg(format!(
                "bloom.fp_rate must be in (0, 1), got {}",
                fp_rate
            )));
        }
        let n = expected_entries as f64;
        let bit_count = (-n * fp_rate.ln() / (LN_2 * LN_2)).ceil() as u64;
        let bit_count = bit_count.max(64);
        let num_hashes = ((bit_count as f64 / n) * LN_2).round().max(1.0) as u32;
        let words = vec![0u64; ((bit_count + 63) / 64) as usize];
        Ok(BloomFilter {
            words,
            bit_count,
            num_hashes,
            hash_kind,
            variant,
            inserted: 0,
        })
    }

    /// Exact bit count `m`.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Hash-function count `k`.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Keys inserted so far.
    pub fn inserted(&self) -> u32 {
        self.inserted
    }

    /// Add a key.
    pub fn insert(&mut self, key: &[u8]) {
        for bit in self.probes(key) {
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    /// Whether the key may be present. False means definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.probes(key)
            .iter()
            .all(|&bit| self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }

    fn probes(&self, key: &[u8]) -> Vec<u64> {
        let h1 = self.hash_kind.hash(key, 0x9E3779B97F4A7C15);
        let h2 = self.hash_kind.hash(key, 0xC2B2AE3D27D4EB4F) | 1;
        let mut probes = Vec::with_capacity(self.num_hashes as usize);
        match self.variant {
            BloomVariant::Flat => {
                for i in 0..self.num_hashes as u64 {
                    probes.push(h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count);
                }
            }
            BloomVariant::Blocked => {
                let blocks = (self.bit_count / BLOOM_BLOCK_BITS).max(1);
                let base = (h1 % blocks) * BLOOM_BLOCK_BITS;
                let span = BLOOM_BLOCK_BITS.min(self.bit_count - base);
                for i in 0..self.num_hashes as u64 {
                    probes.push(base + h2.wrapping_mul(i + 1) % span);
                }
            }
            BloomVariant::RegisterBlocked => {
                let word_count = self.bit_count / 64;
                let base = (h1 % word_count.max(1)) * 64;
                for i in 0..self.num_hashes as u64 {
                    probes.push(base + h2.wrapping_mul(i + 1) % 64);
                }
            }
        }
        probes
    }

    /// Serialize as a typed bloom block.
    ///
    /// Header: `entry_count` = inserted keys, `reserved` = exact bit count.
    /// Payload: hash kind, variant, k, then the bit words.
    pub fn serialize_block(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + self.words.len() * 8);
        payload.push(self.hash_kind as u8);
        payload.push(self.variant as u8);
        payload.extend_from_slice(&self.num_hashes.to_le_bytes());
        payload.extend_from_slice(&[0u8; 2]); // layout padding, always zero
        for word in &self.words {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        seal_block(
            BlockType::Bloom,
            self.inserted,
            self.bit_count as u32,
            &payload,
        )
    }

    /// Reload a filter from a serialized bloom block.
    ///
    /// The bit count comes from the header's reserved field; a payload
    /// whose word count cannot carry that many bits is corruption.
    pub fn deserialize_block(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = open_block(bytes)?;
        if header.block_type != BlockType::Bloom {
            return Err(Error::Corruption(format!(
                "expected bloom block, found {:?}",
                header.block_type
            )));
        }
        if payload.len() < 8 {
            return Err(Error::Corruption("bloom payload truncated".into()));
        }
        let hash_kind = BloomHashKind::from_u8(payload[0])
            .ok_or_else(|| Error::Corruption(format!("unknown bloom hash {}", payload[0])))?;
        let variant = BloomVariant::from_u8(payload[1])
            .ok_or_else(|| Error::Corruption(format!("unknown bloom variant {}", payload[1])))?;
        let num_hashes = u32::from_le_bytes(payload[2..6].try_into().unwrap());
        let bit_count = header.reserved as u64;
        let word_bytes = &payload[8..];
        if word_bytes.len() % 8 != 0 {
            return Err(Error::Corruption("bloom word array misaligned".into()));
        }
        let words: Vec<u64> = word_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        if (words.len() as u64) * 64 < bit_count {
            return Err(Error::Corruption(format!(
                "bloom bit count {} exceeds payload capacity {}",
                bit_count,
                words.len() * 64
            )));
        }
        Ok(BloomFilter {
            words,
            bit_count,
            num_hashes,
            hash_kind,
            variant,
            inserted: header.entry_count,
        })
    }
}

// ---------------------------------------------------------------------------
// Inline hash implementations (fixed on-disk algorithms)
// ---------------------------------------------------------------------------

fn fnv1a_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = 0x811C9DC5u32 ^ seed;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn fnv1a_64(data: &[u8], seed: u64) -> u64 {
    let mut hash = 0xCBF29CE484222325u64 ^ seed;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001B3);
    }
    hash
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xCC9E2D51;
    const C2: u32 = 0x1B873593;
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xE6546B64);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }
    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EBCA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2AE35);
    h ^ (h >> 16)
}

fn murmur3_x64_64(data: &[u8], seed: u64) -> u64 {
    // MurmurHash3 x64 128-bit core, returning h1 only.
    const C1: u64 = 0x87C37B91114253D5;
    const C2: u64 = 0x4CF5AD432745937F;
    let mut h1 = seed;
    let mut h2 = seed;
    let mut chunks = data.chunks_exact(16);
    for chunk in &mut chunks {
        let mut k1 = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52DCE729);
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x38495AB5);
    }
    let tail = chunks.remainder();
    let mut k1 = 0u64;
    let mut k2 = 0u64;
    for (i, &b) in tail.iter().enumerate() {
        if i < 8 {
            k1 |= (b as u64) << (8 * i);
        } else {
            k2 |= (b as u64) << (8 * (i - 8));
        }
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }
    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1.wrapping_add(h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xFF51AFD7ED558CCD);
    k ^= k >> 33;
    k = k.wrapping_mul(0xC4CEB9FE1A85EC53);
    k ^ (k >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(BloomFilter::new(0, 0.01, BloomHashKind::Xx64).is_err());
        assert!(BloomFilter::new(100, 0.0, BloomHashKind::Xx64).is_err());
        assert!(BloomFilter::new(100, 1.0, BloomHashKind::Xx64).is_err());
        assert!(BloomFilter::new(100, -0.5, BloomHashKind::Xx64).is_err());
    }

    #[test]
    fn test_optimal_parameters() {
        // n=1000, p=0.01 -> m = ceil(1000 * 9.585...) = 9586, k = round(6.64) = 7
        let filter = BloomFilter::new(1000, 0.01, BloomHashKind::Xx64).unwrap();
        assert_eq!(filter.bit_count(), 9586);
        assert_eq!(filter.num_hashes(), 7);
    }

    #[test]
    fn test_no_false_negatives() {
        for kind in [
            BloomHashKind::Murmur3_32,
            BloomHashKind::Murmur3_64,
            BloomHashKind::Fnv1a32,
            BloomHashKind::Fnv1a64,
            BloomHashKind::Xx32,
            BloomHashKind::Xx64,
        ] {
            let mut filter = BloomFilter::new(500, 0.01, kind).unwrap();
            for i in 0..500 {
                filter.insert(format!("key-{}", i).as_bytes());
            }
            for i in 0..500 {
                assert!(
                    filter.might_contain(format!("key-{}", i).as_bytes()),
                    "false negative with {:?}",
                    kind
                );
            }
        }
    }

    #[test]
    fn test_false_positive_rate_is_plausible() {
        let mut filter = BloomFilter::new(1000, 0.01, BloomHashKind::Xx64).unwrap();
        for i in 0..1000 {
            filter.insert(format!("member-{}", i).as_bytes());
        }
        let mut false_positives = 0;
        for i in 0..10_000 {
            if filter.might_contain(format!("absent-{}", i).as_bytes()) {
                false_positives += 1;
            }
        }
        // Target is 1%; allow generous slack for hash variance.
        assert!(
            false_positives < 500,
            "false positive count too high: {}",
            false_positives
        );
    }

    #[test]
    fn test_block_variants_no_false_negatives() {
        for variant in [BloomVariant::Blocked, BloomVariant::RegisterBlocked] {
            let mut filter =
                BloomFilter::with_variant(2000, 0.01, BloomHashKind::Xx64, variant).unwrap();
            for i in 0..2000 {
                filter.insert(format!("key-{}", i).as_bytes());
            }
            for i in 0..2000 {
                assert!(filter.might_contain(format!("key-{}", i).as_bytes()));
            }
        }
    }

    #[test]
    fn test_auto_hash_selection() {
        assert_eq!(BloomHashKind::auto(10), BloomHashKind::Murmur3_64);
        assert_eq!(BloomHashKind::auto(1_000_000), BloomHashKind::Xx64);
    }

    #[test]
    fn test_serialization_preserves_answers() {
        let mut filter = BloomFilter::new(777, 0.02, BloomHashKind::Murmur3_64).unwrap();
        for i in 0..777 {
            filter.insert(format!("k{}", i).as_bytes());
        }
        let block = filter.serialize_block();
        let restored = BloomFilter::deserialize_block(&block).unwrap();

        assert_eq!(restored.bit_count(), filter.bit_count());
        assert_eq!(restored.num_hashes(), filter.num_hashes());
        assert_eq!(restored.inserted(), 777);
        for i in 0..777 {
            assert!(restored.might_contain(format!("k{}", i).as_bytes()));
        }
        for i in 0..2000 {
            let key = format!("other{}", i);
            assert_eq!(
                restored.might_contain(key.as_bytes()),
                filter.might_contain(key.as_bytes())
            );
        }
    }

    #[test]
    fn test_bit_count_comes_from_header_not_length() {
        // n=100, p=0.01 -> m=959, which does not fill its last word; the
        // exact count must survive the round trip.
        let mut filter = BloomFilter::new(100, 0.01, BloomHashKind::Fnv1a32).unwrap();
        filter.insert(b"x");
        let block = filter.serialize_block();
        let restored = BloomFilter::deserialize_block(&block).unwrap();
        assert_eq!(restored.bit_count(), filter.bit_count());
        assert_ne!(restored.bit_count() % 64, 0, "test wants a ragged bit count");
    }

    #[test]
    fn test_corrupted_block_rejected() {
        let mut filter = BloomFilter::new(10, 0.1, BloomHashKind::Xx32).unwrap();
        filter.insert(b"a");
        let mut block = filter.serialize_block();
        let last = block.len() - 1;
        block[last] ^= 0xFF;
        assert!(BloomFilter::deserialize_block(&block).is_err());
    }

    #[test]
    fn test_known_fnv_vectors() {
        // Unseeded FNV-1a reference values
        assert_eq!(fnv1a_32(b"", 0), 0x811C9DC5);
        assert_eq!(fnv1a_64(b"", 0), 0xCBF29CE484222325);
        assert_eq!(fnv1a_32(b"a", 0), 0xE40C292C);
        assert_eq!(fnv1a_64(b"a", 0), 0xAF63DC4C8601EC8C);
    }
}
