// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use data_encoding::BASE64;
use serde_json::{json, Value};

/// Default filter geometry, tuned for about a hundred entries.
pub const DEFAULT_BITS: usize = 960;
pub const DEFAULT_HASHES: u32 = 7;

/// A counted bloom filter answering "is this code jig already local."
///
/// Positions are murmur3-32 of the key under seeds `1..=hashes`, modulo
/// the bit count. The base64 transport form is the non-counted variant
/// (one bit per bucket) and carries no geometry, so both sides must agree
/// on `bits` and `hashes`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CodeFilter {
    hashes: u32,
    buckets: Vec<u8>,
}

impl CodeFilter {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_BITS, DEFAULT_HASHES)
    }

    pub fn with_params(bits: usize, hashes: u32) -> Self {
        assert!(bits > 0 && bits % 8 == 0, "bits must be a multiple of 8");
        assert!(hashes > 0);
        CodeFilter {
            hashes,
            buckets: vec![0; bits],
        }
    }

    fn positions(&self, key: &str) -> Vec<usize> {
        (1..=self.hashes)
            .map(|seed| murmur3_32(key.as_bytes(), seed) as usize % self.buckets.len())
            .collect()
    }

    pub fn possibly_has(&self, key: &str) -> bool {
        self.positions(key).iter().all(|&p| self.buckets[p] > 0)
    }

    /// Counts the key in. Skipped when the key is already possibly
    /// present, so a later `remove` cannot underflow unrelated entries.
    pub fn add(&mut self, key: &str) {
        if self.possibly_has(key) {
            return;
        }
        for p in self.positions(key) {
            self.buckets[p] = self.buckets[p].saturating_add(1);
        }
    }

    /// Counts the key out; a no-op unless every position is non-zero.
    pub fn remove(&mut self, key: &str) {
        let positions = self.positions(key);
        if !positions.iter().all(|&p| self.buckets[p] > 0) {
            return;
        }
        for p in positions {
            self.buckets[p] -= 1;
        }
    }

    /// Non-counted transport form: one bit per bucket, packed big-endian
    /// within each byte, base64.
    pub fn to_base64(&self) -> String {
        let mut bytes = vec![0u8; self.buckets.len() / 8];
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        BASE64.encode(&bytes)
    }

    /// Rebuilds from the transport form, losing counts: every set bit
    /// deserializes as count one. Geometry comes from the caller.
    pub fn from_base64(s: &str, hashes: u32) -> Option<Self> {
        let bytes = BASE64.decode(s.as_bytes()).ok()?;
        let mut buckets = vec![0u8; bytes.len() * 8];
        for (i, bucket) in buckets.iter_mut().enumerate() {
            if bytes[i / 8] & (0x80 >> (i % 8)) != 0 {
                *bucket = 1;
            }
        }
        Some(CodeFilter { hashes, buckets })
    }

    /// The counted form kept under `config://code-filter`.
    pub fn to_json(&self) -> Value {
        json!({
            "hashes": self.hashes,
            "buckets": self.buckets,
        })
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let hashes = value.get("hashes")?.as_u64()? as u32;
        let buckets: Vec<u8> = value
            .get("buckets")?
            .as_array()?
            .iter()
            .map(|v| v.as_u64().map(|n| n as u8))
            .collect::<Option<_>>()?;
        if hashes == 0 || buckets.is_empty() || buckets.len() % 8 != 0 {
            return None;
        }
        Some(CodeFilter { hashes, buckets })
    }
}

impl Default for CodeFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// murmur3 x86 32-bit. The seeded variant is part of the filter's wire
/// behavior, so it lives here rather than behind a dependency.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn murmur3_known_vectors() {
        // Reference values for the x86 32-bit variant.
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248bfa47);
        assert_eq!(murmur3_32(b"hello, world", 0), 0x149bbb7f);
    }

    #[test]
    fn add_then_has() {
        let mut f = CodeFilter::new();
        assert!(!f.possibly_has("123"));
        f.add("123");
        assert!(f.possibly_has("123"));
    }

    #[test]
    fn remove_clears_after_matching_adds() {
        let mut f = CodeFilter::new();
        f.add("123");
        f.add("123"); // skipped: already possibly present
        f.remove("123");
        assert!(!f.possibly_has("123"));
        // Extra removes are no-ops.
        f.remove("123");
        assert!(!f.possibly_has("123"));
    }

    #[test]
    fn base64_roundtrip_preserves_membership() {
        let mut f = CodeFilter::new();
        f.add("123");
        f.add("456");
        let encoded = f.to_base64();
        assert_eq!(encoded, f.to_base64());
        let decoded = CodeFilter::from_base64(&encoded, DEFAULT_HASHES).unwrap();
        assert!(decoded.possibly_has("123"));
        assert!(decoded.possibly_has("456"));
        assert!(!decoded.possibly_has("789"));
    }

    #[test]
    fn json_roundtrip_preserves_counts() {
        let mut f = CodeFilter::new();
        f.add("a");
        f.add("b");
        let restored = CodeFilter::from_json(&f.to_json()).unwrap();
        assert_eq!(restored, f);
    }

    #[test]
    fn custom_geometry() {
        let mut f = CodeFilter::with_params(64, 3);
        f.add("x");
        assert!(f.possibly_has("x"));
        let decoded = CodeFilter::from_base64(&f.to_base64(), 3).unwrap();
        assert!(decoded.possibly_has("x"));
    }
}
