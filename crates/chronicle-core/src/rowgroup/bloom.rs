//! Persisted bloom filters for row-group column statistics.
//!
//! Hashing must be stable across processes because filters are serialized
//! into row-group metadata, so indexes derive from CRC32 double hashing
//! rather than the std hashers.

use serde::{Deserialize, Serialize};

const BITS_PER_ITEM: usize = 10;
const NUM_HASHES: u32 = 7;

/// Fixed-size bloom filter over canonical scalar encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    k: u32,
}

impl BloomFilter {
    /// Size the filter for an expected item count (~1% false positives).
    #[must_use]
    pub fn with_capacity(expected_items: usize) -> Self {
        let num_bits = (expected_items.max(1) * BITS_PER_ITEM) as u64;
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits: words as u64 * 64,
            k: NUM_HASHES,
        }
    }

    fn probe_positions(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = u64::from(crc32fast::hash(key));
        // Seeded second hash; forced odd so probes cover the bit array.
        let mut seeded = crc32fast::Hasher::new();
        seeded.update(&[0x9e]);
        seeded.update(key);
        let h2 = u64::from(seeded.finalize()) | 1;
        let num_bits = self.num_bits;
        (0..u64::from(self.k)).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2))) % num_bits)
    }

    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<u64> = self.probe_positions(key).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// `false` means the key is definitely absent.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.probe_positions(key)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    /// Serialized size in bytes, for cache accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bits.len() * 8 + 16
    }
}
