//! Bloom filter (BIP 37)
//!
//! Loaded into remote peers with `filterload` so that they only relay
//! transactions and filtered blocks that plausibly touch the wallet.
//! False positives are expected; an inserted element always matches.

use crate::core::script::data_pushes;
use crate::core::transaction::Transaction;

// =============================================================================
// Constants
// =============================================================================

/// Maximum bloom filter size in bytes
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions
pub const MAX_HASH_FUNCS: u32 = 50;

/// Multiplier that spreads hash-function seeds apart
const SEED_MULTIPLIER: u32 = 0xFBA4_C795;

/// Bloom filter update flags
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

// =============================================================================
// Bloom Filter
// =============================================================================

/// Bloom filter for wallet key and transaction matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update flags
    flags: u8,
}

impl BloomFilter {
    /// Create a filter sized for `n_elements` at the target false positive rate
    pub fn new(n_elements: usize, fp_rate: f64, tweak: u32, flags: u8) -> Self {
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let n = n_elements as f64;

        let size_bits = (-1.0 / ln2_squared * n * fp_rate.ln()) as usize;
        let size_bytes = (size_bits.min(MAX_BLOOM_FILTER_SIZE * 8) / 8).max(1);

        let hash_funcs = if n_elements == 0 {
            1
        } else {
            ((size_bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32
        };

        Self {
            data: vec![0u8; size_bytes],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    /// Create a filter over the given elements with a random tweak
    pub fn with_elements(elements: &[Vec<u8>], fp_rate: f64) -> Self {
        let mut filter = Self::new(elements.len(), fp_rate, rand::random(), BLOOM_UPDATE_ALL);
        for element in elements {
            filter.insert(element);
        }
        filter
    }

    /// Rebuild a filter from its wire fields
    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8) -> Self {
        Self {
            data,
            hash_funcs,
            tweak,
            flags,
        }
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for i in 0..self.hash_funcs {
            let idx = self.hash(data, i);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| {
            let idx = self.hash(data, i);
            self.data[idx >> 3] & (1 << (idx & 7)) != 0
        })
    }

    /// Check whether a transaction touches anything in the filter: its
    /// hash, a data push in any output script, or a spent outpoint
    pub fn matches_transaction(&self, tx: &Transaction) -> bool {
        if self.contains(&tx.hash()) {
            return true;
        }

        let output_match = tx.outputs.iter().any(|output| {
            data_pushes(&output.lock_script)
                .iter()
                .any(|push| self.contains(push))
        });
        if output_match {
            return true;
        }

        tx.inputs.iter().any(|input| {
            self.contains(&input.previous_output.to_bytes())
                || data_pushes(&input.sig_script)
                    .iter()
                    .any(|push| self.contains(push))
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Get filter size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn hash(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(seed, data) as usize % (self.data.len() * 8)
    }
}

/// MurmurHash3 (x86, 32-bit)
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let blocks = data.chunks_exact(4);
    let tail = blocks.remainder();

    for block in blocks {
        let mut k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 ^= u32::from(*byte) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{OutPoint, TransactionInput, TransactionOutput};

    #[test]
    fn test_murmur3_vectors() {
        assert_eq!(murmur3(0, b""), 0);
        assert_eq!(murmur3(0xFBA4_C795, b""), 0x6a39_6f08);
        assert_eq!(murmur3(0xffff_ffff, b""), 0x81f1_6f39);
        assert_eq!(murmur3(0, &[0x00]), 0x514e_28b7);
        assert_eq!(murmur3(0, &[0x00, 0x11, 0x22, 0x33]), 0xb447_1bf8);
    }

    #[test]
    fn test_bip37_filter_layout() {
        let mut filter = BloomFilter::new(3, 0.01, 0, BLOOM_UPDATE_ALL);

        let first = hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap();
        filter.insert(&first);
        assert!(filter.contains(&first));

        let other = hex::decode("19108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap();
        assert!(!filter.contains(&other));

        filter.insert(&hex::decode("b5a2c786d9ef4658287ced5914b37a1b4aa32eee").unwrap());
        filter.insert(&hex::decode("b9300670b4c5366e95b2699e8b18bc75e5f729c5").unwrap());

        assert_eq!(filter.hash_funcs(), 5);
        assert_eq!(hex::encode(filter.data()), "614e9b");
    }

    #[test]
    fn test_no_false_negatives() {
        let elements: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let filter = BloomFilter::with_elements(&elements, 0.0001);

        for element in &elements {
            assert!(filter.contains(element));
        }
    }

    #[test]
    fn test_empty_filter_sizing() {
        let filter = BloomFilter::new(0, 0.00005, 0, BLOOM_UPDATE_ALL);
        assert!(filter.size() > 0);
        assert!(filter.hash_funcs() > 0);

        let capped = BloomFilter::new(10_000_000, 0.0001, 0, BLOOM_UPDATE_ALL);
        assert_eq!(capped.size(), MAX_BLOOM_FILTER_SIZE);
        assert!(capped.hash_funcs() <= MAX_HASH_FUNCS);
    }

    #[test]
    fn test_matches_transaction_by_output_key_hash() {
        let key_hash = hex::decode("cbc20a7664f2f69e5355aa427045bc15e7c6c772").unwrap();
        let mut filter = BloomFilter::new(100, 0.0001, 0, BLOOM_UPDATE_ALL);
        filter.insert(&key_hash);

        let mut lock_script = vec![0x76, 0xa9, 0x14];
        lock_script.extend_from_slice(&key_hash);
        lock_script.extend_from_slice(&[0x88, 0xac]);

        let tx = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([7u8; 32], 0), vec![])],
            vec![TransactionOutput::new(5_000, lock_script, 0)],
            0,
        );
        assert!(filter.matches_transaction(&tx));

        let unrelated = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([8u8; 32], 1), vec![])],
            vec![TransactionOutput::new(5_000, vec![0x6a], 0)],
            0,
        );
        assert!(!filter.matches_transaction(&unrelated));
    }

    #[test]
    fn test_matches_transaction_by_spent_outpoint() {
        let outpoint = OutPoint::new([3u8; 32], 2);
        let mut filter = BloomFilter::new(100, 0.0001, 0, BLOOM_UPDATE_ALL);
        filter.insert(&outpoint.to_bytes());

        let tx = Transaction::new(
            1,
            vec![TransactionInput::new(outpoint, vec![])],
            vec![TransactionOutput::new(1_000, vec![0x6a], 0)],
            0,
        );
        assert!(filter.matches_transaction(&tx));
    }
}
