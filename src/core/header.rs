//! Block headers
//!
//! The 80-byte header is all an SPV wallet keeps of a block. Its identity
//! is the double SHA-256 of the serialized form, and the hash must not
//! exceed the compact-encoded target in `bits`.

use serde::{Deserialize, Serialize};

use crate::core::encode::{DecodeError, Reader};
use crate::crypto::{double_sha256, to_reversed_hex, Hash};

/// Size of a serialized block header
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    /// Hash of the previous block (wire order)
    pub prev_block: Hash,
    /// Merkle root of the block's transactions (wire order)
    pub merkle_root: Hash,
    /// Unix timestamp
    pub timestamp: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_block);
        out[36..68].copy_from_slice(&self.merkle_root);
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: reader.read_i32_le()?,
            prev_block: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32_le()?,
            bits: reader.read_u32_le()?,
            nonce: reader.read_u32_le()?,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        Self::read(&mut Reader::new(data))
    }

    /// Block hash (wire order)
    pub fn hash(&self) -> Hash {
        double_sha256(&self.encode())
    }

    /// Block hash as shown by explorers
    pub fn hash_hex(&self) -> String {
        to_reversed_hex(&self.hash())
    }

    /// Expand `bits` into a big-endian 256-bit target.
    ///
    /// Returns `None` for negative or overflowing encodings.
    pub fn target(&self) -> Option<[u8; 32]> {
        compact_to_target(self.bits)
    }

    /// Whether the header hash satisfies its own target
    pub fn meets_target(&self) -> bool {
        let target = match self.target() {
            Some(target) => target,
            None => return false,
        };
        let mut hash = self.hash();
        hash.reverse();
        hash <= target
    }
}

/// Decode a compact target (`nBits`) into big-endian bytes
pub fn compact_to_target(bits: u32) -> Option<[u8; 32]> {
    let exponent = (bits >> 24) as usize;
    let mut mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return None;
    }

    let mut target = [0u8; 32];
    if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        target[29..32].copy_from_slice(&mantissa.to_be_bytes()[1..4]);
        return Some(target);
    }

    for (i, byte) in mantissa.to_be_bytes()[1..4].iter().enumerate() {
        let pos = 32 + i;
        if pos < exponent {
            if *byte != 0 {
                return None;
            }
            continue;
        }
        target[pos - exponent] = *byte;
    }
    Some(target)
}
