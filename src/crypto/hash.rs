//! Hashing primitives used across the wallet
//!
//! Bitcoin composes a handful of digests: double SHA-256 for block and
//! transaction identity, checksums and merkle nodes, and HASH160
//! (RIPEMD-160 of SHA-256) for public key and script hashes.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// A 32-byte hash in internal (wire) byte order
pub type Hash = [u8; 32];

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// RIPEMD-160 of SHA-256, used for key hashes and script hashes
pub fn hash160(data: &[u8]) -> Vec<u8> {
    let mut ripemd = Ripemd160::new();
    ripemd.update(Sha256::digest(data));
    ripemd.finalize().to_vec()
}

/// Double SHA-256 of the concatenation of two hashes (merkle node)
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    double_sha256(&data)
}

/// Hex string in display order (byte-reversed), as block explorers show it
pub fn to_reversed_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order hex string back into a wire-order hash
pub fn from_reversed_hex(hex_str: &str) -> Option<Hash> {
    let bytes = hex::decode(hex_str).ok()?;
    let mut hash: Hash = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}
