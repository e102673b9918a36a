//! Cryptographic utilities for the wallet
//!
//! This module provides:
//! - SHA-256, double SHA-256 and HASH160 digests
//! - ECDSA key management (secp256k1)
//! - Bech32 encoding for segwit addresses
//! - BIP37 Bloom filters

pub mod bech32;
pub mod bloom;
pub mod hash;
pub mod keys;

pub use bloom::BloomFilter;
pub use hash::{
    double_sha256, from_reversed_hex, hash160, hash_pair, sha256, to_reversed_hex, Hash,
};
pub use keys::{public_key_from_slice, KeyError, KeyPair};
