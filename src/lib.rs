//! SPV Wallet Kit: the kernel of a Simplified Payment Verification Bitcoin wallet
//!
//! This crate provides:
//! - Base58Check and Bech32 addresses, standard output scripts
//! - Transaction and header wire formats with legacy signature hashing
//! - BIP37 Bloom filters and partial merkle tree validation
//! - A pool of peer connections that syncs headers and filtered blocks
//! - Coin selection, fee and dust policy, signing and relay of payments
//! - JSON persistence of transactions, headers and keys
//!
//! # Example
//!
//! ```rust
//! use spv_wallet_kit::core::{Address, ScriptBuilder};
//! use spv_wallet_kit::network::Network;
//!
//! let address = Address::parse("mmLB5DvGbsb4krT9PJ7WrKmv8DkyvNx1ne", Network::Testnet).unwrap();
//! let script = ScriptBuilder::new().locking_script(&address).unwrap();
//! assert_eq!(script.len(), 25);
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod transactions;
pub mod wallet;

// Re-export commonly used types
pub use core::{Address, AddressType, BlockHeader, HeaderChain, MerkleBlock, Transaction};
pub use crypto::{BloomFilter, KeyPair};
pub use network::{Network, NetworkParams, NodeConfig, PeerGroup, SpvNode};
pub use storage::TransactionStore;
pub use transactions::{TransactionBuilder, TransactionCreator};
pub use wallet::KeyChain;
