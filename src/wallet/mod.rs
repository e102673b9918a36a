//! Wallet module for key management

pub mod keychain;

pub use keychain::{
    KeyChain, KeyChainError, KeyProvider, PublicKey, DEFAULT_GAP_LIMIT, KEYS_FILE,
};
