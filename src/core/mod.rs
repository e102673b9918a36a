//! Core Bitcoin data structures
//!
//! This module contains the building blocks shared by the network and
//! wallet layers:
//! - Wire encoding primitives
//! - Addresses (Base58Check and Bech32) and scripts
//! - Transactions with legacy signature hashing
//! - Block headers, filtered merkle blocks and the header chain

pub mod address;
pub mod chain;
pub mod encode;
pub mod header;
pub mod merkle_block;
pub mod script;
pub mod transaction;

pub use address::{Address, AddressError, AddressType};
pub use chain::{ChainError, Connected, HeaderChain, MAX_HEADERS_PER_MESSAGE};
pub use encode::{DecodeError, Reader, WriteExt};
pub use header::{BlockHeader, BLOCK_HEADER_SIZE};
pub use merkle_block::{MerkleBlock, MerkleBlockError};
pub use script::{ScriptBuilder, ScriptError, ScriptType};
pub use transaction::{
    OutPoint, Transaction, TransactionInput, TransactionOutput, TransactionStatus, SEQUENCE_FINAL,
    TX_VERSION,
};
