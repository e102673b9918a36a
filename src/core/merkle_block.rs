//! Filtered blocks (BIP37 `merkleblock`)
//!
//! A merkle block carries a header plus a partial merkle tree: a
//! depth-first list of hashes and a bit per visited node. Walking the tree
//! recomputes the root, which must equal the header's merkle root, and
//! yields the hashes of the matched transactions. The peer then attaches
//! the matching `tx` messages until the block is complete.

use thiserror::Error;

use crate::core::encode::{DecodeError, Reader, WriteExt};
use crate::core::header::BlockHeader;
use crate::core::transaction::Transaction;
use crate::crypto::{hash_pair, to_reversed_hex, Hash};

/// Upper bound on transactions in a block (max weight / min tx weight)
pub const MAX_BLOCK_TRANSACTIONS: u32 = 4_000_000 / 240;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleBlockError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Merkle root mismatch: header {expected}, computed {computed}")]
    MerkleRootMismatch { expected: String, computed: String },
    #[error("Merkle block has no transactions")]
    NoTransactions,
    #[error("Too many transactions: {0}")]
    TooManyTransactions(u32),
    #[error("More hashes than transactions")]
    TooManyHashes,
    #[error("Ran out of flag bits")]
    BitsOverflow,
    #[error("Ran out of hashes")]
    HashesOverflow,
    #[error("Not all hashes were consumed")]
    UnusedHashes,
    #[error("Not all flag bits were consumed")]
    UnusedBits,
    #[error("Identical sibling hashes in merkle tree")]
    DuplicateSiblings,
}

/// A validated filtered block
#[derive(Debug, Clone)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub block_hash: Hash,
    pub total_transactions: u32,
    pub hashes: Vec<Hash>,
    pub flags: Vec<u8>,
    associated_hashes: Vec<Hash>,
    pub associated_transactions: Vec<Transaction>,
}

impl MerkleBlock {
    /// Build and validate a merkle block from its parts
    pub fn new(
        header: BlockHeader,
        total_transactions: u32,
        hashes: Vec<Hash>,
        flags: Vec<u8>,
    ) -> Result<Self, MerkleBlockError> {
        let (root, matched) = PartialMerkleTree {
            total: total_transactions,
            hashes: &hashes,
            flags: &flags,
        }
        .extract()?;

        if root != header.merkle_root {
            return Err(MerkleBlockError::MerkleRootMismatch {
                expected: to_reversed_hex(&header.merkle_root),
                computed: to_reversed_hex(&root),
            });
        }

        Ok(Self {
            block_hash: header.hash(),
            header,
            total_transactions,
            hashes,
            flags,
            associated_hashes: matched,
            associated_transactions: Vec::new(),
        })
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, MerkleBlockError> {
        let header = BlockHeader::read(reader)?;
        let total = reader.read_u32_le()?;

        let count = reader.read_length()?;
        let mut hashes = Vec::with_capacity(count.min(MAX_BLOCK_TRANSACTIONS as usize));
        for _ in 0..count {
            hashes.push(reader.read_hash()?);
        }
        let flags = reader.read_var_bytes()?;

        Self::new(header, total, hashes, flags)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MerkleBlockError> {
        Self::read(&mut Reader::new(data))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(84 + 9 + self.hashes.len() * 32 + 9 + self.flags.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.total_transactions.to_le_bytes());
        out.put_var_int(self.hashes.len() as u64);
        for hash in &self.hashes {
            out.extend_from_slice(hash);
        }
        out.put_var_bytes(&self.flags);
        out
    }

    /// Hashes of the transactions this block proves, in tree order
    pub fn associated_hashes(&self) -> &[Hash] {
        &self.associated_hashes
    }

    pub fn is_associated(&self, tx_hash: &Hash) -> bool {
        self.associated_hashes.contains(tx_hash)
    }

    /// Attach a matched transaction. Returns false if it is not part of
    /// this block or was already attached.
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        let hash = tx.hash();
        if !self.is_associated(&hash)
            || self
                .associated_transactions
                .iter()
                .any(|existing| existing.hash() == hash)
        {
            return false;
        }
        self.associated_transactions.push(tx);
        true
    }

    /// Every associated hash has its transaction attached
    pub fn is_complete(&self) -> bool {
        self.associated_transactions.len() == self.associated_hashes.len()
    }
}

// =============================================================================
// Partial merkle tree traversal
// =============================================================================

struct PartialMerkleTree<'a> {
    total: u32,
    hashes: &'a [Hash],
    flags: &'a [u8],
}

struct Cursor {
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash>,
}

impl<'a> PartialMerkleTree<'a> {
    /// Recompute the root and collect matched leaves
    fn extract(&self) -> Result<(Hash, Vec<Hash>), MerkleBlockError> {
        if self.total == 0 {
            return Err(MerkleBlockError::NoTransactions);
        }
        if self.total > MAX_BLOCK_TRANSACTIONS {
            return Err(MerkleBlockError::TooManyTransactions(self.total));
        }
        if self.hashes.len() > self.total as usize {
            return Err(MerkleBlockError::TooManyHashes);
        }
        if self.flags.len() * 8 < self.hashes.len() {
            return Err(MerkleBlockError::BitsOverflow);
        }

        let mut height = 0;
        while self.width(height) > 1 {
            height += 1;
        }

        let mut cursor = Cursor {
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };
        let root = self.traverse(height, 0, &mut cursor)?;

        if (cursor.bits_used + 7) / 8 != self.flags.len() {
            return Err(MerkleBlockError::UnusedBits);
        }
        if cursor.hashes_used != self.hashes.len() {
            return Err(MerkleBlockError::UnusedHashes);
        }

        Ok((root, cursor.matched))
    }

    fn width(&self, height: u32) -> u32 {
        ((u64::from(self.total) + (1u64 << height) - 1) >> height) as u32
    }

    fn bit(&self, index: usize) -> Option<bool> {
        self.flags
            .get(index / 8)
            .map(|byte| (byte >> (index % 8)) & 1 == 1)
    }

    fn traverse(&self, height: u32, pos: u32, cursor: &mut Cursor) -> Result<Hash, MerkleBlockError> {
        let parent_of_match = self
            .bit(cursor.bits_used)
            .ok_or(MerkleBlockError::BitsOverflow)?;
        cursor.bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self
                .hashes
                .get(cursor.hashes_used)
                .ok_or(MerkleBlockError::HashesOverflow)?;
            cursor.hashes_used += 1;
            if height == 0 && parent_of_match {
                cursor.matched.push(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2, cursor)?;
        let right = if pos * 2 + 1 < self.width(height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1, cursor)?;
            if right == left {
                return Err(MerkleBlockError::DuplicateSiblings);
            }
            right
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }
}

// =============================================================================
// Tests
// =============================================================================
