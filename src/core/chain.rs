//! Header chain
//!
//! The SPV view of the block chain: an append-only list of headers linked
//! by previous-hash and each carrying valid proof of work. Full validation
//! (retargeting, scripts) is left to the full nodes we talk to.

use std::collections::HashMap;

use chrono::Utc;
use log::debug;
use thiserror::Error;

use crate::core::header::{compact_to_target, BlockHeader};
use crate::crypto::{to_reversed_hex, Hash};

/// Headers may run at most this far ahead of local time (seconds)
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Maximum headers in one `headers` message
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Header {0} does not connect to the chain tip")]
    Disconnected(String),
    #[error("Header {0} has insufficient proof of work")]
    InsufficientProofOfWork(String),
    #[error("Header {0} claims a target above the proof-of-work limit")]
    BitsAboveLimit(String),
    #[error("Header {0} is too far in the future")]
    TimestampTooFar(String),
}

/// Outcome of connecting a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connected {
    /// The header extended the chain to this height
    Extended(u32),
    /// The header was already part of the chain
    Known(u32),
}

/// Validated chain of headers starting at genesis
#[derive(Debug, Clone)]
pub struct HeaderChain {
    headers: Vec<BlockHeader>,
    index: HashMap<Hash, u32>,
    /// Big-endian target no header may exceed
    pow_limit: [u8; 32],
}

impl HeaderChain {
    /// Start a chain at `genesis`, accepting targets up to the compact
    /// `pow_limit`
    pub fn new(genesis: BlockHeader, pow_limit: u32) -> Self {
        let mut index = HashMap::new();
        index.insert(genesis.hash(), 0);
        Self {
            headers: vec![genesis],
            index,
            pow_limit: compact_to_target(pow_limit).unwrap_or([0xff; 32]),
        }
    }

    /// Rebuild a chain from stored headers (genesis excluded)
    pub fn from_headers(
        genesis: BlockHeader,
        pow_limit: u32,
        headers: &[BlockHeader],
    ) -> Result<Self, ChainError> {
        let mut chain = Self::new(genesis, pow_limit);
        for header in headers {
            chain.connect(header.clone())?;
        }
        Ok(chain)
    }

    /// Height of the tip (genesis is 0)
    pub fn height(&self) -> u32 {
        (self.headers.len() - 1) as u32
    }

    pub fn tip(&self) -> &BlockHeader {
        &self.headers[self.headers.len() - 1]
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip().hash()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u32> {
        self.index.get(hash).copied()
    }

    pub fn header_at(&self, height: u32) -> Option<&BlockHeader> {
        self.headers.get(height as usize)
    }

    /// Validate and append a header to the tip
    pub fn connect(&mut self, header: BlockHeader) -> Result<Connected, ChainError> {
        let hash = header.hash();
        if let Some(height) = self.height_of(&hash) {
            return Ok(Connected::Known(height));
        }

        if header.prev_block != self.tip_hash() {
            return Err(ChainError::Disconnected(to_reversed_hex(&hash)));
        }
        match header.target() {
            Some(target) if target > self.pow_limit => {
                return Err(ChainError::BitsAboveLimit(to_reversed_hex(&hash)))
            }
            Some(_) if header.meets_target() => {}
            _ => return Err(ChainError::InsufficientProofOfWork(to_reversed_hex(&hash))),
        }
        if i64::from(header.timestamp) > Utc::now().timestamp() + MAX_FUTURE_BLOCK_TIME {
            return Err(ChainError::TimestampTooFar(to_reversed_hex(&hash)));
        }

        let height = self.height() + 1;
        debug!("Connected header {} at height {}", to_reversed_hex(&hash), height);
        self.index.insert(hash, height);
        self.headers.push(header);
        Ok(Connected::Extended(height))
    }

    /// Block locator: the last ten hashes, then exponentially sparser, ending at genesis
    pub fn locator(&self) -> Vec<Hash> {
        let mut locator = Vec::new();
        let mut height = self.height() as i64;
        let mut step = 1i64;

        while height > 0 {
            locator.push(self.headers[height as usize].hash());
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        locator.push(self.headers[0].hash());
        locator
    }

    /// Headers after genesis, for persistence
    pub fn headers_after_genesis(&self) -> &[BlockHeader] {
        &self.headers[1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::params::Network;

    fn mine_child(parent: &BlockHeader, timestamp: u32) -> BlockHeader {
        let mut header = BlockHeader {
            version: 4,
            prev_block: parent.hash(),
            merkle_root: [7u8; 32],
            timestamp,
            bits: parent.bits,
            nonce: 0,
        };
        while !header.meets_target() {
            header.nonce += 1;
        }
        header
    }

    fn regtest_chain(length: u32) -> HeaderChain {
        let params = Network::Regtest.params();
        let mut chain = HeaderChain::new(params.genesis, params.pow_limit);
        for i in 0..length {
            let header = mine_child(chain.tip(), 1_600_000_000 + i);
            chain.connect(header).unwrap();
        }
        chain
    }

    #[test]
    fn test_connect_extends_tip() {
        let chain = regtest_chain(5);
        assert_eq!(chain.height(), 5);
        let tip = chain.tip_hash();
        assert_eq!(chain.height_of(&tip), Some(5));
    }

    #[test]
    fn test_known_header_is_idempotent() {
        let mut chain = regtest_chain(2);
        let header = chain.header_at(1).unwrap().clone();
        assert_eq!(chain.connect(header), Ok(Connected::Known(1)));
        assert_eq!(chain.height(), 2);
    }

    #[test]
    fn test_rejects_unlinked_header() {
        let mut chain = regtest_chain(1);
        let mut orphan = mine_child(chain.tip(), 1_600_000_100);
        orphan.prev_block = [1u8; 32];
        assert!(matches!(
            chain.connect(orphan),
            Err(ChainError::Disconnected(_))
        ));
    }

    #[test]
    fn test_rejects_bad_proof_of_work() {
        let mut chain = regtest_chain(0);
        let mut header = mine_child(chain.tip(), 1_600_000_000);
        // An impossible target that no hash can meet
        header.bits = 0x0300_0001;
        assert!(matches!(
            chain.connect(header),
            Err(ChainError::InsufficientProofOfWork(_))
        ));
    }

    #[test]
    fn test_rejects_target_easier_than_limit() {
        // Regtest difficulty is far too easy for a mainnet limit
        let genesis = Network::Regtest.params().genesis;
        let mut chain = HeaderChain::new(genesis, Network::Mainnet.params().pow_limit);
        let header = mine_child(chain.tip(), 1_600_000_000);
        assert!(matches!(
            chain.connect(header),
            Err(ChainError::BitsAboveLimit(_))
        ));
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn test_rejects_future_timestamp() {
        let mut chain = regtest_chain(0);
        let future = (Utc::now().timestamp() + MAX_FUTURE_BLOCK_TIME + 600) as u32;
        let header = mine_child(chain.tip(), future);
        assert!(matches!(
            chain.connect(header),
            Err(ChainError::TimestampTooFar(_))
        ));
    }

    #[test]
    fn test_locator_shape() {
        let chain = regtest_chain(30);
        let locator = chain.locator();
        assert_eq!(locator[0], chain.tip_hash());
        assert_eq!(*locator.last().unwrap(), chain.header_at(0).unwrap().hash());
        assert!(locator.len() < 30);
    }

    #[test]
    fn test_rebuild_from_headers() {
        let chain = regtest_chain(4);
        let genesis = chain.header_at(0).unwrap().clone();
        let rebuilt =
            HeaderChain::from_headers(genesis, 0x207f_ffff, chain.headers_after_genesis()).unwrap();
        assert_eq!(rebuilt.tip_hash(), chain.tip_hash());
    }
}
