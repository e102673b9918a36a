//! Wallet key pool
//!
//! Keys live on two chains: external keys receive payments, change keys
//! receive the remainder of our own spends. Each chain keeps `gap_limit`
//! unused keys ahead of the last used one so the Bloom filter already
//! covers addresses that may be paid before the wallet sees them used.

use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::{Address, AddressType};
use crate::crypto::{KeyError, KeyPair};
use crate::network::params::Network;

/// File name inside the data directory
pub const KEYS_FILE: &str = "keys.json";

/// Unused keys kept ahead on each chain
pub const DEFAULT_GAP_LIMIT: u32 = 20;

#[derive(Error, Debug)]
pub enum KeyChainError {
    #[error("Key pool exhausted")]
    KeyPoolExhausted,
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A wallet public key and its HASH160
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub public_key: Vec<u8>,
    pub public_key_hash: Vec<u8>,
    pub external: bool,
    pub index: u32,
}

impl PublicKey {
    /// Pay-to-pubkey-hash address for this key
    pub fn address(&self, network: Network) -> Address {
        Address::new(AddressType::P2PKH, self.public_key_hash.clone(), network)
    }
}

/// Source of the wallet's public keys
pub trait KeyProvider: Send + Sync {
    /// Next unused change key
    fn change_public_key(&self) -> Result<PublicKey, KeyChainError>;

    /// Top up both chains to the look-ahead window
    fn generate_keys(&self) -> Result<(), KeyChainError>;

    fn public_keys(&self) -> Vec<PublicKey>;

    fn find_key(&self, key_hash: &[u8]) -> Option<PublicKey> {
        self.public_keys()
            .into_iter()
            .find(|key| key.public_key_hash == key_hash)
    }

    /// Record that a key received funds
    fn mark_used(&self, _key_hash: &[u8]) {}
}

// =============================================================================
// KeyChain
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    private_key_hex: String,
    external: bool,
    index: u32,
    used: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyChainData {
    keys: Vec<StoredKey>,
}

struct Entry {
    key_pair: KeyPair,
    public_key: PublicKey,
    used: bool,
}

impl Entry {
    fn new(key_pair: KeyPair, external: bool, index: u32) -> Self {
        let public_key = PublicKey {
            public_key: key_pair.public_key_bytes(),
            public_key_hash: key_pair.public_key_hash(),
            external,
            index,
        };
        Self {
            key_pair,
            public_key,
            used: false,
        }
    }

    fn stored(&self) -> StoredKey {
        StoredKey {
            private_key_hex: self.key_pair.private_key_hex(),
            external: self.public_key.external,
            index: self.public_key.index,
            used: self.used,
        }
    }
}

pub struct KeyChain {
    entries: Mutex<Vec<Entry>>,
    path: Option<PathBuf>,
    gap_limit: u32,
}

impl KeyChain {
    /// A key pool that is never written to disk
    pub fn in_memory(gap_limit: u32) -> Result<Self, KeyChainError> {
        let chain = Self {
            entries: Mutex::new(Vec::new()),
            path: None,
            gap_limit,
        };
        chain.generate_keys()?;
        Ok(chain)
    }

    /// Load `keys.json` from `data_dir`, or start a new pool there
    pub fn open(data_dir: &Path, gap_limit: u32) -> Result<Self, KeyChainError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(KEYS_FILE);

        let mut entries = Vec::new();
        if path.exists() {
            let data: KeyChainData = serde_json::from_reader(BufReader::new(fs::File::open(&path)?))?;
            for stored in data.keys {
                let key_pair = KeyPair::from_private_key_hex(&stored.private_key_hex)?;
                let mut entry = Entry::new(key_pair, stored.external, stored.index);
                entry.used = stored.used;
                entries.push(entry);
            }
            info!("Loaded {} keys from {}", entries.len(), path.display());
        }

        let chain = Self {
            entries: Mutex::new(entries),
            path: Some(path),
            gap_limit,
        };
        chain.generate_keys()?;
        Ok(chain)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, entries: &[Entry]) -> Result<(), KeyChainError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        let data = KeyChainData {
            keys: entries.iter().map(Entry::stored).collect(),
        };
        let temp_path = path.with_extension("tmp");
        serde_json::to_writer_pretty(BufWriter::new(fs::File::create(&temp_path)?), &data)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// First unused receive key. It stays unused until paid.
    pub fn receive_public_key(&self) -> Result<PublicKey, KeyChainError> {
        self.lock()
            .iter()
            .find(|entry| entry.public_key.external && !entry.used)
            .map(|entry| entry.public_key.clone())
            .ok_or(KeyChainError::KeyPoolExhausted)
    }

    /// Signing key for a public key hash
    pub fn key_pair(&self, key_hash: &[u8]) -> Option<KeyPair> {
        self.lock()
            .iter()
            .find(|entry| entry.public_key.public_key_hash == key_hash)
            .map(|entry| entry.key_pair.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl KeyProvider for KeyChain {
    /// Hands out each change key once
    fn change_public_key(&self) -> Result<PublicKey, KeyChainError> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|entry| !entry.public_key.external && !entry.used)
            .ok_or(KeyChainError::KeyPoolExhausted)?;
        entry.used = true;
        let key = entry.public_key.clone();
        self.persist(&entries)?;
        Ok(key)
    }

    fn generate_keys(&self) -> Result<(), KeyChainError> {
        let mut entries = self.lock();
        let mut added = 0;

        for external in [true, false] {
            let unused = entries
                .iter()
                .filter(|e| e.public_key.external == external && !e.used)
                .count() as u32;
            let mut next_index = entries
                .iter()
                .filter(|e| e.public_key.external == external)
                .map(|e| e.public_key.index + 1)
                .max()
                .unwrap_or(0);

            for _ in unused..self.gap_limit {
                entries.push(Entry::new(KeyPair::generate(), external, next_index));
                next_index += 1;
                added += 1;
            }
        }

        if added > 0 {
            info!("Generated {} look-ahead keys", added);
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn public_keys(&self) -> Vec<PublicKey> {
        self.lock()
            .iter()
            .map(|entry| entry.public_key.clone())
            .collect()
    }

    fn mark_used(&self, key_hash: &[u8]) {
        let mut entries = self.lock();
        let entry = match entries
            .iter_mut()
            .find(|entry| entry.public_key.public_key_hash == key_hash)
        {
            Some(entry) if !entry.used => entry,
            _ => return,
        };
        entry.used = true;
        if let Err(e) = self.persist(&entries) {
            warn!("Failed to save key usage: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(chain: &KeyChain, external: bool) -> usize {
        chain
            .public_keys()
            .iter()
            .filter(|k| k.external == external)
            .count()
    }

    #[test]
    fn test_initial_pool_fills_both_chains() {
        let chain = KeyChain::in_memory(5).unwrap();
        assert_eq!(count(&chain, true), 5);
        assert_eq!(count(&chain, false), 5);

        let indices: Vec<u32> = chain
            .public_keys()
            .iter()
            .filter(|k| !k.external)
            .map(|k| k.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_change_keys_are_handed_out_once() {
        let chain = KeyChain::in_memory(2).unwrap();
        let first = chain.change_public_key().unwrap();
        let second = chain.change_public_key().unwrap();

        assert!(!first.external);
        assert_ne!(first.public_key_hash, second.public_key_hash);
        assert!(matches!(
            chain.change_public_key(),
            Err(KeyChainError::KeyPoolExhausted)
        ));

        chain.generate_keys().unwrap();
        let third = chain.change_public_key().unwrap();
        assert_eq!(third.index, 2);
    }

    #[test]
    fn test_mark_used_extends_look_ahead() {
        let chain = KeyChain::in_memory(3).unwrap();
        let receive = chain.receive_public_key().unwrap();
        assert_eq!(chain.receive_public_key().unwrap(), receive);

        chain.mark_used(&receive.public_key_hash);
        assert_ne!(chain.receive_public_key().unwrap(), receive);

        chain.generate_keys().unwrap();
        assert_eq!(count(&chain, true), 4);
        assert_eq!(count(&chain, false), 3);
    }

    #[test]
    fn test_lookup_by_hash() {
        let chain = KeyChain::in_memory(1).unwrap();
        let key = chain.receive_public_key().unwrap();

        assert_eq!(chain.find_key(&key.public_key_hash), Some(key.clone()));
        let pair = chain.key_pair(&key.public_key_hash).unwrap();
        assert_eq!(pair.public_key_bytes(), key.public_key);
        assert!(chain.find_key(&[0u8; 20]).is_none());
    }

    #[test]
    fn test_address_is_p2pkh() {
        let chain = KeyChain::in_memory(1).unwrap();
        let key = chain.receive_public_key().unwrap();
        let address = key.address(Network::Testnet).to_string();
        let parsed = Address::parse(&address, Network::Testnet).unwrap();
        assert_eq!(parsed.kind, AddressType::P2PKH);
        assert_eq!(parsed.hash, key.public_key_hash);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (change, keys) = {
            let chain = KeyChain::open(dir.path(), 2).unwrap();
            (chain.change_public_key().unwrap(), chain.public_keys())
        };

        let reloaded = KeyChain::open(dir.path(), 2).unwrap();
        assert!(reloaded.public_keys().starts_with(&keys));
        assert_ne!(
            reloaded.change_public_key().unwrap().public_key_hash,
            change.public_key_hash
        );
    }
}
