//! Transaction store
//!
//! Wallet transactions keyed by reversed-hex hash, plus the validated
//! header chain. Every transaction mutation goes through `write`, which
//! runs against a draft copy and only replaces the live data (and the file
//! on disk) when the closure succeeds.
//!
//! Headers live in their own file of raw 80-byte records that only ever
//! grows by appending, so syncing the chain never rewrites wallet state.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::encode::DecodeError;
use crate::core::script::ScriptType;
use crate::core::header::{BlockHeader, BLOCK_HEADER_SIZE};
use crate::core::transaction::{OutPoint, Transaction, TransactionStatus};
use crate::crypto::{to_reversed_hex, Hash};
use crate::transactions::{UnspentOutput, UnspentOutputProvider};

/// File name inside the data directory
pub const STORE_FILE: &str = "wallet.json";

/// Append-only header file inside the data directory
pub const HEADERS_FILE: &str = "headers.dat";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Corrupt header file: {0}")]
    HeaderDecode(#[from] DecodeError),
}

/// Wallet state persisted as one JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub transactions: BTreeMap<String, Transaction>,
}

impl StoreData {
    pub fn find_transaction(&self, hash_hex: &str) -> Option<&Transaction> {
        self.transactions.get(hash_hex)
    }

    pub fn find_transaction_mut(&mut self, hash_hex: &str) -> Option<&mut Transaction> {
        self.transactions.get_mut(hash_hex)
    }

    /// Insert or replace a transaction under its hash
    pub fn insert(&mut self, tx: Transaction) {
        self.transactions.insert(tx.hash_hex(), tx);
    }
}

pub struct TransactionStore {
    data: Mutex<StoreData>,
    /// Headers after genesis, in chain order
    headers: Mutex<Vec<BlockHeader>>,
    dir: Option<PathBuf>,
}

impl TransactionStore {
    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            headers: Mutex::new(Vec::new()),
            dir: None,
        }
    }

    /// Open `wallet.json` and `headers.dat` in `data_dir`, creating the
    /// directory if needed
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(STORE_FILE);

        let data: StoreData = if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            StoreData::default()
        };
        let headers = read_headers(&data_dir.join(HEADERS_FILE))?;

        log::info!(
            "Opened store at {} with {} transactions and {} headers",
            data_dir.display(),
            data.transactions.len(),
            headers.len()
        );

        Ok(Self {
            data: Mutex::new(data),
            headers: Mutex::new(headers),
            dir: Some(data_dir.to_path_buf()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_headers(&self) -> MutexGuard<'_, Vec<BlockHeader>> {
        self.headers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a read-only query against a consistent snapshot
    pub fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        f(&self.lock())
    }

    /// Run a read-modify-write transaction. Changes become visible, and
    /// are persisted, only if `f` returns `Ok`.
    pub fn write<R, E>(&self, f: impl FnOnce(&mut StoreData) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let mut data = self.lock();
        let mut draft = data.clone();
        let result = f(&mut draft)?;
        self.persist(&draft)?;
        *data = draft;
        Ok(result)
    }

    fn persist(&self, data: &StoreData) -> Result<(), StorageError> {
        let path = match &self.dir {
            Some(dir) => dir.join(STORE_FILE),
            None => return Ok(()),
        };

        let temp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer(&mut writer, data)?;
        writer.flush()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn find_transaction(&self, hash_hex: &str) -> Option<Transaction> {
        self.read(|data| data.find_transaction(hash_hex).cloned())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        let key = to_reversed_hex(hash);
        self.read(|data| data.transactions.contains_key(&key))
    }

    pub fn transaction_count(&self) -> usize {
        self.read(|data| data.transactions.len())
    }

    /// Hashes of transactions the processor has not seen yet
    pub fn unprocessed_hashes(&self) -> Vec<String> {
        self.read(|data| {
            data.transactions
                .iter()
                .filter(|(_, tx)| !tx.processed)
                .map(|(hash, _)| hash.clone())
                .collect()
        })
    }

    /// Wallet outputs not spent by any wallet transaction
    pub fn unspent_outputs(&self) -> Vec<UnspentOutput> {
        self.read(|data| {
            data.transactions
                .values()
                .filter(|tx| tx.status != TransactionStatus::Invalid)
                .flat_map(|tx| {
                    tx.outputs
                        .iter()
                        .filter(|output| output.is_mine && !output.spent)
                        .map(move |output| UnspentOutput {
                            outpoint: OutPoint::new(tx.hash(), output.index),
                            value: output.value,
                            lock_script: output.lock_script.clone(),
                            script_type: output.script_type,
                            key_hash: output.key_hash.clone(),
                        })
                })
                .collect()
        })
    }

    pub fn balance(&self) -> u64 {
        self.unspent_outputs().iter().map(|output| output.value).sum()
    }

    pub fn headers(&self) -> Vec<BlockHeader> {
        self.lock_headers().clone()
    }

    /// Height of the best stored header (genesis is 0)
    pub fn last_block_height(&self) -> u32 {
        self.lock_headers().len() as u32
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn insert(&self, tx: Transaction) -> Result<(), StorageError> {
        self.write(|data| {
            data.insert(tx);
            Ok(())
        })
    }

    /// Append headers to the chain. Only the new records are written.
    pub fn add_headers(&self, headers: &[BlockHeader]) -> Result<(), StorageError> {
        if headers.is_empty() {
            return Ok(());
        }
        let mut chain = self.lock_headers();
        if let Some(dir) = &self.dir {
            let mut bytes = Vec::with_capacity(headers.len() * BLOCK_HEADER_SIZE);
            for header in headers {
                bytes.extend_from_slice(&header.encode());
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(HEADERS_FILE))?;
            file.write_all(&bytes)?;
        }
        chain.extend_from_slice(headers);
        Ok(())
    }

    pub fn delete_all(&self) -> Result<(), StorageError> {
        self.write(|data| {
            *data = StoreData::default();
            Ok::<(), StorageError>(())
        })?;

        let mut chain = self.lock_headers();
        if let Some(dir) = &self.dir {
            match fs::remove_file(dir.join(HEADERS_FILE)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        chain.clear();
        Ok(())
    }
}

/// Load every complete record of a header file. A torn trailing record
/// from an interrupted append is dropped.
fn read_headers(path: &Path) -> Result<Vec<BlockHeader>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let torn = bytes.len() % BLOCK_HEADER_SIZE;
    if torn != 0 {
        log::warn!("Dropping {} trailing bytes of {}", torn, path.display());
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len((bytes.len() - torn) as u64)?;
    }

    bytes
        .chunks_exact(BLOCK_HEADER_SIZE)
        .map(|record| BlockHeader::from_bytes(record).map_err(StorageError::from))
        .collect()
}

/// Only outputs the key chain signer can unlock are offered for spending
impl UnspentOutputProvider for TransactionStore {
    fn all_unspent_outputs(&self) -> Vec<UnspentOutput> {
        let mut unspent = self.unspent_outputs();
        unspent.retain(|output| matches!(output.script_type, ScriptType::P2PKH | ScriptType::P2PK));
        unspent
    }
}
