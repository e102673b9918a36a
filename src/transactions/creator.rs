//! Sending payments
//!
//! Builds a payment with a fresh change key, stores it, schedules a
//! processor run and hands it to the network for relay.

use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::core::transaction::Transaction;
use crate::storage::{StorageError, TransactionStore};
use crate::transactions::builder::{BuilderError, TransactionBuilder};
use crate::transactions::processor::ProcessorQueue;
use crate::wallet::{KeyChainError, KeyProvider};

/// Fee rate in satoshis per byte
pub const DEFAULT_FEE_RATE: u64 = 60;

/// Broadcasts transactions to the network
pub trait TransactionRelay: Send + Sync {
    fn relay(&self, tx: Transaction);
}

#[derive(Error, Debug)]
pub enum CreatorError {
    #[error("Transaction already exists: {0}")]
    TransactionAlreadyExists(String),
    #[error("No change key: {0}")]
    ChangeKey(#[from] KeyChainError),
    #[error("Failed to build transaction: {0}")]
    Build(#[from] BuilderError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct TransactionCreator {
    store: Arc<TransactionStore>,
    builder: TransactionBuilder,
    processor: Arc<dyn ProcessorQueue>,
    relay: Arc<dyn TransactionRelay>,
    keys: Arc<dyn KeyProvider>,
    fee_rate: u64,
}

impl TransactionCreator {
    pub fn new(
        store: Arc<TransactionStore>,
        builder: TransactionBuilder,
        processor: Arc<dyn ProcessorQueue>,
        relay: Arc<dyn TransactionRelay>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            store,
            builder,
            processor,
            relay,
            keys,
            fee_rate: DEFAULT_FEE_RATE,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: u64) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    /// Pay `value` satoshis to `address`; the sender pays the fee
    pub fn create(&self, address: &str, value: u64) -> Result<Transaction, CreatorError> {
        let change_key = self.keys.change_public_key()?;
        let tx = self
            .builder
            .build_transaction(value, address, self.fee_rate, true, &change_key)?;

        let hash_hex = tx.hash_hex();
        self.store.write(|data| {
            if data.find_transaction(&hash_hex).is_some() {
                return Err(CreatorError::TransactionAlreadyExists(format!(
                    "hash = {}",
                    hash_hex
                )));
            }
            data.insert(tx.clone());
            Ok(())
        })?;

        info!("Created transaction {} paying {} to {}", hash_hex, value, address);
        self.processor.enqueue_run();
        self.relay.relay(tx.clone());
        Ok(tx)
    }

    /// Fee `create` would charge for this payment
    pub fn fee(&self, address: &str, value: u64) -> Result<u64, CreatorError> {
        Ok(self.builder.fee(value, self.fee_rate, true, address)?)
    }
}
