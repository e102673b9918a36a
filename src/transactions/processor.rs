//! Post-processing of stored transactions
//!
//! Each run picks up every transaction not yet processed, extracts
//! ownership, links it to the rest of the store and flags it processed,
//! all inside one store transaction. Key look-ahead is topped up
//! afterwards since processing may have used keys.

use std::sync::Arc;

use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::storage::{StorageError, TransactionStore};
use crate::transactions::extractor::TransactionExtractor;
use crate::transactions::linker::TransactionLinker;
use crate::wallet::{KeyChainError, KeyProvider};

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key chain error: {0}")]
    KeyChain(#[from] KeyChainError),
}

/// Schedules processor runs
pub trait ProcessorQueue: Send + Sync {
    fn enqueue_run(&self);
}

pub struct TransactionProcessor {
    store: Arc<TransactionStore>,
    keys: Arc<dyn KeyProvider>,
    extractor: Box<dyn TransactionExtractor>,
    linker: Box<dyn TransactionLinker>,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<TransactionStore>,
        keys: Arc<dyn KeyProvider>,
        extractor: Box<dyn TransactionExtractor>,
        linker: Box<dyn TransactionLinker>,
    ) -> Self {
        Self {
            store,
            keys,
            extractor,
            linker,
        }
    }

    /// Process everything pending. Returns the number of transactions
    /// processed.
    pub fn run(&self) -> Result<usize, ProcessorError> {
        if self.store.unprocessed_hashes().is_empty() {
            return Ok(0);
        }

        let processed = self.store.write(|data| {
            let pending: Vec<String> = data
                .transactions
                .iter()
                .filter(|(_, tx)| !tx.processed)
                .map(|(hash, _)| hash.clone())
                .collect();

            for hash in &pending {
                let mut tx = match data.transactions.remove(hash) {
                    Some(tx) => tx,
                    None => continue,
                };
                self.extractor.extract(&mut tx);
                self.linker.handle(&mut tx, data);
                tx.processed = true;
                data.transactions.insert(hash.clone(), tx);
            }
            Ok::<_, ProcessorError>(pending.len())
        })?;
        // Another run got here first
        if processed == 0 {
            return Ok(0);
        }

        info!("Processed {} transactions", processed);
        self.keys.generate_keys()?;
        Ok(processed)
    }
}

/// Background task that runs the processor on request. Requests that
/// arrive while a run is in progress are folded into the next run.
#[derive(Clone)]
pub struct ProcessorWorker {
    runs: mpsc::UnboundedSender<()>,
}

impl ProcessorWorker {
    /// Start the worker. The number of transactions processed by each
    /// productive run is reported on `done`.
    pub fn spawn(processor: Arc<TransactionProcessor>, done: mpsc::UnboundedSender<usize>) -> Self {
        let (runs, mut requests) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while requests.recv().await.is_some() {
                while requests.try_recv().is_ok() {}

                let processor = processor.clone();
                match tokio::task::spawn_blocking(move || processor.run()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(count)) => {
                        if done.send(count).is_err() {
                            debug!("Nobody is listening for processor runs");
                        }
                    }
                    Ok(Err(e)) => error!("Transaction processing failed: {}", e),
                    Err(e) => error!("Transaction processor panicked: {}", e),
                }
            }
        });

        Self { runs }
    }
}

impl ProcessorQueue for ProcessorWorker {
    fn enqueue_run(&self) {
        if self.runs.send(()).is_err() {
            debug!("Processor worker has stopped, run dropped");
        }
    }
}
