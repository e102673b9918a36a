//! Storage module for wallet persistence

pub mod store;

pub use store::{StorageError, StoreData, TransactionStore, HEADERS_FILE, STORE_FILE};
