//! Transaction pipeline
//!
//! Coin selection, building, signing, relaying and post-processing of
//! wallet transactions.

pub mod builder;
pub mod creator;
pub mod extractor;
pub mod linker;
pub mod processor;
pub mod selector;
pub mod signer;
pub mod size;

pub use builder::{BuilderError, TransactionBuilder};
pub use creator::{CreatorError, TransactionCreator, TransactionRelay, DEFAULT_FEE_RATE};
pub use extractor::{KeyExtractor, TransactionExtractor};
pub use linker::{OutputLinker, TransactionLinker};
pub use processor::{ProcessorError, ProcessorQueue, ProcessorWorker, TransactionProcessor};
pub use selector::{
    DefaultSelector, SelectedUnspentOutputInfo, SelectorError, UnspentOutput,
    UnspentOutputProvider, UnspentOutputSelector,
};
pub use signer::{InputSigner, KeyChainSigner, SignerError};
pub use size::TransactionSizeCalculator;
