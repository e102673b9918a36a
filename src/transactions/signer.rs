//! Input signing

use std::sync::Arc;

use thiserror::Error;

use crate::core::script::ScriptType;
use crate::core::transaction::{Transaction, SIGHASH_ALL};
use crate::crypto::KeyError;
use crate::transactions::selector::UnspentOutput;
use crate::wallet::KeyChain;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Output has no key hash")]
    MissingKeyHash,
    #[error("No private key for {0}")]
    NoPrivateKey(String),
    #[error("Signing failed: {0}")]
    Key(#[from] KeyError),
    #[error("Cannot sign a {0:?} output")]
    UnsupportedScript(ScriptType),
}

/// Produces the data pushes that unlock a spent output
pub trait InputSigner: Send + Sync {
    fn sig_script_data(
        &self,
        tx: &Transaction,
        index: usize,
        output: &UnspentOutput,
    ) -> Result<Vec<Vec<u8>>, SignerError>;
}

/// Signs with keys from the wallet key chain
pub struct KeyChainSigner {
    keys: Arc<KeyChain>,
}

impl KeyChainSigner {
    pub fn new(keys: Arc<KeyChain>) -> Self {
        Self { keys }
    }
}

impl InputSigner for KeyChainSigner {
    fn sig_script_data(
        &self,
        tx: &Transaction,
        index: usize,
        output: &UnspentOutput,
    ) -> Result<Vec<Vec<u8>>, SignerError> {
        // Legacy sighash and scriptSig pushes only unlock these two
        if !matches!(output.script_type, ScriptType::P2PKH | ScriptType::P2PK) {
            return Err(SignerError::UnsupportedScript(output.script_type));
        }
        let key_hash = output.key_hash.as_ref().ok_or(SignerError::MissingKeyHash)?;
        let key_pair = self
            .keys
            .key_pair(key_hash)
            .ok_or_else(|| SignerError::NoPrivateKey(hex::encode(key_hash)))?;

        let digest = tx.signature_hash(index, &output.lock_script);
        let mut signature = key_pair.sign_der(&digest)?;
        signature.push(SIGHASH_ALL as u8);

        match output.script_type {
            ScriptType::P2PK => Ok(vec![signature]),
            _ => Ok(vec![signature, key_pair.public_key_bytes()]),
        }
    }
}
