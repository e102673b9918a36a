//! Connects inputs to the outputs they spend

use crate::core::transaction::{Transaction, TransactionInput, TransactionOutput};
use crate::crypto::to_reversed_hex;
use crate::storage::StoreData;

pub trait TransactionLinker: Send + Sync {
    /// Link `tx` against everything already stored. `tx` itself is not
    /// in `data` while this runs.
    fn handle(&self, tx: &mut Transaction, data: &mut StoreData);
}

/// Marks wallet outputs spent and their spenders as ours. Works in both
/// directions since a spender can arrive before the transaction it spends.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputLinker;

impl OutputLinker {
    pub fn new() -> Self {
        Self
    }
}

/// Returns true when the spent output belongs to the wallet
fn link(input: &mut TransactionInput, output: &mut TransactionOutput) -> bool {
    if input.key_hash.is_none() {
        input.key_hash = output.key_hash.clone();
        input.address = output.address.clone();
    }
    if output.is_mine {
        output.spent = true;
    }
    output.is_mine
}

impl TransactionLinker for OutputLinker {
    fn handle(&self, tx: &mut Transaction, data: &mut StoreData) {
        for input in tx.inputs.iter_mut() {
            let previous = &input.previous_output;
            let output = data
                .find_transaction_mut(&to_reversed_hex(&previous.hash))
                .and_then(|prev| prev.outputs.iter_mut().find(|o| o.index == previous.index));
            if let Some(output) = output {
                if link(input, output) {
                    tx.is_mine = true;
                }
            }
        }

        let hash = tx.hash();
        for spender in data.transactions.values_mut() {
            for input in spender
                .inputs
                .iter_mut()
                .filter(|input| input.previous_output.hash == hash)
            {
                let index = input.previous_output.index;
                if let Some(output) = tx.outputs.iter_mut().find(|o| o.index == index) {
                    if link(input, output) {
                        spender.is_mine = true;
                    }
                }
            }
        }
    }
}
