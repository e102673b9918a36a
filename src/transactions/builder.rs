//! Payment transaction construction
//!
//! Selects coins, creates the payment output and, when it is worth
//! more than it costs to spend, a change output, then signs every input.

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::core::address::{Address, AddressError};
use crate::core::script::{ScriptBuilder, ScriptError, ScriptType};
use crate::core::transaction::{
    Transaction, TransactionInput, TransactionOutput, TransactionStatus, TX_VERSION,
};
use crate::network::params::Network;
use crate::transactions::selector::{
    SelectedUnspentOutputInfo, SelectorError, UnspentOutputProvider, UnspentOutputSelector,
};
use crate::transactions::signer::{InputSigner, SignerError};
use crate::transactions::size::TransactionSizeCalculator;
use crate::wallet::PublicKey;

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Coin selection failed: {0}")]
    Selector(#[from] SelectorError),
    #[error("Signing failed: {0}")]
    Signer(#[from] SignerError),
    #[error("Fee {fee} exceeds value {value}")]
    FeeExceedsValue { value: u64, fee: u64 },
}

pub struct TransactionBuilder {
    network: Network,
    selector: Box<dyn UnspentOutputSelector>,
    provider: Arc<dyn UnspentOutputProvider>,
    signer: Arc<dyn InputSigner>,
    script_builder: ScriptBuilder,
    calculator: TransactionSizeCalculator,
}

impl TransactionBuilder {
    pub fn new(
        network: Network,
        selector: Box<dyn UnspentOutputSelector>,
        provider: Arc<dyn UnspentOutputProvider>,
        signer: Arc<dyn InputSigner>,
    ) -> Self {
        Self {
            network,
            selector,
            provider,
            signer,
            script_builder: ScriptBuilder::new(),
            calculator: TransactionSizeCalculator::new(),
        }
    }

    /// Cost of adding a change output at `fee_rate`. Change worth no
    /// more than this is left to the miner.
    fn change_output_cost(&self, fee_rate: u64) -> u64 {
        self.calculator
            .output_size(ScriptType::P2PKH)
            .saturating_mul(fee_rate)
    }

    fn select(
        &self,
        value: u64,
        fee_rate: u64,
        sender_pays: bool,
        address: &Address,
    ) -> Result<SelectedUnspentOutputInfo, BuilderError> {
        let unspent = self.provider.all_unspent_outputs();
        Ok(self
            .selector
            .select(value, fee_rate, address.script_type(), sender_pays, &unspent)?)
    }

    fn change_value(&self, value: u64, sender_pays: bool, selected: &SelectedUnspentOutputInfo) -> u64 {
        let spent = if sender_pays {
            value.saturating_add(selected.fee)
        } else {
            value
        };
        selected.total_value.saturating_sub(spent)
    }

    pub fn build_transaction(
        &self,
        value: u64,
        to_address: &str,
        fee_rate: u64,
        sender_pays: bool,
        change_key: &PublicKey,
    ) -> Result<Transaction, BuilderError> {
        let address = Address::parse(to_address, self.network)?;
        let selected = self.select(value, fee_rate, sender_pays, &address)?;

        let payment_value = if sender_pays {
            value
        } else {
            value
                .checked_sub(selected.fee)
                .ok_or(BuilderError::FeeExceedsValue {
                    value,
                    fee: selected.fee,
                })?
        };

        let mut payment = TransactionOutput::new(
            payment_value,
            self.script_builder.locking_script(&address)?,
            0,
        );
        payment.address = Some(address.to_string());
        let mut outputs = vec![payment];

        let change = self.change_value(value, sender_pays, &selected);
        if change > self.change_output_cost(fee_rate) {
            let change_address = change_key.address(self.network);
            let mut output = TransactionOutput::new(
                change,
                self.script_builder.locking_script(&change_address)?,
                1,
            );
            output.address = Some(change_address.to_string());
            output.is_mine = true;
            outputs.push(output);
        } else {
            debug!("Dropping change of {} at fee rate {}", change, fee_rate);
        }

        let inputs = selected
            .outputs
            .iter()
            .map(|unspent| {
                let mut input = TransactionInput::new(unspent.outpoint, Vec::new());
                input.key_hash = unspent.key_hash.clone();
                input
            })
            .collect();
        let mut tx = Transaction::new(TX_VERSION, inputs, outputs, 0);

        // Every signature commits to the unsigned transaction
        let mut sig_scripts = Vec::with_capacity(selected.outputs.len());
        for (index, unspent) in selected.outputs.iter().enumerate() {
            let pushes = self.signer.sig_script_data(&tx, index, unspent)?;
            sig_scripts.push(self.script_builder.unlocking_script(&pushes));
        }
        for (input, sig_script) in tx.inputs.iter_mut().zip(sig_scripts) {
            input.sig_script = sig_script;
        }

        tx.update_hash();
        tx.is_mine = true;
        tx.status = TransactionStatus::New;
        Ok(tx)
    }

    /// Fee the sender would pay for this payment, including the change
    /// output when one would be created
    pub fn fee(
        &self,
        value: u64,
        fee_rate: u64,
        sender_pays: bool,
        to_address: &str,
    ) -> Result<u64, BuilderError> {
        let address = Address::parse(to_address, self.network)?;
        let selected = self.select(value, fee_rate, sender_pays, &address)?;

        let change_cost = self.change_output_cost(fee_rate);
        let mut fee = selected.fee;
        if self.change_value(value, sender_pays, &selected) > change_cost {
            fee = fee.saturating_add(change_cost);
        }
        Ok(fee)
    }
}
