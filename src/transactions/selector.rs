//! Coin selection

use thiserror::Error;

use crate::core::script::ScriptType;
use crate::core::transaction::OutPoint;
use crate::transactions::size::TransactionSizeCalculator;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("No unspent outputs available")]
    EmptyUnspentOutputs,
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientUnspentOutputs { have: u64, need: u64 },
    #[error("Value {value} does not cover fee {fee}")]
    ValueBelowFee { value: u64, fee: u64 },
    #[error("Amount out of range: value {value} at fee rate {fee_rate}")]
    AmountOverflow { value: u64, fee_rate: u64 },
}

/// A spendable wallet output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub lock_script: Vec<u8>,
    pub script_type: ScriptType,
    pub key_hash: Option<Vec<u8>>,
}

/// Outputs picked for one payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedUnspentOutputInfo {
    pub outputs: Vec<UnspentOutput>,
    pub total_value: u64,
    pub fee: u64,
}

pub trait UnspentOutputProvider: Send + Sync {
    fn all_unspent_outputs(&self) -> Vec<UnspentOutput>;
}

pub trait UnspentOutputSelector: Send + Sync {
    /// Pick outputs paying `value` to an output of `output_type`. When
    /// `sender_pays` the selection must also cover the fee.
    fn select(
        &self,
        value: u64,
        fee_rate: u64,
        output_type: ScriptType,
        sender_pays: bool,
        unspent: &[UnspentOutput],
    ) -> Result<SelectedUnspentOutputInfo, SelectorError>;
}

/// Accumulates outputs smallest first until the payment is covered.
/// The fee covers the inputs and the payment output; change is priced
/// by the builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSelector {
    calculator: TransactionSizeCalculator,
}

impl DefaultSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnspentOutputSelector for DefaultSelector {
    fn select(
        &self,
        value: u64,
        fee_rate: u64,
        output_type: ScriptType,
        sender_pays: bool,
        unspent: &[UnspentOutput],
    ) -> Result<SelectedUnspentOutputInfo, SelectorError> {
        if unspent.is_empty() {
            return Err(SelectorError::EmptyUnspentOutputs);
        }

        let overflow = SelectorError::AmountOverflow { value, fee_rate };
        let mut sorted: Vec<&UnspentOutput> = unspent.iter().collect();
        sorted.sort_by_key(|output| output.value);

        let mut selected = Vec::new();
        let mut input_types = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        let mut need = value;

        for output in sorted {
            selected.push(output.clone());
            input_types.push(output.script_type);
            total = total.checked_add(output.value).ok_or_else(|| overflow.clone())?;

            let size = self.calculator.transaction_size(&input_types, &[output_type]);
            fee = size.checked_mul(fee_rate).ok_or_else(|| overflow.clone())?;
            need = if sender_pays {
                value.checked_add(fee).ok_or_else(|| overflow.clone())?
            } else {
                value
            };

            if total >= need {
                if !sender_pays && value <= fee {
                    return Err(SelectorError::ValueBelowFee { value, fee });
                }
                return Ok(SelectedUnspentOutputInfo {
                    outputs: selected,
                    total_value: total,
                    fee,
                });
            }
        }

        log::debug!("Selection short: have {}, need {} (fee {})", total, need, fee);
        Err(SelectorError::InsufficientUnspentOutputs { have: total, need })
    }
}
