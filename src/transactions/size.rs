//! Serialized size estimates used for fee calculation

use crate::core::script::ScriptType;

/// Version, input count, output count and lock time
pub const TX_OVERHEAD_SIZE: u64 = 10;

/// Outpoint, sequence and a signature + compressed key unlocking script
pub const P2PKH_INPUT_SIZE: u64 = 148;

/// Outpoint, sequence and a lone signature
pub const P2PK_INPUT_SIZE: u64 = 114;

/// Value plus script length prefix
const OUTPUT_OVERHEAD: u64 = 9;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionSizeCalculator;

impl TransactionSizeCalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn output_size(&self, script_type: ScriptType) -> u64 {
        let script = match script_type {
            ScriptType::P2PKH | ScriptType::Unknown => 25,
            ScriptType::P2PK => 35,
            ScriptType::P2SH => 23,
            ScriptType::P2WPKH => 22,
            ScriptType::P2WSH => 34,
        };
        OUTPUT_OVERHEAD + script
    }

    pub fn input_size(&self, script_type: ScriptType) -> u64 {
        match script_type {
            ScriptType::P2PK => P2PK_INPUT_SIZE,
            _ => P2PKH_INPUT_SIZE,
        }
    }

    pub fn transaction_size(&self, inputs: &[ScriptType], outputs: &[ScriptType]) -> u64 {
        TX_OVERHEAD_SIZE
            + inputs.iter().map(|t| self.input_size(*t)).sum::<u64>()
            + outputs.iter().map(|t| self.output_size(*t)).sum::<u64>()
    }
}
