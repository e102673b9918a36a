//! Script construction and classification
//!
//! Builds the standard locking scripts for the supported address types,
//! assembles P2PKH unlocking scripts and recognises the standard output
//! templates so that outputs can be matched against wallet keys.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::{Address, AddressType};
use crate::crypto::hash160;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Witness program length of a P2WPKH output
pub const WITNESS_PKH_LENGTH: usize = 20;

/// Witness program length of a P2WSH output
pub const WITNESS_SH_LENGTH: usize = 32;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// A witness address was constructed without its program
    #[error("Witness program missing for witness address")]
    WitnessProgramMissing,
}

// =============================================================================
// Script Types
// =============================================================================

/// Standard output script templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    /// Pay to Public Key Hash
    P2PKH,
    /// Pay to Public Key (bare)
    P2PK,
    /// Pay to Script Hash
    P2SH,
    /// Pay to Witness Public Key Hash
    P2WPKH,
    /// Pay to Witness Script Hash
    P2WSH,
    /// Anything non-standard
    Unknown,
}

impl Default for ScriptType {
    fn default() -> Self {
        ScriptType::Unknown
    }
}

impl ScriptType {
    pub fn is_witness(&self) -> bool {
        matches!(self, ScriptType::P2WPKH | ScriptType::P2WSH)
    }
}

/// Result of matching an output script against the standard templates.
///
/// `key_hash` is the HASH160 of the public key for P2PKH/P2PK/P2WPKH, the
/// script hash for P2SH and the 32-byte program for P2WSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScript {
    pub script_type: ScriptType,
    pub key_hash: Option<Vec<u8>>,
}

/// Classify a locking script
pub fn parse_output_script(script: &[u8]) -> ParsedScript {
    let (script_type, key_hash) = match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            (ScriptType::P2PKH, Some(hash.to_vec()))
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            (ScriptType::P2SH, Some(hash.to_vec()))
        }
        [OP_0, 0x14, program @ ..] if program.len() == WITNESS_PKH_LENGTH => {
            (ScriptType::P2WPKH, Some(program.to_vec()))
        }
        [OP_0, 0x20, program @ ..] if program.len() == WITNESS_SH_LENGTH => {
            (ScriptType::P2WSH, Some(program.to_vec()))
        }
        [len, pubkey @ .., OP_CHECKSIG]
            if usize::from(*len) == pubkey.len() && (pubkey.len() == 33 || pubkey.len() == 65) =>
        {
            (ScriptType::P2PK, Some(hash160(pubkey)))
        }
        _ => (ScriptType::Unknown, None),
    };

    ParsedScript {
        script_type,
        key_hash,
    }
}

/// Collect every data push in a script, stopping at the first truncated push
pub fn data_pushes(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = Vec::new();
    let mut pos = 0;

    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;

        let len = match opcode {
            0x01..=0x4b => usize::from(opcode),
            OP_PUSHDATA1 => match script.get(pos) {
                Some(len) => {
                    pos += 1;
                    usize::from(*len)
                }
                None => break,
            },
            OP_PUSHDATA2 => match script.get(pos..pos + 2) {
                Some(len) => {
                    pos += 2;
                    usize::from(u16::from_le_bytes([len[0], len[1]]))
                }
                None => break,
            },
            OP_PUSHDATA4 => match script.get(pos..pos + 4) {
                Some(len) => {
                    pos += 4;
                    u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize
                }
                None => break,
            },
            _ => continue,
        };

        match script.get(pos..pos + len) {
            Some(data) => pushes.push(data),
            None => break,
        }
        pos += len;
    }

    pushes
}

// =============================================================================
// Script Builder
// =============================================================================

/// Builds locking and unlocking scripts
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptBuilder;

impl ScriptBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Locking script paying to `address`
    pub fn locking_script(&self, address: &Address) -> Result<Vec<u8>, ScriptError> {
        let script = match address.kind {
            AddressType::P2PKH => {
                let mut script = vec![OP_DUP, OP_HASH160];
                push_data(&mut script, &address.hash);
                script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
                script
            }
            AddressType::P2SH => {
                let mut script = vec![OP_HASH160];
                push_data(&mut script, &address.hash);
                script.push(OP_EQUAL);
                script
            }
            AddressType::Witness => {
                let program = address
                    .program
                    .as_ref()
                    .ok_or(ScriptError::WitnessProgramMissing)?;
                let mut script = vec![OP_0];
                push_data(&mut script, program);
                script
            }
        };
        Ok(script)
    }

    /// Unlocking script made of the given pushes (signature, public key)
    pub fn unlocking_script(&self, pushes: &[Vec<u8>]) -> Vec<u8> {
        let mut script = Vec::with_capacity(pushes.iter().map(|p| p.len() + 3).sum());
        for data in pushes {
            push_data(&mut script, data);
        }
        script
    }
}

/// Append `data` to `script` with the minimal push opcode
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < usize::from(OP_PUSHDATA1) {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

// =============================================================================
// Tests
// =============================================================================
