//! Address parsing and formatting
//!
//! Legacy addresses are Base58Check: a version byte, a 20-byte hash and a
//! 4-byte double SHA-256 checksum. Segwit addresses are Bech32 encodings
//! of a version 0 witness program.

use std::fmt;

use thiserror::Error;

use crate::core::script::{parse_output_script, ScriptType, WITNESS_PKH_LENGTH, WITNESS_SH_LENGTH};
use crate::crypto::{bech32, double_sha256};
use crate::network::params::Network;

/// Length of a decoded Base58 payload: version byte plus 20-byte hash
const BASE58_PAYLOAD_LENGTH: usize = 21;

const CHECKSUM_LENGTH: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address: {0}")]
    AddressFormat(String),
}

/// Address kinds the wallet can pay to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    P2PKH,
    P2SH,
    Witness,
}

/// A decoded address.
///
/// For `Witness` addresses both `hash` and `program` hold the witness
/// program. Legacy addresses carry a 20-byte `hash` and no program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub kind: AddressType,
    pub hash: Vec<u8>,
    pub program: Option<Vec<u8>>,
    pub network: Network,
}

impl Address {
    /// Build an address from a key/script hash, or from a witness program
    /// when `kind` is `Witness`
    pub fn new(kind: AddressType, hash: Vec<u8>, network: Network) -> Self {
        let program = match kind {
            AddressType::Witness => Some(hash.clone()),
            _ => None,
        };
        Self {
            kind,
            hash,
            program,
            network,
        }
    }

    /// Parse an address string for `network`.
    ///
    /// Mixed-case strings can only be Base58. Anything else is tried as
    /// Bech32 first and falls back to Base58.
    pub fn parse(address: &str, network: Network) -> Result<Self, AddressError> {
        if is_mixed_case(address) {
            return Self::from_base58(address, network);
        }
        Self::from_bech32(address, network).or_else(|_| Self::from_base58(address, network))
    }

    fn from_base58(address: &str, network: Network) -> Result<Self, AddressError> {
        let data = bs58::decode(address)
            .into_vec()
            .map_err(|e| AddressError::AddressFormat(e.to_string()))?;

        if data.len() != BASE58_PAYLOAD_LENGTH + CHECKSUM_LENGTH {
            return Err(AddressError::AddressFormat(
                "Address length is not 20 bytes".to_string(),
            ));
        }

        let (payload, checksum) = data.split_at(BASE58_PAYLOAD_LENGTH);
        if double_sha256(payload)[..CHECKSUM_LENGTH] != *checksum {
            return Err(AddressError::AddressFormat(
                "Checksum does not validate".to_string(),
            ));
        }

        let params = network.params();
        let kind = match payload[0] {
            v if v == params.address_version => AddressType::P2PKH,
            v if v == params.address_script_version => AddressType::P2SH,
            v => {
                return Err(AddressError::AddressFormat(format!(
                    "Address version {} is not correct",
                    v
                )))
            }
        };

        Ok(Self::new(kind, payload[1..].to_vec(), network))
    }

    fn from_bech32(address: &str, network: Network) -> Result<Self, AddressError> {
        let (hrp, program) = bech32::decode_witness_program(address)
            .map_err(|e| AddressError::AddressFormat(e.to_string()))?;

        let params = network.params();
        if hrp != params.segwit_hrp {
            return Err(AddressError::AddressFormat(format!(
                "Address HRP {} is not correct",
                hrp
            )));
        }

        if program.len() != WITNESS_PKH_LENGTH && program.len() != WITNESS_SH_LENGTH {
            return Err(AddressError::AddressFormat(format!(
                "Invalid witness program length {}",
                program.len()
            )));
        }

        Ok(Self::new(AddressType::Witness, program, network))
    }

    /// Address paid by a standard locking script, if it has one
    pub fn from_output_script(script: &[u8], network: Network) -> Option<Self> {
        let parsed = parse_output_script(script);
        let hash = parsed.key_hash?;
        let kind = match parsed.script_type {
            ScriptType::P2PKH | ScriptType::P2PK => AddressType::P2PKH,
            ScriptType::P2SH => AddressType::P2SH,
            ScriptType::P2WPKH | ScriptType::P2WSH => AddressType::Witness,
            ScriptType::Unknown => return None,
        };
        Some(Self::new(kind, hash, network))
    }

    pub fn script_type(&self) -> ScriptType {
        match self.kind {
            AddressType::P2PKH => ScriptType::P2PKH,
            AddressType::P2SH => ScriptType::P2SH,
            AddressType::Witness => match &self.program {
                Some(program) if program.len() == WITNESS_PKH_LENGTH => ScriptType::P2WPKH,
                _ => ScriptType::P2WSH,
            },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.network.params();
        let version = match self.kind {
            AddressType::Witness => {
                let program = self.program.as_ref().unwrap_or(&self.hash);
                let encoded = bech32::encode_witness_program(params.segwit_hrp, program)
                    .map_err(|_| fmt::Error)?;
                return f.write_str(&encoded);
            }
            AddressType::P2PKH => params.address_version,
            AddressType::P2SH => params.address_script_version,
        };

        let mut bytes = Vec::with_capacity(BASE58_PAYLOAD_LENGTH + CHECKSUM_LENGTH);
        bytes.push(version);
        bytes.extend_from_slice(&self.hash);
        let checksum = double_sha256(&bytes);
        bytes.extend_from_slice(&checksum[..CHECKSUM_LENGTH]);

        f.write_str(&bs58::encode(bytes).into_string())
    }
}

fn is_mixed_case(address: &str) -> bool {
    address.chars().any(|c| c.is_ascii_lowercase()) && address.chars().any(|c| c.is_ascii_uppercase())
}
