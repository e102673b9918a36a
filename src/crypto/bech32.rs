//! Native segwit address encoding
//!
//! Wraps the `bech32` crate's segwit codec. Only version 0 witness
//! programs are accepted by the wallet.

use ::bech32::{segwit, Fe32, Hrp};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Bech32Error {
    #[error("Invalid human-readable part: {0}")]
    InvalidHrp(String),
    #[error("Invalid segwit address: {0}")]
    Decode(String),
    #[error("Cannot encode witness program: {0}")]
    Encode(String),
    #[error("Unsupported witness version {0}")]
    UnsupportedVersion(u8),
}

/// Encode a version 0 witness program under `hrp`
pub fn encode_witness_program(hrp: &str, program: &[u8]) -> Result<String, Bech32Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Bech32Error::InvalidHrp(e.to_string()))?;
    segwit::encode(hrp, Fe32::Q, program).map_err(|e| Bech32Error::Encode(e.to_string()))
}

/// Decode a segwit address into its lowercase HRP and version 0 program
pub fn decode_witness_program(address: &str) -> Result<(String, Vec<u8>), Bech32Error> {
    let (hrp, version, program) =
        segwit::decode(address).map_err(|e| Bech32Error::Decode(e.to_string()))?;
    if version != Fe32::Q {
        return Err(Bech32Error::UnsupportedVersion(version.to_u8()));
    }
    Ok((hrp.to_lowercase(), program))
}
