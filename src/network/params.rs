//! Network parameters
//!
//! Every constant that differs between mainnet, testnet and regtest lives
//! in an immutable `NetworkParams` value that components receive
//! explicitly (usually as `Arc<NetworkParams>`).

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::header::BlockHeader;
use crate::crypto::{from_reversed_hex, Hash};

/// Protocol version we announce
pub const PROTOCOL_VERSION: i32 = 70014;

/// First protocol version that supports Bloom filters (BIP37)
pub const BLOOM_FILTER_VERSION: i32 = 70000;

/// From this version on, Bloom support must be advertised with NODE_BLOOM (BIP111)
pub const NO_BLOOM_VERSION: i32 = 70011;

/// Display-order merkle root shared by all three genesis blocks
const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// Supported networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn params(self) -> NetworkParams {
        NetworkParams::new(self)
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Testnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" | "testnet3" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Immutable per-network constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub network: Network,
    /// Message start bytes, as a little-endian u32
    pub magic: u32,
    pub port: u16,
    pub protocol_version: i32,
    /// Base58 version byte for P2PKH addresses
    pub address_version: u8,
    /// Base58 version byte for P2SH addresses
    pub address_script_version: u8,
    /// Bech32 human-readable part for segwit addresses
    pub segwit_hrp: &'static str,
    pub dns_seeds: &'static [&'static str],
    /// Easiest target a header may claim, in compact form
    pub pow_limit: u32,
    pub genesis: BlockHeader,
}

impl NetworkParams {
    pub fn new(network: Network) -> Self {
        let merkle_root: Hash = from_reversed_hex(GENESIS_MERKLE_ROOT).unwrap_or_default();
        let genesis = |timestamp: u32, bits: u32, nonce: u32| BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root,
            timestamp,
            bits,
            nonce,
        };

        match network {
            Network::Mainnet => Self {
                network,
                magic: 0xd9b4_bef9,
                port: 8333,
                protocol_version: PROTOCOL_VERSION,
                address_version: 0,
                address_script_version: 5,
                segwit_hrp: "bc",
                dns_seeds: &[
                    "seed.bitcoin.sipa.be",
                    "dnsseed.bluematt.me",
                    "dnsseed.bitcoin.dashjr.org",
                    "seed.bitcoinstats.com",
                    "seed.bitcoin.jonasschnelli.ch",
                ],
                pow_limit: 0x1d00_ffff,
                genesis: genesis(1_231_006_505, 0x1d00_ffff, 2_083_236_893),
            },
            Network::Testnet => Self {
                network,
                magic: 0x0709_110b,
                port: 18333,
                protocol_version: PROTOCOL_VERSION,
                address_version: 111,
                address_script_version: 196,
                segwit_hrp: "tb",
                dns_seeds: &[
                    "testnet-seed.bitcoin.jonasschnelli.ch",
                    "seed.tbtc.petertodd.org",
                    "testnet-seed.bluematt.me",
                ],
                pow_limit: 0x1d00_ffff,
                genesis: genesis(1_296_688_602, 0x1d00_ffff, 414_098_458),
            },
            Network::Regtest => Self {
                network,
                magic: 0xdab5_bffa,
                port: 18444,
                protocol_version: PROTOCOL_VERSION,
                address_version: 111,
                address_script_version: 196,
                segwit_hrp: "bcrt",
                dns_seeds: &[],
                pow_limit: 0x207f_ffff,
                genesis: genesis(1_296_688_602, 0x207f_ffff, 2),
            },
        }
    }

    pub fn magic_bytes(&self) -> [u8; 4] {
        self.magic.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            Network::Mainnet.params().genesis.hash_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            Network::Testnet.params().genesis.hash_hex(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            Network::Regtest.params().genesis.hash_hex(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_magic_wire_order() {
        assert_eq!(
            Network::Mainnet.params().magic_bytes(),
            [0xf9, 0xbe, 0xb4, 0xd9]
        );
        assert_eq!(
            Network::Testnet.params().magic_bytes(),
            [0x0b, 0x11, 0x09, 0x07]
        );
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("MainNet".parse::<Network>(), Ok(Network::Mainnet));
        assert_eq!("testnet3".parse::<Network>(), Ok(Network::Testnet));
        assert!("signet".parse::<Network>().is_err());
    }
}
