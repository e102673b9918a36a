//! Peer-to-peer message payloads
//!
//! The wallet speaks a fixed subset of the Bitcoin protocol. Received
//! payloads decode into the closed `Message` enum so that handling is a
//! single exhaustive match; anything else becomes `Message::Unknown`.

use std::net::{Ipv6Addr, SocketAddr};

use bitflags::bitflags;
use chrono::Utc;
use thiserror::Error;

use crate::core::encode::{DecodeError, Reader, WriteExt};
use crate::core::header::BlockHeader;
use crate::core::merkle_block::{MerkleBlock, MerkleBlockError};
use crate::core::transaction::Transaction;
use crate::crypto::{BloomFilter, Hash};
use crate::network::params::{NetworkParams, BLOOM_FILTER_VERSION, NO_BLOOM_VERSION};

/// Maximum entries in an `inv` or `getdata` message
pub const MAX_INV_ENTRIES: usize = 50_000;

/// User agent we announce
pub const USER_AGENT: &str = concat!("/spv-wallet-kit:", env!("CARGO_PKG_VERSION"), "/");

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed {command} payload: {source}")]
    Decode {
        command: &'static str,
        source: DecodeError,
    },
    #[error("Invalid merkle block: {0}")]
    MerkleBlock(#[from] MerkleBlockError),
}

bitflags! {
    /// Services advertised in `version`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1;
        const NODE_GETUTXO = 1 << 1;
        const NODE_BLOOM = 1 << 2;
        const NODE_WITNESS = 1 << 3;
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryType {
    Tx,
    Block,
    FilteredBlock,
    Other(u32),
}

impl InventoryType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => InventoryType::Tx,
            2 => InventoryType::Block,
            3 => InventoryType::FilteredBlock,
            other => InventoryType::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            InventoryType::Tx => 1,
            InventoryType::Block => 2,
            InventoryType::FilteredBlock => 3,
            InventoryType::Other(value) => value,
        }
    }
}

/// `(type, hash)` pair naming an object for `inv`/`getdata`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub kind: InventoryType,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn new(kind: InventoryType, hash: Hash) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        Self::new(InventoryType::Tx, hash)
    }

    pub fn filtered_block(hash: Hash) -> Self {
        Self::new(InventoryType::FilteredBlock, hash)
    }
}

// =============================================================================
// Version
// =============================================================================

/// Network address as carried in `version` (no timestamp)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub services: ServiceFlags,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddress {
    pub fn unspecified() -> Self {
        Self {
            services: ServiceFlags::empty(),
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    pub fn from_socket(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr {
            SocketAddr::V4(v4) => v4.ip().to_ipv6_mapped(),
            SocketAddr::V6(v6) => *v6.ip(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let services = ServiceFlags::from_bits_retain(reader.read_u64_le()?);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(reader.read_bytes(16)?);
        let port = reader.read_u16_be()?;
        Ok(Self {
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.bits().to_le_bytes());
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    /// Height of the sender's best block
    pub last_block: i32,
    /// Whether the remote should relay transactions before a filter is set
    pub relay: bool,
}

impl VersionMessage {
    /// Our own `version`: no services, no relay until the Bloom filter arrives
    pub fn ours(params: &NetworkParams, receiver: NetAddress, last_block: i32) -> Self {
        Self {
            version: params.protocol_version,
            services: ServiceFlags::empty(),
            timestamp: Utc::now().timestamp(),
            receiver,
            sender: NetAddress::unspecified(),
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            last_block,
            relay: false,
        }
    }

    pub fn has_full_chain(&self) -> bool {
        self.services.contains(ServiceFlags::NODE_NETWORK)
    }

    /// BIP37 filtering: implied before BIP111, must be advertised after it
    pub fn supports_bloom_filter(&self) -> bool {
        self.version >= BLOOM_FILTER_VERSION
            && (self.version < NO_BLOOM_VERSION || self.services.contains(ServiceFlags::NODE_BLOOM))
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32_le()?;
        let services = ServiceFlags::from_bits_retain(reader.read_u64_le()?);
        let timestamp = reader.read_i64_le()?;
        let receiver = NetAddress::read(reader)?;
        let sender = NetAddress::read(reader)?;
        let nonce = reader.read_u64_le()?;
        let user_agent = reader.read_var_string()?;
        let last_block = reader.read_i32_le()?;
        let relay = if reader.is_empty() {
            true
        } else {
            reader.read_u8()? != 0
        };

        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            last_block,
            relay,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.bits().to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        self.receiver.write(out);
        self.sender.write(out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.put_var_string(&self.user_agent);
        out.extend_from_slice(&self.last_block.to_le_bytes());
        out.push(u8::from(self.relay));
    }
}

/// `getheaders` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<Hash>,
    /// Zero to request as many as the peer will send
    pub stop_hash: Hash,
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    MerkleBlock(Box<MerkleBlock>),
    Tx(Box<Transaction>),
    FilterLoad(BloomFilter),
    /// A command we do not handle; the payload is dropped
    Unknown(String),
}

impl Message {
    /// Wire command name
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::FilterLoad(_) => "filterload",
            Message::Unknown(command) => command.as_str(),
        }
    }

    /// Serialized payload (without the frame header)
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(version) => version.write(&mut out),
            Message::VerAck | Message::Unknown(_) => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                out.extend_from_slice(&nonce.to_le_bytes())
            }
            Message::Inv(items) | Message::GetData(items) => write_inventory(&mut out, items),
            Message::GetHeaders(request) => {
                out.extend_from_slice(&request.version.to_le_bytes());
                out.put_var_int(request.locator.len() as u64);
                for hash in &request.locator {
                    out.extend_from_slice(hash);
                }
                out.extend_from_slice(&request.stop_hash);
            }
            Message::Headers(headers) => {
                out.put_var_int(headers.len() as u64);
                for header in headers {
                    out.extend_from_slice(&header.encode());
                    out.put_var_int(0);
                }
            }
            Message::MerkleBlock(block) => out = block.to_bytes(),
            Message::Tx(tx) => out = tx.to_bytes(),
            Message::FilterLoad(filter) => {
                out.put_var_bytes(filter.data());
                out.extend_from_slice(&filter.hash_funcs().to_le_bytes());
                out.extend_from_slice(&filter.tweak().to_le_bytes());
                out.push(filter.flags());
            }
        }
        out
    }

    /// Decode a payload received under `command`
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(payload);
        let reader = &mut reader;

        let message = match command {
            "version" => Message::Version(VersionMessage::read(reader).map_err(decode("version"))?),
            "verack" => Message::VerAck,
            "ping" => Message::Ping(read_nonce(reader).map_err(decode("ping"))?),
            "pong" => Message::Pong(read_nonce(reader).map_err(decode("pong"))?),
            "inv" => Message::Inv(read_inventory(reader).map_err(decode("inv"))?),
            "getdata" => Message::GetData(read_inventory(reader).map_err(decode("getdata"))?),
            "getheaders" => {
                let version = reader.read_u32_le().map_err(decode("getheaders"))?;
                let count = reader.read_length().map_err(decode("getheaders"))?;
                let mut locator = Vec::with_capacity(count.min(101));
                for _ in 0..count {
                    locator.push(reader.read_hash().map_err(decode("getheaders"))?);
                }
                let stop_hash = reader.read_hash().map_err(decode("getheaders"))?;
                Message::GetHeaders(GetHeadersMessage {
                    version,
                    locator,
                    stop_hash,
                })
            }
            "headers" => Message::Headers(read_headers(reader).map_err(decode("headers"))?),
            "merkleblock" => Message::MerkleBlock(Box::new(MerkleBlock::read(reader)?)),
            "tx" => Message::Tx(Box::new(Transaction::read(reader).map_err(decode("tx"))?)),
            "filterload" => {
                let data = reader.read_var_bytes().map_err(decode("filterload"))?;
                let hash_funcs = reader.read_u32_le().map_err(decode("filterload"))?;
                let tweak = reader.read_u32_le().map_err(decode("filterload"))?;
                let flags = reader.read_u8().map_err(decode("filterload"))?;
                Message::FilterLoad(BloomFilter::from_parts(data, hash_funcs, tweak, flags))
            }
            other => Message::Unknown(other.to_string()),
        };
        Ok(message)
    }
}

fn decode(command: &'static str) -> impl Fn(DecodeError) -> MessageError {
    move |source| MessageError::Decode { command, source }
}

/// Pre-BIP31 pings carry no nonce
fn read_nonce(reader: &mut Reader<'_>) -> Result<u64, DecodeError> {
    if reader.is_empty() {
        return Ok(0);
    }
    reader.read_u64_le()
}

fn read_inventory(reader: &mut Reader<'_>) -> Result<Vec<InventoryItem>, DecodeError> {
    let count = reader.read_length()?;
    if count > MAX_INV_ENTRIES {
        return Err(DecodeError::OversizedLength(count as u64));
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = InventoryType::from_u32(reader.read_u32_le()?);
        let hash = reader.read_hash()?;
        items.push(InventoryItem { kind, hash });
    }
    Ok(items)
}

fn write_inventory(out: &mut Vec<u8>, items: &[InventoryItem]) {
    out.put_var_int(items.len() as u64);
    for item in items {
        out.extend_from_slice(&item.kind.to_u32().to_le_bytes());
        out.extend_from_slice(&item.hash);
    }
}

fn read_headers(reader: &mut Reader<'_>) -> Result<Vec<BlockHeader>, DecodeError> {
    let count = reader.read_length()?;
    let mut headers = Vec::with_capacity(count.min(2000));
    for _ in 0..count {
        headers.push(BlockHeader::read(reader)?);
        // Transaction count, always zero in `headers`
        reader.read_var_int()?;
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::params::Network;

    fn roundtrip(message: &Message) -> Message {
        Message::decode(message.command(), &message.payload()).unwrap()
    }

    #[test]
    fn test_version_roundtrip() {
        let params = Network::Testnet.params();
        let ours = VersionMessage::ours(&params, NetAddress::unspecified(), 0);
        match roundtrip(&Message::Version(ours.clone())) {
            Message::Version(decoded) => assert_eq!(decoded, ours),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_version_without_relay_byte() {
        let params = Network::Mainnet.params();
        let mut payload = Message::Version(VersionMessage::ours(
            &params,
            NetAddress::unspecified(),
            10,
        ))
        .payload();
        payload.pop();

        match Message::decode("version", &payload).unwrap() {
            Message::Version(version) => {
                assert!(version.relay);
                assert_eq!(version.last_block, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bloom_support_rules() {
        let params = Network::Mainnet.params();
        let mut version = VersionMessage::ours(&params, NetAddress::unspecified(), 1);

        version.version = 60_002;
        assert!(!version.supports_bloom_filter());

        version.version = 70_002;
        assert!(version.supports_bloom_filter());

        version.version = 70_015;
        assert!(!version.supports_bloom_filter());
        version.services = ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_BLOOM;
        assert!(version.supports_bloom_filter());
        assert!(version.has_full_chain());
    }

    #[test]
    fn test_inventory_roundtrip() {
        let items = vec![
            InventoryItem::tx([1u8; 32]),
            InventoryItem::new(InventoryType::Block, [2u8; 32]),
            InventoryItem::new(InventoryType::Other(0x4000_0001), [3u8; 32]),
        ];
        match roundtrip(&Message::GetData(items.clone())) {
            Message::GetData(decoded) => assert_eq!(decoded, items),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_headers_roundtrip() {
        let genesis = Network::Mainnet.params().genesis;
        let payload = Message::Headers(vec![genesis.clone()]).payload();
        assert_eq!(payload.len(), 1 + 81);
        match Message::decode("headers", &payload).unwrap() {
            Message::Headers(headers) => assert_eq!(headers, vec![genesis]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filterload_layout() {
        let filter = BloomFilter::from_parts(vec![0x61, 0x4e, 0x9b], 5, 0, 1);
        let payload = Message::FilterLoad(filter).payload();
        assert_eq!(hex::encode(payload), "03614e9b050000000000000001");
    }

    #[test]
    fn test_ping_and_unknown() {
        assert!(matches!(roundtrip(&Message::Ping(42)), Message::Ping(42)));
        assert!(matches!(Message::decode("ping", &[]).unwrap(), Message::Ping(0)));
        assert!(matches!(
            Message::decode("sendcmpct", &[0u8; 9]).unwrap(),
            Message::Unknown(ref command) if command == "sendcmpct"
        ));
    }

    #[test]
    fn test_truncated_payload_is_error() {
        assert!(matches!(
            Message::decode("inv", &[0x02, 0x01, 0x00]),
            Err(MessageError::Decode { command: "inv", .. })
        ));
    }
}
