//! Bitcoin P2P networking
//!
//! Provides the SPV side of the peer-to-peer protocol:
//! - Per-network constants and the message wire format
//! - The per-peer protocol state machine and its socket task
//! - A scored address source fed from DNS seeds
//! - The peer pool and the node that drives it

pub mod addrman;
pub mod codec;
pub mod connection;
pub mod message;
pub mod node;
pub mod params;
pub mod peer;
pub mod peer_group;

pub use addrman::{resolve_seeds, AddrEntry, AddrManager};
pub use codec::{MessageCodec, RawMessage, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use connection::{with_default_port, Connector, DEFAULT_CONNECT_TIMEOUT};
pub use message::{
    GetHeadersMessage, InventoryItem, InventoryType, Message, MessageError, NetAddress,
    ServiceFlags, VersionMessage,
};
pub use node::{NodeConfig, NodeError, SpvNode, WalletInventory};
pub use params::{Network, NetworkParams, PROTOCOL_VERSION};
pub use peer::{InventoryFilter, Peer, PeerCommand, PeerError, PeerEvent, PeerHandle, PeerState};
pub use peer_group::{GroupConfig, GroupEvent, PeerGroup, MAX_MERKLE_BLOCKS_PER_REQUEST};
