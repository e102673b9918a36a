//! Peer protocol state machine
//!
//! A `Peer` owns everything known about one remote node: handshake state,
//! in-flight merkle block requests and transactions offered for relay. It
//! is driven by its connection task, which feeds it decoded messages and
//! group commands; outbound messages go to the connection's outbox and
//! notifications go up to the group as `PeerEvent`s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::header::BlockHeader;
use crate::core::merkle_block::MerkleBlock;
use crate::core::transaction::Transaction;
use crate::crypto::{to_reversed_hex, BloomFilter, Hash};
use crate::network::message::{
    GetHeadersMessage, InventoryItem, InventoryType, Message, MessageError, NetAddress,
    VersionMessage,
};
use crate::network::params::NetworkParams;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer rejected: {0}")]
    Unsuitable(String),
    #[error("Connection timed out")]
    Timeout,
    #[error("Could not resolve {0}")]
    Unresolvable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Decides whether an advertised object is worth fetching
pub trait InventoryFilter: Send + Sync {
    fn is_wanted(&self, item: &InventoryItem) -> bool;
}

/// Instructions from the group to one peer
#[derive(Debug, Clone)]
pub enum PeerCommand {
    RequestHeaders(Vec<Hash>),
    RequestMerkleBlocks(Vec<Hash>),
    Relay(Box<Transaction>),
    SetBloomFilter(BloomFilter),
    Close,
}

/// Notifications from a peer to its group
#[derive(Debug)]
pub enum PeerEvent {
    Ready {
        host: String,
    },
    Headers {
        host: String,
        headers: Vec<BlockHeader>,
    },
    /// A merkle block with all of its matched transactions attached
    MerkleBlock {
        host: String,
        block: Box<MerkleBlock>,
    },
    /// A transaction that belongs to no pending merkle block
    Transaction {
        host: String,
        tx: Box<Transaction>,
    },
    /// The remote fetched a transaction we offered
    Relayed {
        host: String,
        hash: Hash,
    },
    /// All merkle block requests are done
    Free {
        host: String,
    },
    Disconnected {
        host: String,
        error: Option<String>,
        unresolved: Vec<Hash>,
    },
}

// =============================================================================
// Request table
// =============================================================================

/// Outcome of offering a transaction to the request table
#[derive(Debug)]
pub enum Attached {
    /// The transaction completed this block
    Completed(MerkleBlock),
    /// The block still waits for more transactions
    Pending,
    /// No requested block lists this transaction
    Unrequested(Transaction),
}

/// In-flight merkle block requests, keyed by block hash.
/// A value is present once the `merkleblock` arrived.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: HashMap<Hash, Option<MerkleBlock>>,
}

impl RequestTable {
    pub fn insert_pending(&mut self, hash: Hash) {
        self.entries.entry(hash).or_insert(None);
    }

    /// Record a received block. Returns it back if it is already complete.
    pub fn resolve(&mut self, block: MerkleBlock) -> Option<MerkleBlock> {
        if block.is_complete() {
            self.entries.remove(&block.block_hash);
            return Some(block);
        }
        self.entries.insert(block.block_hash, Some(block));
        None
    }

    pub fn attach(&mut self, tx: Transaction) -> Attached {
        let hash = tx.hash();
        let block_hash = self.entries.iter().find_map(|(block_hash, block)| match block {
            Some(block) if block.is_associated(&hash) => Some(*block_hash),
            _ => None,
        });

        let block_hash = match block_hash {
            Some(block_hash) => block_hash,
            None => return Attached::Unrequested(tx),
        };

        let complete = match self.entries.get_mut(&block_hash) {
            Some(Some(block)) => {
                block.add_transaction(tx);
                block.is_complete()
            }
            _ => false,
        };
        if !complete {
            return Attached::Pending;
        }

        match self.entries.remove(&block_hash) {
            Some(Some(block)) => Attached::Completed(block),
            _ => Attached::Pending,
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove and return every block hash not yet delivered
    pub fn drain_unresolved(&mut self) -> Vec<Hash> {
        self.entries.drain().map(|(hash, _)| hash).collect()
    }
}

// =============================================================================
// Availability
// =============================================================================

/// Free/busy state shared by a `Peer` and its handle.
///
/// `queued` counts merkle block batches the group has sent but the peer
/// has not taken off its command channel yet. A peer whose request table
/// drains while a batch is still queued keeps reading as busy.
#[derive(Debug)]
pub struct Availability {
    free: AtomicBool,
    queued: AtomicUsize,
}

impl Default for Availability {
    fn default() -> Self {
        Self {
            free: AtomicBool::new(true),
            queued: AtomicUsize::new(0),
        }
    }
}

impl Availability {
    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::SeqCst) && self.queued.load(Ordering::SeqCst) == 0
    }

    /// Group side: a batch is on its way to the peer
    pub fn assign(&self) {
        self.free.store(false, Ordering::SeqCst);
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Group side: the batch never reached the peer
    pub fn unassign(&self) {
        self.take_queued();
    }

    /// Peer side: a batch has been taken and its requests recorded
    pub fn accept(&self) {
        self.free.store(false, Ordering::SeqCst);
        self.take_queued();
    }

    /// Peer side: every request is resolved. Returns true if the peer
    /// was busy until now.
    pub fn release(&self) -> bool {
        !self.free.swap(true, Ordering::SeqCst)
    }

    fn take_queued(&self) {
        // Batches sent straight to a peer were never counted
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

// =============================================================================
// Peer handle
// =============================================================================

/// The group's end of a peer connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub host: String,
    commands: mpsc::UnboundedSender<PeerCommand>,
    availability: Arc<Availability>,
}

impl PeerHandle {
    pub fn new(host: String) -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            host,
            commands,
            availability: Arc::new(Availability::default()),
        };
        (handle, rx)
    }

    /// Shared availability, handed to the `Peer`
    pub fn availability(&self) -> Arc<Availability> {
        self.availability.clone()
    }

    pub fn is_free(&self) -> bool {
        self.availability.is_free()
    }

    /// Count a merkle block batch about to be sent
    pub fn mark_busy(&self) {
        self.availability.assign();
    }

    /// Returns false if the connection is gone
    pub fn send(&self, command: PeerCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

// =============================================================================
// Peer
// =============================================================================

pub struct Peer {
    host: String,
    params: Arc<NetworkParams>,
    state: PeerState,
    outbox: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<PeerEvent>,
    inventory: Arc<dyn InventoryFilter>,
    requests: RequestTable,
    relayed: HashMap<Hash, Transaction>,
    availability: Arc<Availability>,
}

impl Peer {
    pub fn new(
        host: String,
        params: Arc<NetworkParams>,
        outbox: mpsc::UnboundedSender<Message>,
        events: mpsc::UnboundedSender<PeerEvent>,
        inventory: Arc<dyn InventoryFilter>,
        availability: Arc<Availability>,
    ) -> Self {
        Self {
            host,
            params,
            state: PeerState::Connecting,
            outbox,
            events,
            inventory,
            requests: RequestTable::default(),
            relayed: HashMap::new(),
            availability,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.availability.is_free()
    }

    /// The socket is up: announce ourselves
    pub fn start(&mut self, receiver: NetAddress, last_block: i32) {
        self.state = PeerState::Handshaking;
        let version = VersionMessage::ours(&self.params, receiver, last_block);
        self.send(Message::Version(version));
    }

    fn send(&self, message: Message) {
        if self.outbox.send(message).is_err() {
            debug!("Outbox for {} is closed", self.host);
        }
    }

    fn notify(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            debug!("Event listener for {} is gone", self.host);
        }
    }

    /// Decode and handle one frame payload. Payloads that fail to decode,
    /// including merkle blocks whose proof does not hash to the header's
    /// root, are dropped and leave the request table untouched.
    pub fn handle_payload(&mut self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        match Message::decode(command, payload) {
            Ok(message) => self.handle_message(message),
            Err(MessageError::MerkleBlock(e)) => {
                warn!("Discarding merkle block from {}: {}", self.host, e);
                Ok(())
            }
            Err(e) => {
                warn!("Ignoring malformed {} from {}: {}", command, self.host, e);
                Ok(())
            }
        }
    }

    /// Handle one message from the remote. An error means the connection
    /// must be closed.
    pub fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Ping(nonce) => self.send(Message::Pong(nonce)),
            Message::Version(version) => {
                if let Some(reason) = self.reason_to_close(&version) {
                    info!("Closing peer {} with reason: {}", self.host, reason);
                    self.state = PeerState::Closing;
                    return Err(PeerError::Unsuitable(reason.to_string()));
                }
                debug!(
                    "Peer {} is {} at height {}",
                    self.host, version.user_agent, version.last_block
                );
                self.send(Message::VerAck);
            }
            Message::VerAck => {
                if self.state == PeerState::Handshaking {
                    self.state = PeerState::Ready;
                    info!("Peer {} is ready", self.host);
                    self.notify(PeerEvent::Ready {
                        host: self.host.clone(),
                    });
                }
            }
            Message::Headers(headers) => self.notify(PeerEvent::Headers {
                host: self.host.clone(),
                headers,
            }),
            Message::MerkleBlock(block) => {
                if let Some(block) = self.requests.resolve(*block) {
                    self.merkle_block_completed(block);
                }
            }
            Message::Tx(tx) => match self.requests.attach(*tx) {
                Attached::Completed(block) => self.merkle_block_completed(block),
                Attached::Pending => {}
                Attached::Unrequested(tx) => self.notify(PeerEvent::Transaction {
                    host: self.host.clone(),
                    tx: Box::new(tx),
                }),
            },
            Message::Inv(items) => {
                let wanted: Vec<InventoryItem> = items
                    .into_iter()
                    .filter(|item| self.inventory.is_wanted(item))
                    .map(|item| match item.kind {
                        InventoryType::Block => InventoryItem::filtered_block(item.hash),
                        _ => item,
                    })
                    .collect();
                if !wanted.is_empty() {
                    self.send(Message::GetData(wanted));
                }
            }
            Message::GetData(items) => {
                for item in items.iter().filter(|item| item.kind == InventoryType::Tx) {
                    if let Some(tx) = self.relayed.remove(&item.hash) {
                        self.send(Message::Tx(Box::new(tx)));
                        self.notify(PeerEvent::Relayed {
                            host: self.host.clone(),
                            hash: item.hash,
                        });
                    }
                }
            }
            Message::Pong(_)
            | Message::GetHeaders(_)
            | Message::FilterLoad(_)
            | Message::Unknown(_) => {}
        }
        Ok(())
    }

    /// Apply a group command. Returns false once the peer should close.
    pub fn handle_command(&mut self, command: PeerCommand) -> bool {
        match command {
            PeerCommand::RequestHeaders(locator) => self.request_headers(locator),
            PeerCommand::RequestMerkleBlocks(hashes) => self.request_merkle_blocks(hashes),
            PeerCommand::Relay(tx) => self.relay(*tx),
            PeerCommand::SetBloomFilter(filter) => self.set_bloom_filter(filter),
            PeerCommand::Close => {
                self.state = PeerState::Closing;
                return false;
            }
        }
        true
    }

    pub fn request_headers(&mut self, locator: Vec<Hash>) {
        self.send(Message::GetHeaders(GetHeadersMessage {
            version: self.params.protocol_version as u32,
            locator,
            stop_hash: [0u8; 32],
        }));
    }

    pub fn request_merkle_blocks(&mut self, hashes: Vec<Hash>) {
        if hashes.is_empty() {
            return;
        }
        for hash in &hashes {
            self.requests.insert_pending(*hash);
        }
        self.availability.accept();
        self.send(Message::GetData(
            hashes.into_iter().map(InventoryItem::filtered_block).collect(),
        ));
    }

    /// Advertise a transaction; the body is sent once the remote asks for it
    pub fn relay(&mut self, tx: Transaction) {
        let hash = tx.hash();
        self.relayed.insert(hash, tx);
        self.send(Message::Inv(vec![InventoryItem::tx(hash)]));
    }

    pub fn set_bloom_filter(&mut self, filter: BloomFilter) {
        self.send(Message::FilterLoad(filter));
    }

    /// Tear down, reporting every merkle block hash still outstanding
    pub fn disconnected(mut self, error: Option<String>) {
        self.state = PeerState::Closed;
        let unresolved = self.requests.drain_unresolved();
        if !unresolved.is_empty() {
            debug!(
                "Peer {} left {} merkle blocks unresolved",
                self.host,
                unresolved.len()
            );
        }
        self.notify(PeerEvent::Disconnected {
            host: self.host.clone(),
            error,
            unresolved,
        });
    }

    fn reason_to_close(&self, version: &VersionMessage) -> Option<&'static str> {
        if version.last_block <= 0 {
            Some("Peer last block is not greater than 0.")
        } else if !version.has_full_chain() {
            Some("Peer does not have a copy of the block chain.")
        } else if !version.supports_bloom_filter() {
            Some("Peer does not support Bloom Filter.")
        } else {
            None
        }
    }

    fn merkle_block_completed(&mut self, block: MerkleBlock) {
        debug!(
            "Merkle block {} complete with {} transactions",
            to_reversed_hex(&block.block_hash),
            block.associated_transactions.len()
        );
        self.notify(PeerEvent::MerkleBlock {
            host: self.host.clone(),
            block: Box::new(block),
        });

        // The group may still read us as busy when another batch is queued
        if self.requests.is_empty() && self.availability.release() {
            self.notify(PeerEvent::Free {
                host: self.host.clone(),
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::header::BlockHeader;
    use crate::core::transaction::{OutPoint, TransactionInput, TransactionOutput};
    use crate::crypto::hash_pair;
    use crate::network::message::ServiceFlags;
    use crate::network::params::Network;

    /// Wants everything except the transaction hashed `0xee..`
    struct RejectMarked;

    impl InventoryFilter for RejectMarked {
        fn is_wanted(&self, item: &InventoryItem) -> bool {
            item.kind != InventoryType::Tx || item.hash != [0xee; 32]
        }
    }

    struct Harness {
        peer: Peer,
        availability: Arc<Availability>,
        outbox: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (out_tx, outbox) = mpsc::unbounded_channel();
            let (ev_tx, events) = mpsc::unbounded_channel();
            let availability = Arc::new(Availability::default());
            let peer = Peer::new(
                "8.8.8.8".to_string(),
                Arc::new(Network::Mainnet.params()),
                out_tx,
                ev_tx,
                Arc::new(RejectMarked),
                availability.clone(),
            );
            Self {
                peer,
                availability,
                outbox,
                events,
            }
        }

        fn ready() -> Self {
            let mut harness = Self::new();
            harness.peer.start(NetAddress::unspecified(), 0);
            harness.peer.handle_message(Message::Version(good_version())).unwrap();
            harness.peer.handle_message(Message::VerAck).unwrap();
            harness.drain_outbox();
            harness.drain_events();
            harness
        }

        fn drain_outbox(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(message) = self.outbox.try_recv() {
                messages.push(message);
            }
            messages
        }

        fn drain_events(&mut self) -> Vec<PeerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn good_version() -> VersionMessage {
        let params = Network::Mainnet.params();
        let mut version = VersionMessage::ours(&params, NetAddress::unspecified(), 500_000);
        version.services = ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_BLOOM;
        version
    }

    fn tx(seed: u8) -> Transaction {
        Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([seed; 32], 0), vec![])],
            vec![TransactionOutput::new(1_000, vec![0x51], 0)],
            0,
        )
    }

    /// Merkle block over two transactions with both matched
    fn block_for(first: &Transaction, second: &Transaction) -> MerkleBlock {
        let root = hash_pair(&first.hash(), &second.hash());
        let header = BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: root,
            timestamp: 1_500_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        MerkleBlock::new(header, 2, vec![first.hash(), second.hash()], vec![0b0000_0111]).unwrap()
    }

    /// Merkle block with no matched transactions
    fn empty_block(seed: u8) -> MerkleBlock {
        let root = [seed; 32];
        let header = BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: root,
            timestamp: 1_500_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        MerkleBlock::new(header, 1, vec![root], vec![0]).unwrap()
    }

    #[test]
    fn test_handshake_sends_version_then_verack() {
        let mut h = Harness::new();
        h.peer.start(NetAddress::unspecified(), 0);
        assert_eq!(h.peer.state(), PeerState::Handshaking);

        h.peer.handle_message(Message::Version(good_version())).unwrap();
        let sent = h.drain_outbox();
        assert!(matches!(sent[0], Message::Version(ref v) if !v.relay));
        assert!(matches!(sent[1], Message::VerAck));

        h.peer.handle_message(Message::VerAck).unwrap();
        assert_eq!(h.peer.state(), PeerState::Ready);
        assert!(matches!(h.drain_events()[..], [PeerEvent::Ready { .. }]));
    }

    #[test]
    fn test_unsuitable_peers_are_rejected() {
        let cases: Vec<(Box<dyn Fn(&mut VersionMessage)>, &str)> = vec![
            (
                Box::new(|v: &mut VersionMessage| v.last_block = 0),
                "Peer last block is not greater than 0.",
            ),
            (
                Box::new(|v: &mut VersionMessage| v.services = ServiceFlags::NODE_BLOOM),
                "Peer does not have a copy of the block chain.",
            ),
            (
                Box::new(|v: &mut VersionMessage| v.services = ServiceFlags::NODE_NETWORK),
                "Peer does not support Bloom Filter.",
            ),
        ];

        for (mutate, expected) in cases {
            let mut h = Harness::new();
            h.peer.start(NetAddress::unspecified(), 0);
            let mut version = good_version();
            mutate(&mut version);

            match h.peer.handle_message(Message::Version(version)) {
                Err(PeerError::Unsuitable(reason)) => assert_eq!(reason, expected),
                other => panic!("expected rejection, got {:?}", other),
            }
            assert_eq!(h.peer.state(), PeerState::Closing);
            assert!(!h
                .drain_outbox()
                .iter()
                .any(|m| matches!(m, Message::VerAck)));
        }
    }

    #[test]
    fn test_ping_gets_pong() {
        let mut h = Harness::ready();
        h.peer.handle_message(Message::Ping(99)).unwrap();
        assert!(matches!(h.drain_outbox()[..], [Message::Pong(99)]));
    }

    #[test]
    fn test_request_merkle_blocks_marks_busy() {
        let mut h = Harness::ready();
        h.peer.request_merkle_blocks(vec![[1u8; 32], [2u8; 32]]);
        assert!(!h.peer.is_free());

        match &h.drain_outbox()[..] {
            [Message::GetData(items)] => {
                assert_eq!(items.len(), 2);
                assert!(items.iter().all(|i| i.kind == InventoryType::FilteredBlock));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_merkle_block_completes_with_transactions() {
        let mut h = Harness::ready();
        let (a, b) = (tx(1), tx(2));
        let block = block_for(&a, &b);
        h.peer.request_merkle_blocks(vec![block.block_hash]);

        h.peer.handle_message(Message::MerkleBlock(Box::new(block))).unwrap();
        h.peer.handle_message(Message::Tx(Box::new(a))).unwrap();
        assert!(h.drain_events().is_empty());
        assert!(!h.peer.is_free());

        h.peer.handle_message(Message::Tx(Box::new(b))).unwrap();
        let events = h.drain_events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            PeerEvent::MerkleBlock { block, .. } => {
                assert_eq!(block.associated_transactions.len(), 2)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[1], PeerEvent::Free { .. }));
        assert!(h.peer.is_free());
    }

    #[test]
    fn test_empty_merkle_block_is_complete_immediately() {
        let mut h = Harness::ready();
        let block = empty_block(4);
        h.peer.request_merkle_blocks(vec![block.block_hash]);
        h.peer.handle_message(Message::MerkleBlock(Box::new(block))).unwrap();

        let events = h.drain_events();
        assert!(matches!(events[0], PeerEvent::MerkleBlock { .. }));
        assert!(h.peer.is_free());
    }

    #[test]
    fn test_merkle_block_with_bad_root_is_discarded() {
        let mut h = Harness::ready();
        let (a, b) = (tx(1), tx(2));
        let block = block_for(&a, &b);
        h.peer.request_merkle_blocks(vec![block.block_hash]);
        h.drain_outbox();

        // Corrupt the first proof hash; the header and block hash stay intact
        let mut payload = block.to_bytes();
        payload[85] ^= 0x01;
        assert!(matches!(
            Message::decode("merkleblock", &payload),
            Err(MessageError::MerkleBlock(_))
        ));

        h.peer.handle_payload("merkleblock", &payload).unwrap();
        assert_eq!(h.peer.state(), PeerState::Ready);
        assert!(h.drain_events().is_empty());
        assert!(h.drain_outbox().is_empty());
        assert!(!h.peer.is_free());
        assert!(h.peer.requests.contains(&block.block_hash));

        // The honest copy still completes the request
        h.peer.handle_payload("merkleblock", &block.to_bytes()).unwrap();
        h.peer.handle_message(Message::Tx(Box::new(a))).unwrap();
        h.peer.handle_message(Message::Tx(Box::new(b))).unwrap();
        assert!(matches!(
            h.drain_events()[..],
            [PeerEvent::MerkleBlock { .. }, PeerEvent::Free { .. }]
        ));
    }

    #[test]
    fn test_bad_root_leaves_block_to_reassign_on_close() {
        let mut h = Harness::ready();
        let block = block_for(&tx(1), &tx(2));
        h.peer.request_merkle_blocks(vec![block.block_hash]);

        let mut payload = block.to_bytes();
        payload[85] ^= 0x01;
        h.peer.handle_payload("merkleblock", &payload).unwrap();
        h.drain_events();

        let Harness { peer, mut events, .. } = h;
        peer.disconnected(None);
        match events.try_recv() {
            Ok(PeerEvent::Disconnected { unresolved, .. }) => {
                assert_eq!(unresolved, vec![block.block_hash])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_queued_batch_keeps_peer_busy() {
        let mut h = Harness::ready();
        let first = empty_block(5);
        let second = empty_block(6);

        // The group queues two batches before the peer takes either
        h.availability.assign();
        h.availability.assign();
        h.peer.handle_command(PeerCommand::RequestMerkleBlocks(vec![first.block_hash]));
        h.peer.handle_message(Message::MerkleBlock(Box::new(first))).unwrap();
        assert!(h.peer.requests.is_empty());
        assert!(!h.availability.is_free());

        h.peer.handle_command(PeerCommand::RequestMerkleBlocks(vec![second.block_hash]));
        assert!(!h.availability.is_free());
        h.peer.handle_message(Message::MerkleBlock(Box::new(second))).unwrap();
        assert!(h.availability.is_free());
        assert!(matches!(
            h.drain_events().last(),
            Some(PeerEvent::Free { .. })
        ));
    }

    #[test]
    fn test_unrequested_transaction_goes_up() {
        let mut h = Harness::ready();
        h.peer.handle_message(Message::Tx(Box::new(tx(9)))).unwrap();
        assert!(matches!(
            h.drain_events()[..],
            [PeerEvent::Transaction { .. }]
        ));
    }

    #[test]
    fn test_inv_upgrades_blocks_and_filters() {
        let mut h = Harness::ready();
        h.peer
            .handle_message(Message::Inv(vec![
                InventoryItem::new(InventoryType::Block, [1u8; 32]),
                InventoryItem::tx([2u8; 32]),
                InventoryItem::tx([0xee; 32]),
            ]))
            .unwrap();

        match &h.drain_outbox()[..] {
            [Message::GetData(items)] => assert_eq!(
                items,
                &vec![
                    InventoryItem::filtered_block([1u8; 32]),
                    InventoryItem::tx([2u8; 32]),
                ]
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_relay_is_one_shot() {
        let mut h = Harness::ready();
        let relayed = tx(5);
        let hash = relayed.hash();
        h.peer.relay(relayed);
        assert!(matches!(&h.drain_outbox()[..], [Message::Inv(items)] if items[0].hash == hash));

        h.peer
            .handle_message(Message::GetData(vec![InventoryItem::tx(hash)]))
            .unwrap();
        assert!(matches!(&h.drain_outbox()[..], [Message::Tx(t)] if t.hash() == hash));
        assert!(matches!(
            h.drain_events()[..],
            [PeerEvent::Relayed { .. }]
        ));

        h.peer
            .handle_message(Message::GetData(vec![InventoryItem::tx(hash)]))
            .unwrap();
        assert!(h.drain_outbox().is_empty());
    }

    #[test]
    fn test_disconnect_reports_only_incomplete_blocks() {
        let mut h = Harness::ready();
        let (a, b) = (tx(1), tx(2));
        let waiting = block_for(&a, &b);
        let done = empty_block(7);

        h.peer
            .request_merkle_blocks(vec![[3u8; 32], waiting.block_hash, done.block_hash]);
        h.peer
            .handle_message(Message::MerkleBlock(Box::new(waiting.clone())))
            .unwrap();
        h.peer.handle_message(Message::Tx(Box::new(a))).unwrap();
        h.peer
            .handle_message(Message::MerkleBlock(Box::new(done)))
            .unwrap();
        h.drain_events();

        let mut events = h.events;
        h.peer.disconnected(None);

        match events.try_recv().unwrap() {
            PeerEvent::Disconnected {
                mut unresolved,
                error,
                ..
            } => {
                assert!(error.is_none());
                unresolved.sort();
                let mut expected = vec![[3u8; 32], waiting.block_hash];
                expected.sort();
                assert_eq!(unresolved, expected);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_close_command() {
        let mut h = Harness::ready();
        assert!(h.peer.handle_command(PeerCommand::RequestHeaders(vec![[0u8; 32]])));
        assert!(matches!(h.drain_outbox()[..], [Message::GetHeaders(_)]));
        assert!(!h.peer.handle_command(PeerCommand::Close));
        assert_eq!(h.peer.state(), PeerState::Closing);
    }
}
