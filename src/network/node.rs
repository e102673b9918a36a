//! SPV node
//!
//! Wires the peer group to the header chain, the transaction store and
//! the processor. Headers extend the chain and trigger merkle block
//! requests, filtered blocks and relayed transactions land in the store,
//! and every productive processor run refreshes the Bloom filter sent
//! to peers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::address::Address;
use crate::core::chain::{ChainError, Connected, HeaderChain, MAX_HEADERS_PER_MESSAGE};
use crate::core::header::BlockHeader;
use crate::core::merkle_block::MerkleBlock;
use crate::core::transaction::{Transaction, TransactionStatus};
use crate::crypto::bloom::BloomFilter;
use crate::crypto::{to_reversed_hex, Hash};
use crate::network::connection::DEFAULT_CONNECT_TIMEOUT;
use crate::network::message::{InventoryItem, InventoryType};
use crate::network::params::{Network, NetworkParams};
use crate::network::peer::InventoryFilter;
use crate::network::peer_group::{GroupConfig, GroupEvent, PeerGroup};
use crate::storage::{StorageError, TransactionStore};
use crate::transactions::{
    CreatorError, DefaultSelector, KeyChainSigner, KeyExtractor, OutputLinker, ProcessorQueue,
    ProcessorWorker, TransactionBuilder, TransactionCreator, TransactionProcessor,
    DEFAULT_FEE_RATE,
};
use crate::wallet::{KeyChain, KeyChainError, KeyProvider, DEFAULT_GAP_LIMIT};

/// False positive rate of the wallet's Bloom filter
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.0005;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// Target number of peer connections
    pub peer_count: usize,
    /// Hosts to use instead of the DNS seeds
    pub bootstrap_peers: Vec<String>,
    /// Where the store and keys live; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Satoshis per byte for outgoing payments
    pub fee_rate: u64,
    /// Unused keys kept ahead on each chain
    pub gap_limit: u32,
    pub connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            peer_count: 3,
            bootstrap_peers: Vec::new(),
            data_dir: None,
            fee_rate: DEFAULT_FEE_RATE,
            gap_limit: DEFAULT_GAP_LIMIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key chain error: {0}")]
    KeyChain(#[from] KeyChainError),
    #[error("Header chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Payment failed: {0}")]
    Creator(#[from] CreatorError),
}

// =============================================================================
// Inventory
// =============================================================================

/// Fetch only transactions not yet stored and blocks not yet in the chain
pub struct WalletInventory {
    store: Arc<TransactionStore>,
    chain: Arc<Mutex<HeaderChain>>,
}

impl WalletInventory {
    pub fn new(store: Arc<TransactionStore>, chain: Arc<Mutex<HeaderChain>>) -> Self {
        Self { store, chain }
    }
}

impl InventoryFilter for WalletInventory {
    fn is_wanted(&self, item: &InventoryItem) -> bool {
        match item.kind {
            InventoryType::Tx => !self.store.contains(&item.hash),
            InventoryType::Block | InventoryType::FilteredBlock => !self
                .chain
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&item.hash),
            InventoryType::Other(_) => false,
        }
    }
}

/// Everything a peer needs to forward wallet activity: key hashes and
/// public keys for incoming payments, unspent outpoints for spends
pub fn wallet_bloom_filter(keys: &dyn KeyProvider, store: &TransactionStore) -> BloomFilter {
    let mut elements = Vec::new();
    for key in keys.public_keys() {
        elements.push(key.public_key_hash);
        elements.push(key.public_key);
    }
    for unspent in store.unspent_outputs() {
        elements.push(unspent.outpoint.to_bytes().to_vec());
    }
    BloomFilter::with_elements(&elements, BLOOM_FALSE_POSITIVE_RATE)
}

// =============================================================================
// Node
// =============================================================================

pub struct SpvNode {
    params: Arc<NetworkParams>,
    store: Arc<TransactionStore>,
    keys: Arc<KeyChain>,
    chain: Arc<Mutex<HeaderChain>>,
    group: Arc<PeerGroup>,
    group_events: Mutex<Option<mpsc::UnboundedReceiver<GroupEvent>>>,
    processor: ProcessorWorker,
    processed: Mutex<Option<mpsc::UnboundedReceiver<usize>>>,
    creator: TransactionCreator,
    filter: RwLock<BloomFilter>,
}

impl SpvNode {
    /// Open the wallet and assemble the node. Must be called inside a
    /// tokio runtime since the processor worker starts here.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let params = Arc::new(config.network.params());

        let (store, keys) = match &config.data_dir {
            Some(dir) => (
                TransactionStore::open(dir)?,
                KeyChain::open(dir, config.gap_limit)?,
            ),
            None => (
                TransactionStore::in_memory(),
                KeyChain::in_memory(config.gap_limit)?,
            ),
        };
        let store = Arc::new(store);
        let keys = Arc::new(keys);

        let chain = HeaderChain::from_headers(
            params.genesis.clone(),
            params.pow_limit,
            &store.headers(),
        )?;
        info!(
            "Wallet on {} at height {} with {} transactions",
            params.network,
            chain.height(),
            store.transaction_count()
        );
        let chain = Arc::new(Mutex::new(chain));

        let group_config = GroupConfig {
            peer_count: config.peer_count,
            connect_timeout: config.connect_timeout,
            bootstrap_peers: config.bootstrap_peers.clone(),
        };
        let inventory = Arc::new(WalletInventory::new(store.clone(), chain.clone()));
        let (group, group_events) = PeerGroup::new(params.clone(), group_config, inventory);
        let group = Arc::new(group);

        let processor = Arc::new(TransactionProcessor::new(
            store.clone(),
            keys.clone(),
            Box::new(KeyExtractor::new(params.network, keys.clone())),
            Box::new(OutputLinker::new()),
        ));
        let (processed_tx, processed) = mpsc::unbounded_channel();
        let processor = ProcessorWorker::spawn(processor, processed_tx);

        let builder = TransactionBuilder::new(
            params.network,
            Box::new(DefaultSelector::new()),
            store.clone(),
            Arc::new(KeyChainSigner::new(keys.clone())),
        );
        let creator = TransactionCreator::new(
            store.clone(),
            builder,
            Arc::new(processor.clone()),
            group.clone(),
            keys.clone(),
        )
        .with_fee_rate(config.fee_rate);

        let filter = wallet_bloom_filter(keys.as_ref(), &store);
        group.set_bloom_filter(filter.clone());
        group.set_best_height(chain_height(&chain));

        Ok(Self {
            params,
            store,
            keys,
            chain,
            group,
            group_events: Mutex::new(Some(group_events)),
            processor,
            processed: Mutex::new(Some(processed)),
            creator,
            filter: RwLock::new(filter),
        })
    }

    fn chain(&self) -> MutexGuard<'_, HeaderChain> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn network(&self) -> Network {
        self.params.network
    }

    pub fn height(&self) -> u32 {
        self.chain().height()
    }

    pub fn balance(&self) -> u64 {
        self.store.balance()
    }

    pub fn receive_address(&self) -> Result<Address, NodeError> {
        Ok(self.keys.receive_public_key()?.address(self.params.network))
    }

    /// Pay `value` satoshis to `address`
    pub fn send(&self, address: &str, value: u64) -> Result<Transaction, NodeError> {
        Ok(self.creator.create(address, value)?)
    }

    pub fn fee(&self, address: &str, value: u64) -> Result<u64, NodeError> {
        Ok(self.creator.fee(address, value)?)
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub fn group(&self) -> &Arc<PeerGroup> {
        &self.group
    }

    /// Drive the peer group until ctrl-c. Only the first call does anything.
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        let group_events = self
            .group_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let processed = self
            .processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (mut group_events, mut processed) = match (group_events, processed) {
            (Some(group_events), Some(processed)) => (group_events, processed),
            _ => {
                warn!("Node is already running");
                return Ok(());
            }
        };

        let group_task = tokio::spawn(self.group.clone().run());

        loop {
            tokio::select! {
                event = group_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_group_event(event) {
                            warn!("Failed to handle group event: {}", e);
                        }
                    }
                    None => break,
                },
                Some(count) = processed.recv() => {
                    debug!("Processor handled {} transactions", count);
                    self.refresh_bloom_filter();
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.group.shutdown();
        group_task.abort();
        Ok(())
    }

    pub fn handle_group_event(&self, event: GroupEvent) -> Result<(), NodeError> {
        match event {
            GroupEvent::Ready => {
                info!("Connected, syncing headers from height {}", self.height());
                self.request_headers();
                Ok(())
            }
            GroupEvent::Offline => {
                warn!("Lost all peers");
                Ok(())
            }
            GroupEvent::Headers { host, headers } => self.headers_received(&host, headers),
            GroupEvent::MerkleBlock(block) => self.merkle_block_received(*block),
            GroupEvent::Transaction(tx) => self.transaction_received(*tx),
            GroupEvent::Relayed(hash) => self.transaction_relayed(&hash),
        }
    }

    fn request_headers(&self) {
        let locator = self.chain().locator();
        if !self.group.request_headers(locator) {
            debug!("No peer available for getheaders");
        }
    }

    fn headers_received(&self, host: &str, headers: Vec<BlockHeader>) -> Result<(), NodeError> {
        let full_batch = headers.len() >= MAX_HEADERS_PER_MESSAGE;

        let mut added = Vec::new();
        let mut failure = None;
        let height = {
            let mut chain = self.chain();
            for header in headers {
                match chain.connect(header.clone()) {
                    Ok(Connected::Extended(_)) => added.push(header),
                    Ok(Connected::Known(_)) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            chain.height()
        };

        if !added.is_empty() {
            self.store.add_headers(&added)?;
            self.group.set_best_height(height);
            info!("Synced {} headers, height {}", added.len(), height);
            self.group
                .request_merkle_blocks(added.iter().map(BlockHeader::hash).collect());
        }

        // A peer on another branch or serving bad headers can't sync us
        if let Some(e) = failure {
            warn!("Rejected headers from {}: {}", host, e);
            self.group.disconnect_peer(host);
            self.request_headers();
            return Err(e.into());
        }
        if full_batch {
            self.request_headers();
        }
        Ok(())
    }

    fn merkle_block_received(&self, block: MerkleBlock) -> Result<(), NodeError> {
        if !self.chain().contains(&block.block_hash) {
            debug!(
                "Merkle block {} is ahead of our headers",
                to_reversed_hex(&block.block_hash)
            );
            self.request_headers();
        }
        if block.associated_transactions.is_empty() {
            return Ok(());
        }

        let block_hash = block.block_hash;
        let count = block.associated_transactions.len();
        self.store.write(|data| {
            for mut tx in block.associated_transactions {
                match data.find_transaction_mut(&tx.hash_hex()) {
                    Some(stored) => stored.block_hash = Some(block_hash),
                    None => {
                        tx.block_hash = Some(block_hash);
                        data.insert(tx);
                    }
                }
            }
            Ok::<_, StorageError>(())
        })?;

        debug!(
            "Stored {} transactions from block {}",
            count,
            to_reversed_hex(&block_hash)
        );
        self.processor.enqueue_run();
        Ok(())
    }

    fn transaction_received(&self, tx: Transaction) -> Result<(), NodeError> {
        if self.store.contains(&tx.hash()) {
            return Ok(());
        }
        let relevant = self
            .filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .matches_transaction(&tx);
        if !relevant {
            debug!("Ignoring unrelated transaction {}", tx.hash_hex());
            return Ok(());
        }

        info!("Received transaction {}", tx.hash_hex());
        self.store.insert(tx)?;
        self.processor.enqueue_run();
        Ok(())
    }

    fn transaction_relayed(&self, hash: &Hash) -> Result<(), NodeError> {
        let hash_hex = to_reversed_hex(hash);
        self.store.write(|data| {
            if let Some(tx) = data.find_transaction_mut(&hash_hex) {
                tx.status = TransactionStatus::Relayed;
            }
            Ok::<_, StorageError>(())
        })?;
        info!("Transaction {} relayed", hash_hex);
        Ok(())
    }

    /// Rebuild the filter from current keys and unspent outputs and push
    /// it to the peers
    pub fn refresh_bloom_filter(&self) {
        let filter = wallet_bloom_filter(self.keys.as_ref(), &self.store);
        *self.filter.write().unwrap_or_else(|e| e.into_inner()) = filter.clone();
        self.group.set_bloom_filter(filter);
    }
}

fn chain_height(chain: &Mutex<HeaderChain>) -> u32 {
    chain.lock().unwrap_or_else(|e| e.into_inner()).height()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::ScriptBuilder;
    use crate::core::transaction::{OutPoint, TransactionInput, TransactionOutput};
    use crate::network::peer::{PeerCommand, PeerEvent, PeerHandle};

    fn node() -> SpvNode {
        SpvNode::new(NodeConfig {
            network: Network::Regtest,
            gap_limit: 2,
            ..NodeConfig::default()
        })
        .unwrap()
    }

    fn mine(prev: &BlockHeader, merkle_root: Hash) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            prev_block: prev.hash(),
            merkle_root,
            timestamp: prev.timestamp + 600,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        while !header.meets_target() {
            header.nonce += 1;
        }
        header
    }

    fn headers_from(host: &str, headers: Vec<BlockHeader>) -> GroupEvent {
        GroupEvent::Headers {
            host: host.to_string(),
            headers,
        }
    }

    fn payment_to_wallet(node: &SpvNode, value: u64) -> Transaction {
        let address = node.receive_address().unwrap();
        Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([9u8; 32], 0), vec![])],
            vec![TransactionOutput::new(
                value,
                ScriptBuilder::new().locking_script(&address).unwrap(),
                0,
            )],
            0,
        )
    }

    #[tokio::test]
    async fn test_headers_extend_chain_and_queue_blocks() {
        let node = node();
        let genesis = node.params.genesis.clone();
        let first = mine(&genesis, [1u8; 32]);
        let second = mine(&first, [2u8; 32]);

        node.handle_group_event(headers_from("peer", vec![first.clone(), second.clone()]))
            .unwrap();

        assert_eq!(node.height(), 2);
        assert_eq!(node.store.last_block_height(), 2);
        // No peers are connected, so both requests wait in the group
        assert_eq!(node.group.pending_merkle_blocks(), 2);

        // Replayed headers are known and change nothing
        node.handle_group_event(headers_from("peer", vec![first, second]))
            .unwrap();
        assert_eq!(node.store.last_block_height(), 2);
        assert_eq!(node.group.pending_merkle_blocks(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_headers_are_rejected() {
        let node = node();
        let genesis = node.params.genesis.clone();
        let first = mine(&genesis, [1u8; 32]);
        let orphan = mine(&first, [2u8; 32]);

        let result = node.handle_group_event(headers_from("peer", vec![orphan]));
        assert!(matches!(
            result,
            Err(NodeError::Chain(ChainError::Disconnected(_)))
        ));
        assert_eq!(node.height(), 0);
        assert_eq!(node.store.last_block_height(), 0);
    }

    #[tokio::test]
    async fn test_peer_on_other_branch_is_dropped_and_sync_moves_on() {
        let node = node();
        let (forked, mut forked_rx) = PeerHandle::new("forked".to_string());
        let (honest, mut honest_rx) = PeerHandle::new("honest".to_string());
        node.group.register(forked);
        node.group.register(honest);
        for host in ["forked", "honest"] {
            node.group.handle_peer_event(PeerEvent::Ready {
                host: host.to_string(),
            });
        }

        let genesis = node.params.genesis.clone();
        let competing = mine(&mine(&genesis, [8u8; 32]), [9u8; 32]);
        let result = node.handle_group_event(headers_from("forked", vec![competing]));

        assert!(matches!(
            result,
            Err(NodeError::Chain(ChainError::Disconnected(_)))
        ));
        assert_eq!(node.group.ready_count(), 1);
        let closed = std::iter::from_fn(|| forked_rx.try_recv().ok())
            .any(|command| matches!(command, PeerCommand::Close));
        assert!(closed);
        let asked = std::iter::from_fn(|| honest_rx.try_recv().ok())
            .any(|command| matches!(command, PeerCommand::RequestHeaders(_)));
        assert!(asked);
    }

    #[tokio::test]
    async fn test_merkle_block_transactions_are_stored() {
        let node = node();
        let tx = payment_to_wallet(&node, 70_000);
        let header = mine(&node.params.genesis, tx.hash());
        node.handle_group_event(headers_from("peer", vec![header.clone()]))
            .unwrap();

        let mut block = MerkleBlock::new(header.clone(), 1, vec![tx.hash()], vec![0x01]).unwrap();
        assert!(block.add_transaction(tx.clone()));
        node.handle_group_event(GroupEvent::MerkleBlock(Box::new(block)))
            .unwrap();

        let stored = node.store.find_transaction(&tx.hash_hex()).unwrap();
        assert_eq!(stored.block_hash, Some(header.hash()));
    }

    #[tokio::test]
    async fn test_relayed_transactions_are_filtered() {
        let node = node();
        let ours = payment_to_wallet(&node, 5_000);
        let foreign = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([7u8; 32], 1), vec![])],
            vec![TransactionOutput::new(5_000, vec![0x6a, 0x04, 1, 2, 3, 4], 0)],
            0,
        );

        node.handle_group_event(GroupEvent::Transaction(Box::new(ours.clone())))
            .unwrap();
        node.handle_group_event(GroupEvent::Transaction(Box::new(foreign.clone())))
            .unwrap();

        assert!(node.store.contains(&ours.hash()));
        assert!(!node.store.contains(&foreign.hash()));
    }

    #[tokio::test]
    async fn test_relay_acknowledgement_updates_status() {
        let node = node();
        let mut tx = payment_to_wallet(&node, 1_000);
        tx.status = TransactionStatus::New;
        node.store.insert(tx.clone()).unwrap();

        node.handle_group_event(GroupEvent::Relayed(tx.hash()))
            .unwrap();

        let stored = node.store.find_transaction(&tx.hash_hex()).unwrap();
        assert_eq!(stored.status, TransactionStatus::Relayed);
    }

    #[tokio::test]
    async fn test_inventory_wants_only_unknown_items() {
        let node = node();
        let tx = payment_to_wallet(&node, 1_000);
        node.store.insert(tx.clone()).unwrap();
        let inventory = WalletInventory::new(node.store.clone(), node.chain.clone());

        assert!(!inventory.is_wanted(&InventoryItem::tx(tx.hash())));
        assert!(inventory.is_wanted(&InventoryItem::tx([3u8; 32])));
        assert!(!inventory.is_wanted(&InventoryItem::new(
            InventoryType::Block,
            node.params.genesis.hash()
        )));
        assert!(inventory.is_wanted(&InventoryItem::filtered_block([4u8; 32])));
        assert!(!inventory.is_wanted(&InventoryItem::new(InventoryType::Other(9), [5u8; 32])));
    }

    #[tokio::test]
    async fn test_persistent_node_reloads_headers() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            network: Network::Regtest,
            data_dir: Some(dir.path().to_path_buf()),
            gap_limit: 2,
            ..NodeConfig::default()
        };

        let address = {
            let node = SpvNode::new(config.clone()).unwrap();
            let header = mine(&node.params.genesis, [1u8; 32]);
            node.handle_group_event(headers_from("peer", vec![header]))
                .unwrap();
            node.receive_address().unwrap()
        };

        let reopened = SpvNode::new(config).unwrap();
        assert_eq!(reopened.height(), 1);
        assert_eq!(reopened.receive_address().unwrap(), address);
    }
}
