//! Pool of peer connections
//!
//! The group keeps up to `peer_count` connections open, hands header and
//! merkle block requests to peers that are free, pushes the wallet's
//! Bloom filter to every peer that completes its handshake and reassigns
//! whatever a departing peer left unresolved.
//!
//! Readiness is reported on transitions only: `GroupEvent::Ready` when the
//! number of ready peers goes from zero to one, `GroupEvent::Offline` when
//! it drops back to zero.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::core::header::BlockHeader;
use crate::core::merkle_block::MerkleBlock;
use crate::core::transaction::Transaction;
use crate::crypto::{BloomFilter, Hash};
use crate::network::addrman::{resolve_seeds, AddrManager};
use crate::network::connection::{Connector, DEFAULT_CONNECT_TIMEOUT};
use crate::network::params::NetworkParams;
use crate::network::peer::{InventoryFilter, PeerCommand, PeerEvent, PeerHandle};
use crate::transactions::TransactionRelay;

/// Most merkle blocks asked of one peer at a time
pub const MAX_MERKLE_BLOCKS_PER_REQUEST: usize = 500;

/// How often the pool is topped up
const REFILL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Target number of open connections
    pub peer_count: usize,
    pub connect_timeout: Duration,
    /// Hosts used instead of the DNS seeds when non-empty
    pub bootstrap_peers: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            peer_count: 3,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Notifications from the group to its owner
#[derive(Debug)]
pub enum GroupEvent {
    Ready,
    Offline,
    Headers {
        host: String,
        headers: Vec<BlockHeader>,
    },
    MerkleBlock(Box<MerkleBlock>),
    Transaction(Box<Transaction>),
    Relayed(Hash),
}

#[derive(Default)]
struct GroupState {
    handles: HashMap<String, PeerHandle>,
    /// Ready hosts in the order they completed the handshake
    ready: Vec<String>,
    /// Merkle blocks waiting for a free peer
    pending_blocks: VecDeque<Hash>,
    /// Transactions waiting for the first ready peer
    pending_relays: Vec<Transaction>,
}

impl GroupState {
    fn is_ready(&self, host: &str) -> bool {
        self.ready.iter().any(|h| h == host)
    }

    fn ready_handles(&self) -> impl Iterator<Item = &PeerHandle> {
        self.ready.iter().filter_map(|host| self.handles.get(host))
    }

    fn free_peer(&self) -> Option<&PeerHandle> {
        self.ready_handles().find(|handle| handle.is_free())
    }
}

pub struct PeerGroup {
    params: Arc<NetworkParams>,
    config: GroupConfig,
    connector: Connector,
    addresses: Mutex<AddrManager>,
    state: Mutex<GroupState>,
    bloom_filter: RwLock<Option<BloomFilter>>,
    best_height: AtomicI32,
    listener: mpsc::UnboundedSender<GroupEvent>,
    peer_events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl PeerGroup {
    pub fn new(
        params: Arc<NetworkParams>,
        config: GroupConfig,
        inventory: Arc<dyn InventoryFilter>,
    ) -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (listener, group_events) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector = Connector::new(
            params.clone(),
            events_tx,
            inventory,
            config.connect_timeout,
        );
        let addresses = AddrManager::with_hosts(&config.bootstrap_peers);

        let group = Self {
            params,
            config,
            connector,
            addresses: Mutex::new(addresses),
            state: Mutex::new(GroupState::default()),
            bloom_filter: RwLock::new(None),
            best_height: AtomicI32::new(0),
            listener,
            peer_events: Mutex::new(Some(events_rx)),
        };
        (group, group_events)
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn addresses(&self) -> MutexGuard<'_, AddrManager> {
        self.addresses.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: GroupEvent) {
        if self.listener.send(event).is_err() {
            debug!("Group listener is gone");
        }
    }

    /// Height announced in our `version` message
    pub fn set_best_height(&self, height: u32) {
        self.best_height.store(height as i32, Ordering::SeqCst);
    }

    pub fn ready_count(&self) -> usize {
        self.state().ready.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state().handles.len()
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// Connect, keep the pool filled and route peer events until the
    /// group is dropped. Only the first call does anything.
    pub async fn run(self: Arc<Self>) {
        let taken = self
            .peer_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut events = match taken {
            Some(events) => events,
            None => {
                warn!("Peer group is already running");
                return;
            }
        };

        if self.config.bootstrap_peers.is_empty() {
            let hosts = resolve_seeds(self.params.dns_seeds, self.params.port).await;
            let added = self.addresses().add_many(hosts, Some("dns".to_string()));
            info!("Added {} hosts from DNS seeds", added);
        }

        self.fill_pool();
        let mut refill = tokio::time::interval(REFILL_INTERVAL);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let disconnected = matches!(event, PeerEvent::Disconnected { .. });
                        self.handle_peer_event(event);
                        if disconnected {
                            self.fill_pool();
                        }
                    }
                    None => break,
                },
                _ = refill.tick() => self.fill_pool(),
            }
        }
    }

    /// Open connections until the target count is reached or no
    /// candidate host is left
    fn fill_pool(&self) {
        while self.connection_count() < self.config.peer_count {
            let host = match self.addresses().next_host() {
                Some(host) => host,
                None => break,
            };
            self.connect(host);
        }
    }

    fn connect(&self, host: String) {
        info!("Connecting to {}", host);
        let (handle, commands) = PeerHandle::new(host.clone());
        let availability = handle.availability();
        self.register(handle);

        let connector = self.connector.clone();
        let last_block = self.best_height.load(Ordering::SeqCst);
        tokio::spawn(async move {
            connector.run(host, commands, availability, last_block).await;
        });
    }

    pub(crate) fn register(&self, handle: PeerHandle) {
        self.state().handles.insert(handle.host.clone(), handle);
    }

    /// Ask every connection to close
    pub fn shutdown(&self) {
        for handle in self.state().handles.values() {
            handle.send(PeerCommand::Close);
        }
    }

    // =========================================================================
    // Peer events
    // =========================================================================

    pub fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Ready { host } => self.peer_ready(&host),
            PeerEvent::Headers { host, headers } => {
                self.notify(GroupEvent::Headers { host, headers })
            }
            PeerEvent::MerkleBlock { block, .. } => self.notify(GroupEvent::MerkleBlock(block)),
            PeerEvent::Transaction { tx, .. } => self.notify(GroupEvent::Transaction(tx)),
            PeerEvent::Relayed { hash, .. } => self.notify(GroupEvent::Relayed(hash)),
            PeerEvent::Free { .. } => self.dispatch_pending(),
            PeerEvent::Disconnected {
                host,
                error,
                unresolved,
            } => self.peer_disconnected(&host, error, unresolved),
        }
    }

    fn peer_ready(&self, host: &str) {
        // Filter lock is held until the peer is in `ready`, so a concurrent
        // `set_bloom_filter` either sees this peer or is seen by it
        let filter = self
            .bloom_filter
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let first = {
            let mut state = self.state();
            let handle = match state.handles.get(host) {
                Some(handle) => handle.clone(),
                None => return,
            };
            if state.is_ready(host) {
                return;
            }
            state.ready.push(host.to_string());

            if let Some(filter) = filter.as_ref() {
                handle.send(PeerCommand::SetBloomFilter(filter.clone()));
            }
            for tx in state.pending_relays.drain(..) {
                handle.send(PeerCommand::Relay(Box::new(tx)));
            }
            state.ready.len() == 1
        };
        drop(filter);

        if first {
            info!("Peer group is ready");
            self.notify(GroupEvent::Ready);
        }
        self.dispatch_pending();
    }

    fn peer_disconnected(&self, host: &str, error: Option<String>, unresolved: Vec<Hash>) {
        // A host dropped through `disconnect_peer` is already unregistered
        // and scored
        let (registered, offline) = self.unregister(host);
        if registered {
            let mut addresses = self.addresses();
            match &error {
                None => addresses.mark_success(host),
                Some(reason) => {
                    debug!("Peer {} failed: {}", host, reason);
                    addresses.mark_failed(host);
                }
            }
        }

        if offline {
            info!("Peer group has no ready peers");
            self.notify(GroupEvent::Offline);
        }

        if !unresolved.is_empty() {
            info!(
                "Re-requesting {} merkle blocks left by {}",
                unresolved.len(),
                host
            );
            self.request_merkle_blocks(unresolved);
        }
    }

    /// Remove a host's handle and readiness. Returns whether it was
    /// registered and whether the group just lost its last ready peer.
    fn unregister(&self, host: &str) -> (bool, bool) {
        let mut state = self.state();
        let registered = state.handles.remove(host).is_some();
        let was_ready = state.is_ready(host);
        state.ready.retain(|h| h != host);
        (registered, was_ready && state.ready.is_empty())
    }

    /// Close a peer that sent invalid data. It gets no more work, and
    /// whatever it still owed comes back when its connection ends.
    pub fn disconnect_peer(&self, host: &str) {
        let handle = self.state().handles.get(host).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };

        warn!("Disconnecting misbehaving peer {}", host);
        let (_, offline) = self.unregister(host);
        handle.send(PeerCommand::Close);
        self.addresses().mark_failed(host);

        if offline {
            info!("Peer group has no ready peers");
            self.notify(GroupEvent::Offline);
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Send `getheaders`, preferring a free peer. Returns false when no
    /// peer is ready.
    pub fn request_headers(&self, locator: Vec<Hash>) -> bool {
        let state = self.state();
        let handle = state
            .free_peer()
            .or_else(|| state.ready_handles().next());
        match handle {
            Some(handle) => handle.send(PeerCommand::RequestHeaders(locator)),
            None => false,
        }
    }

    /// Hand merkle block hashes to a free peer, or queue them until one
    /// becomes free
    pub fn request_merkle_blocks(&self, hashes: Vec<Hash>) {
        if hashes.is_empty() {
            return;
        }
        let mut state = self.state();
        state.pending_blocks.extend(hashes);
        Self::dispatch_locked(&mut state);
    }

    fn dispatch_pending(&self) {
        let mut state = self.state();
        Self::dispatch_locked(&mut state);
    }

    fn dispatch_locked(state: &mut GroupState) {
        while !state.pending_blocks.is_empty() {
            let handle = match state.free_peer() {
                Some(handle) => handle.clone(),
                None => return,
            };
            let count = state.pending_blocks.len().min(MAX_MERKLE_BLOCKS_PER_REQUEST);
            let batch: Vec<Hash> = state.pending_blocks.drain(..count).collect();

            handle.mark_busy();
            if !handle.send(PeerCommand::RequestMerkleBlocks(batch.clone())) {
                handle.availability().unassign();
                // Connection is going away; its disconnect removes the handle
                for hash in batch.into_iter().rev() {
                    state.pending_blocks.push_front(hash);
                }
                return;
            }
        }
    }

    pub fn pending_merkle_blocks(&self) -> usize {
        self.state().pending_blocks.len()
    }

    /// Replace the filter and push it to every ready peer.
    ///
    /// Lock order is filter then state, the same as `peer_ready`.
    pub fn set_bloom_filter(&self, filter: BloomFilter) {
        let mut current = self
            .bloom_filter
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for handle in self.state().ready_handles() {
            handle.send(PeerCommand::SetBloomFilter(filter.clone()));
        }
        *current = Some(filter);
    }

    /// Offer a transaction to every ready peer, or hold it until one is
    pub fn relay(&self, tx: Transaction) {
        let mut state = self.state();
        if state.ready.is_empty() {
            debug!("No ready peers, holding {} for relay", tx.hash_hex());
            state.pending_relays.push(tx);
            return;
        }
        for handle in state.ready_handles() {
            handle.send(PeerCommand::Relay(Box::new(tx.clone())));
        }
    }
}

impl TransactionRelay for PeerGroup {
    fn relay(&self, tx: Transaction) {
        PeerGroup::relay(self, tx);
    }
}

// =============================================================================
// Tests
// =============================================================================
