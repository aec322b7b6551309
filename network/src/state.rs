//! The net layer's protocol state and its lifecycle operations.
//!
//! [`NetState`] owns every connection, both managers, the local transaction
//! pool and the chain handle. It never touches a socket: the reactor feeds
//! it events and drains the write queues it fills. Each public event method
//! leaves the state settled, with requested closes applied.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ledgernet_messages::{GoAwayMessage, GoAwayReason, PackedTransaction, SignedBlock};
use ledgernet_types::{Digest, Timestamp, TxId};
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::clock::Clock;
use crate::connection::{Connection, ConnectionId, ConnectionSet, PeerStatus, WaitKind, WriteCompletion};
use crate::context::NetContext;
use crate::dispatch::DispatchManager;
use crate::handshake::Handshaker;
use crate::index::NodeTransactionIndex;
use crate::sync::SyncManager;

pub const ADDED_CONNECTION: &str = "added connection";
pub const ALREADY_CONNECTED: &str = "already connected";
pub const CONNECTION_REMOVED: &str = "connection removed";
pub const NO_KNOWN_CONNECTION: &str = "no known connection for host";

#[derive(Clone, Debug)]
pub struct NetSettings {
    /// Blocks per sync chunk.
    pub sync_fetch_span: u32,
    /// Largest framed item pushed directly; larger ones are noticed.
    pub max_implicit_request: usize,
    /// Inbound session limit, 0 for unlimited.
    pub max_clients: usize,
    pub max_nodes_per_host: usize,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            sync_fetch_span: 100,
            max_implicit_request: 1500,
            max_clients: 25,
            max_nodes_per_host: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetStats {
    pub blocks_received: u64,
    pub transactions_received: u64,
    pub go_aways_sent: u64,
}

pub struct NetState<C: Chain> {
    pub(crate) connections: ConnectionSet,
    pub(crate) sync: SyncManager,
    pub(crate) dispatch: DispatchManager,
    pub(crate) local_txns: NodeTransactionIndex,
    pub(crate) handshaker: Handshaker,
    pub(crate) chain: C,
    clock: Arc<dyn Clock>,
    settings: NetSettings,
    /// Configured dial targets and the no-retry reason of their last session.
    configured_peers: BTreeMap<String, GoAwayReason>,
    closed: Vec<ConnectionId>,
    pub(crate) stats: NetStats,
}

impl<C: Chain> NetState<C> {
    pub fn new(chain: C, handshaker: Handshaker, settings: NetSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            connections: ConnectionSet::new(),
            sync: SyncManager::new(settings.sync_fetch_span),
            dispatch: DispatchManager::new(settings.max_implicit_request),
            local_txns: NodeTransactionIndex::new(),
            handshaker,
            chain,
            clock,
            settings,
            configured_peers: BTreeMap::new(),
            closed: Vec::new(),
            stats: NetStats::default(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn dispatch(&self) -> &DispatchManager {
        &self.dispatch
    }

    pub fn local_txns(&self) -> &NodeTransactionIndex {
        &self.local_txns
    }

    pub fn handshaker(&self) -> &Handshaker {
        &self.handshaker
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut C {
        &mut self.chain
    }

    pub fn settings(&self) -> &NetSettings {
        &self.settings
    }

    pub fn stats(&self) -> NetStats {
        self.stats
    }

    /// Connections handshaken and not in a sync exchange.
    pub fn current_peers(&self) -> usize {
        self.connections.iter().filter(|c| c.current()).count()
    }

    /// Split into the pieces the managers borrow independently.
    pub(crate) fn parts(
        &mut self,
    ) -> (
        NetContext<'_>,
        &mut SyncManager,
        &mut DispatchManager,
        &mut NodeTransactionIndex,
    ) {
        let now = self.clock.now();
        (
            NetContext {
                conns: &mut self.connections,
                chain: &self.chain,
                handshaker: &self.handshaker,
                now,
            },
            &mut self.sync,
            &mut self.dispatch,
            &mut self.local_txns,
        )
    }

    // -- Session lifecycle ------------------------------------------------------

    /// Register a dial target. Returns `false` if it was already configured.
    pub fn add_configured_peer(&mut self, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        if self.configured_peers.contains_key(&addr) {
            return false;
        }
        self.configured_peers.insert(addr, GoAwayReason::None);
        true
    }

    /// Configured targets with no live session whose last session did not
    /// end with a no-retry reason.
    pub fn peers_to_dial(&self) -> Vec<String> {
        self.configured_peers
            .iter()
            .filter(|(addr, reason)| {
                **reason == GoAwayReason::None && self.connections.find_by_peer_addr(addr).is_none()
            })
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn start_dial(&mut self, addr: &str) -> ConnectionId {
        let id = self.connections.add_outbound(addr);
        debug!(peer = addr, conn = %id, "dialing");
        id
    }

    pub fn dial_succeeded(&mut self, id: ConnectionId, remote: SocketAddr) {
        let now = self.now();
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        c.socket_connected(remote);
        c.connecting = false;
        info!(peer = %c.peer_name(), remote = %remote, "connection established");
        c.send_handshake(&self.handshaker, &self.chain, now);
    }

    pub fn dial_failed(&mut self, id: ConnectionId, error: &str) {
        if let Some(c) = self.connections.get(id) {
            warn!(peer = %c.peer_name(), error, "connection failed");
        }
        self.close(id);
        self.settle();
    }

    /// Admit an inbound socket unless the client or per-host limit is hit.
    pub fn accept_inbound(&mut self, remote: SocketAddr) -> Option<ConnectionId> {
        let mut visitors = 0;
        let mut from_host = 0;
        for c in self.connections.iter() {
            if !c.peer_addr().is_empty() {
                continue;
            }
            visitors += 1;
            if c.remote_addr().map(|a| a.ip()) == Some(remote.ip()) {
                from_host += 1;
            }
        }
        if from_host >= self.settings.max_nodes_per_host {
            info!(remote = %remote, from_host, "refusing connection, too many from host");
            return None;
        }
        if self.settings.max_clients != 0 && visitors >= self.settings.max_clients {
            info!(remote = %remote, visitors, "refusing connection, max clients reached");
            return None;
        }
        let now = self.now();
        let id = self.connections.add_inbound(remote);
        if let Some(c) = self.connections.get_mut(id) {
            info!(remote = %remote, conn = %id, "accepted connection");
            c.send_handshake(&self.handshaker, &self.chain, now);
        }
        Some(id)
    }

    pub(crate) fn go_away(&mut self, id: ConnectionId, reason: GoAwayReason) {
        if let Some(c) = self.connections.get_mut(id) {
            c.enqueue(GoAwayMessage {
                reason,
                node_id: Digest::ZERO,
            });
        }
    }

    fn release_txn(&mut self, id: &TxId) {
        self.local_txns
            .modify(id, |t| t.requests = t.requests.saturating_sub(1));
    }

    /// Tear a session down. The connection leaves the set before its fetch
    /// and sync duties are handed to the remaining peers.
    pub fn close(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };
        info!(peer = %conn.peer_name(), conn = %id, "closing connection");
        for tx in conn.release_all() {
            self.release_txn(&tx);
        }
        let last_req = conn.last_req.take();
        if !conn.peer_addr().is_empty() {
            if let Some(reason) = self.configured_peers.get_mut(conn.peer_addr()) {
                *reason = conn.no_retry;
            }
        }
        drop(conn);

        let (mut ctx, sync, dispatch, _) = self.parts();
        if let Some(req) = last_req {
            dispatch.retry_fetch(ctx.conns, id, req);
        }
        sync.reset_lib_num(&mut ctx, id);
        self.closed.push(id);
    }

    /// Apply closes requested during the last step and return pool pins
    /// held by dropped writes.
    pub fn settle(&mut self) {
        loop {
            let released: Vec<TxId> = self
                .connections
                .iter_mut()
                .flat_map(|c| c.take_released())
                .collect();
            for tx in &released {
                self.release_txn(tx);
            }
            match self.connections.take_pending_close() {
                Some(id) => self.close(id),
                None => break,
            }
        }
    }

    /// Sessions removed since the last call; their sockets and timers go.
    pub fn take_closed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.closed)
    }

    pub fn close_all(&mut self) {
        for id in self.connections.ids() {
            self.close(id);
        }
        self.settle();
    }

    // -- Reactor events ---------------------------------------------------------

    /// Everything queued for `id`, unless a batch is already being written.
    pub fn take_write_batch(&mut self, id: ConnectionId) -> Option<Vec<Arc<[u8]>>> {
        self.connections.get_mut(id)?.take_write_batch()
    }

    /// The writer finished the batch it was handed.
    pub fn on_write_complete(&mut self, id: ConnectionId) {
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        let mut go_away = None;
        for completion in c.finish_write_batch() {
            match completion {
                WriteCompletion::Transaction(tx) => {
                    self.local_txns
                        .modify(&tx, |t| t.requests = t.requests.saturating_sub(1));
                }
                WriteCompletion::Close(reason) => go_away = Some(reason),
            }
        }
        if let Some(reason) = go_away {
            self.stats.go_aways_sent += 1;
            info!(peer = %c.peer_name(), reason = %reason, "go away sent");
            self.close(id);
        } else if c.queued_writes() == 0 && c.connected() {
            c.enqueue_sync_block(&self.chain);
        }
        self.settle();
    }

    pub fn on_io_error(&mut self, id: ConnectionId, error: &str) {
        if let Some(c) = self.connections.get(id) {
            debug!(peer = %c.peer_name(), error, "connection io error");
        }
        self.close(id);
        self.settle();
    }

    /// A response timer fired. Stale tokens are ignored.
    pub fn on_response_timeout(&mut self, id: ConnectionId, token: u64) {
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        let Some(kind) = c.take_response_wait(token) else {
            return;
        };
        debug!(peer = %c.peer_name(), kind = ?kind, "response timeout");
        let last_req = match kind {
            WaitKind::Fetch => c.last_req.take(),
            WaitKind::Sync => None,
        };
        let (mut ctx, sync, dispatch, _) = self.parts();
        match kind {
            WaitKind::Sync => sync.reassign_fetch(&mut ctx, id, GoAwayReason::BenignOther),
            WaitKind::Fetch => {
                if let Some(req) = last_req {
                    dispatch.retry_fetch(ctx.conns, id, req);
                }
            }
        }
        self.settle();
    }

    // -- Periodic work ----------------------------------------------------------

    /// Drop expired and irreversibly included transactions from the pool
    /// and prune peer knowledge at or below our LIB.
    pub fn expire_txns(&mut self) {
        let now = self.now();
        let lib = self.chain.last_irreversible_block_num();
        let expired = self.local_txns.erase_expired_through(now);
        let included = if lib > 0 {
            self.local_txns.erase_block_num_range(1..=lib)
        } else {
            0
        };
        for c in self.connections.iter_mut() {
            c.trx_state.erase_expired_through(now);
            if lib > 0 {
                c.trx_state.erase_block_num_range(1..=lib);
                c.blk_state.erase_block_num_range(1..=lib);
            }
        }
        if expired + included > 0 {
            debug!(expired, included, remaining = self.local_txns.len(), "expired transactions");
        }
    }

    pub fn keepalive(&mut self) {
        let now = self.now();
        for c in self.connections.iter_mut() {
            if c.connected() {
                c.send_time(now);
            }
        }
    }

    // -- Operator API -----------------------------------------------------------

    /// Add a dial target. Returns the session to dial, or `None` when a
    /// live session to `addr` already exists.
    pub fn connect(&mut self, addr: &str) -> Option<ConnectionId> {
        if self.connections.find_by_peer_addr(addr).is_some() {
            return None;
        }
        self.configured_peers.insert(addr.to_string(), GoAwayReason::None);
        Some(self.start_dial(addr))
    }

    pub fn disconnect(&mut self, addr: &str) -> &'static str {
        let configured = self.configured_peers.remove(addr).is_some();
        let live = self.connections.find_by_peer_addr(addr);
        if let Some(id) = live {
            if let Some(c) = self.connections.get_mut(id) {
                c.flush_queues();
            }
            self.close(id);
            self.settle();
        }
        if configured || live.is_some() {
            CONNECTION_REMOVED
        } else {
            NO_KNOWN_CONNECTION
        }
    }

    pub fn status(&self, addr: &str) -> Option<PeerStatus> {
        self.connections
            .find_by_peer_addr(addr)
            .and_then(|id| self.connections.get(id))
            .map(Connection::status)
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.connections.iter().map(Connection::status).collect()
    }

    /// Relay a block the local producer applied.
    pub fn broadcast_block(&mut self, block: &SignedBlock) {
        self.note_block_txns(block);
        let (mut ctx, _, dispatch, _) = self.parts();
        dispatch.bcast_block(&mut ctx, block);
        self.settle();
    }

    /// Relay a transaction the local node accepted.
    pub fn broadcast_transaction(&mut self, trx: &PackedTransaction) {
        self.dispatch
            .bcast_transaction(&mut self.connections, &mut self.local_txns, trx);
        self.settle();
    }

    /// Stamp pooled and peer-known transactions with the block that
    /// included them, so LIB pruning can drop them.
    pub(crate) fn note_block_txns(&mut self, block: &SignedBlock) {
        let num = block.block_num();
        for tx in block.transaction_ids() {
            self.local_txns.modify(&tx, |t| t.block_num = num);
            for c in self.connections.iter_mut() {
                c.trx_state.modify(&tx, |t| t.block_num = num);
            }
        }
    }
}
