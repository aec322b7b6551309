//! Per-peer session state.
//!
//! A [`Connection`] owns everything the protocol remembers about one socket
//! session: handshake exchange, the outgoing write queue, sync bookkeeping in
//! both directions, and the peer's block and transaction knowledge. It holds
//! no socket; the reactor drains [`Connection::take_write_batch`] and reports
//! completions back.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use ledgernet_messages::{
    GoAwayMessage, GoAwayReason, HandshakeMessage, IdListMode, NetMessage, NoticeMessage,
    RequestMessage, SelectIds, SyncRequestMessage, TimeMessage,
};
use ledgernet_types::{BlockId, BlockNum, Digest, Timestamp, TxId};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::chain::Chain;
use crate::handshake::Handshaker;
use crate::index::{NodeTransactionIndex, PeerBlockIndex, PeerBlockState, TransactionIndex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Eligible for broadcasts and sync requests.
    Current,
    /// One side is catching the other up; broadcasts skip it.
    Syncing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established(SessionMode),
    Closed,
}

/// An in-flight block range pull, in either direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncState {
    pub start_block: BlockNum,
    pub end_block: BlockNum,
    /// Last block number sent or received for this range.
    pub last: BlockNum,
    pub start_time: Timestamp,
}

impl SyncState {
    pub fn new(start_block: BlockNum, end_block: BlockNum, last: BlockNum, now: Timestamp) -> Self {
        Self {
            start_block,
            end_block,
            last,
            start_time: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    /// Waiting on blocks of a sync chunk.
    Sync,
    /// Waiting on items named in a `Request`.
    Fetch,
}

/// An armed response-expected timer. The token lets the reactor tell a
/// stale firing from the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseWait {
    pub token: u64,
    pub kind: WaitKind,
}

/// Work to do once a queued write has hit the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteCompletion {
    /// A pooled transaction send finished; release its pool pin.
    Transaction(TxId),
    /// A go-away went out; the session is over.
    Close(GoAwayReason),
}

#[derive(Clone, Debug)]
pub struct QueuedWrite {
    pub bytes: Arc<[u8]>,
    pub completion: Option<WriteCompletion>,
}

/// Operator view of one connection.
#[derive(Clone, Debug, Serialize)]
pub struct PeerStatus {
    pub peer: String,
    pub connecting: bool,
    pub syncing: bool,
    pub last_handshake: HandshakeMessage,
}

pub struct Connection {
    id: ConnectionId,
    /// Configured dial target; empty for inbound sessions.
    peer_addr: String,
    remote_addr: Option<SocketAddr>,

    pub connecting: bool,
    pub syncing: bool,
    pub socket_open: bool,

    pub last_handshake_sent: HandshakeMessage,
    pub last_handshake_recv: HandshakeMessage,
    pub sent_handshake_count: u16,
    pub protocol_version: u16,
    pub node_id: Digest,

    write_queue: VecDeque<QueuedWrite>,
    in_flight: Option<Vec<WriteCompletion>>,
    released: Vec<TxId>,
    /// Set once a go-away is queued; nothing else is queued after it.
    pub close_after_send: Option<GoAwayReason>,

    /// The peer's outstanding pull from us.
    pub peer_requested: Option<SyncState>,
    /// Our outstanding sync pull from the peer.
    pub sync_receiving: Option<SyncState>,
    /// Our outstanding notice-driven request to the peer.
    pub last_req: Option<RequestMessage>,
    pub no_retry: GoAwayReason,

    pub fork_head: BlockId,
    pub fork_head_num: BlockNum,

    pub blk_state: PeerBlockIndex,
    pub trx_state: TransactionIndex,

    response_wait: Option<ResponseWait>,
    wait_seq: u64,

    last_time_xmt: Timestamp,
    pub clock_offset_ns: Option<i64>,
}

impl Connection {
    fn new(id: ConnectionId, peer_addr: String, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer_addr,
            remote_addr,
            connecting: false,
            syncing: false,
            socket_open: false,
            last_handshake_sent: HandshakeMessage::default(),
            last_handshake_recv: HandshakeMessage::default(),
            sent_handshake_count: 0,
            protocol_version: 0,
            node_id: Digest::ZERO,
            write_queue: VecDeque::new(),
            in_flight: None,
            released: Vec::new(),
            close_after_send: None,
            peer_requested: None,
            sync_receiving: None,
            last_req: None,
            no_retry: GoAwayReason::None,
            fork_head: BlockId::ZERO,
            fork_head_num: 0,
            blk_state: PeerBlockIndex::new(),
            trx_state: TransactionIndex::new(),
            response_wait: None,
            wait_seq: 0,
            last_time_xmt: Timestamp::EPOCH,
            clock_offset_ns: None,
        }
    }

    /// A session we are dialing to a configured address.
    pub fn outbound(id: ConnectionId, peer_addr: impl Into<String>) -> Self {
        let mut conn = Self::new(id, peer_addr.into(), None);
        conn.connecting = true;
        conn
    }

    /// A session a remote peer opened to our listener.
    pub fn inbound(id: ConnectionId, remote: SocketAddr) -> Self {
        let mut conn = Self::new(id, String::new(), Some(remote));
        conn.socket_open = true;
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The dial succeeded; the socket is up but the peer has not
    /// introduced itself yet.
    pub fn socket_connected(&mut self, remote: SocketAddr) {
        self.remote_addr = Some(remote);
        self.socket_open = true;
    }

    pub fn connected(&self) -> bool {
        self.socket_open && !self.connecting
    }

    /// Handshake complete and not in a sync exchange.
    pub fn current(&self) -> bool {
        self.connected() && !self.syncing && self.last_handshake_recv.generation > 0
    }

    pub fn state(&self) -> ConnectionState {
        if !self.socket_open {
            if self.connecting {
                return ConnectionState::Connecting;
            }
            return ConnectionState::Closed;
        }
        if self.connecting || self.last_handshake_recv.generation == 0 {
            return ConnectionState::Handshaking;
        }
        if self.syncing {
            ConnectionState::Established(SessionMode::Syncing)
        } else {
            ConnectionState::Established(SessionMode::Current)
        }
    }

    /// Name used in logs and for duplicate detection: the peer's advertised
    /// p2p address once known, else whatever we know it by.
    pub fn peer_name(&self) -> String {
        if !self.last_handshake_recv.p2p_address.is_empty() {
            return self.last_handshake_recv.p2p_address.clone();
        }
        if !self.peer_addr.is_empty() {
            return self.peer_addr.clone();
        }
        match self.remote_addr {
            Some(addr) => addr.to_string(),
            None => "connecting client".into(),
        }
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            peer: if self.peer_addr.is_empty() {
                self.peer_name()
            } else {
                self.peer_addr.clone()
            },
            connecting: self.connecting,
            syncing: self.syncing,
            last_handshake: self.last_handshake_recv.clone(),
        }
    }

    // -- Write queue ------------------------------------------------------------

    /// Encode and queue a message. A go-away closes the session once it has
    /// been written; anything queued after it is dropped.
    pub fn enqueue(&mut self, msg: impl Into<NetMessage>) {
        let msg = msg.into();
        let bytes = match ledgernet_protocol::encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %self.peer_name(), msg = msg.type_name(), error = %e, "dropping unencodable message");
                return;
            }
        };
        let completion = match &msg {
            NetMessage::GoAway(g) => Some(WriteCompletion::Close(g.reason)),
            _ => None,
        };
        if self.enqueue_bytes(Arc::from(bytes), completion) {
            if let NetMessage::GoAway(g) = &msg {
                debug!(peer = %self.peer_name(), reason = %g.reason, "queued go away");
                self.close_after_send = Some(g.reason);
            }
        }
    }

    /// Queue pre-framed bytes. Returns `false` if the session is already
    /// winding down after a go-away.
    pub fn enqueue_bytes(&mut self, bytes: Arc<[u8]>, completion: Option<WriteCompletion>) -> bool {
        if self.close_after_send.is_some() {
            trace!(peer = %self.peer_name(), "write after go away dropped");
            return false;
        }
        self.write_queue.push_back(QueuedWrite { bytes, completion });
        true
    }

    /// Hand everything queued to the writer as one ordered batch, unless a
    /// batch is already on its way.
    pub fn take_write_batch(&mut self) -> Option<Vec<Arc<[u8]>>> {
        if self.in_flight.is_some() || self.write_queue.is_empty() {
            return None;
        }
        let mut bytes = Vec::with_capacity(self.write_queue.len());
        let mut completions = Vec::new();
        for write in self.write_queue.drain(..) {
            bytes.push(write.bytes);
            completions.extend(write.completion);
        }
        self.in_flight = Some(completions);
        Some(bytes)
    }

    /// The in-flight batch was written; returns its completions in order.
    pub fn finish_write_batch(&mut self) -> Vec<WriteCompletion> {
        self.in_flight.take().unwrap_or_default()
    }

    pub fn write_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn queued_writes(&self) -> usize {
        self.write_queue.len()
    }

    /// Drop unsent writes. A queued go-away survives so the session still
    /// ends; dropped transaction sends are reported through
    /// [`Connection::take_released`].
    pub fn flush_queues(&mut self) {
        let mut kept = VecDeque::new();
        for write in self.write_queue.drain(..) {
            match write.completion {
                Some(WriteCompletion::Transaction(id)) => self.released.push(id),
                Some(WriteCompletion::Close(_)) => kept.push_back(write),
                None => {}
            }
        }
        self.write_queue = kept;
    }

    /// Pooled transactions whose sends were dropped without being written.
    pub fn take_released(&mut self) -> Vec<TxId> {
        std::mem::take(&mut self.released)
    }

    /// Every pooled transaction still queued or in flight; used when the
    /// session dies with writes outstanding.
    pub fn release_all(&mut self) -> Vec<TxId> {
        self.flush_queues();
        let mut ids = self.take_released();
        for completion in self.in_flight.take().unwrap_or_default() {
            if let WriteCompletion::Transaction(id) = completion {
                ids.push(id);
            }
        }
        for write in self.write_queue.drain(..) {
            if let Some(WriteCompletion::Transaction(id)) = write.completion {
                ids.push(id);
            }
        }
        ids
    }

    // -- Response timers --------------------------------------------------------

    pub fn expect_response(&mut self, kind: WaitKind) {
        self.wait_seq += 1;
        self.response_wait = Some(ResponseWait {
            token: self.wait_seq,
            kind,
        });
    }

    pub fn sync_wait(&mut self) {
        self.expect_response(WaitKind::Sync);
    }

    pub fn fetch_wait(&mut self) {
        self.expect_response(WaitKind::Fetch);
    }

    pub fn cancel_wait(&mut self) {
        self.response_wait = None;
    }

    pub fn response_wait(&self) -> Option<ResponseWait> {
        self.response_wait
    }

    /// Consume the wait if `token` is the one currently armed.
    pub fn take_response_wait(&mut self, token: u64) -> Option<WaitKind> {
        match self.response_wait {
            Some(wait) if wait.token == token => {
                self.response_wait = None;
                Some(wait.kind)
            }
            _ => None,
        }
    }

    // -- Handshake and clock ----------------------------------------------------

    pub fn send_handshake(&mut self, handshaker: &Handshaker, chain: &dyn Chain, now: Timestamp) {
        self.sent_handshake_count = self.sent_handshake_count.saturating_add(1);
        let msg = handshaker.populate(chain, now, self.sent_handshake_count);
        debug!(
            peer = %self.peer_name(),
            generation = msg.generation,
            lib = msg.last_irreversible_block_num,
            head = msg.head_num,
            "sending handshake"
        );
        self.last_handshake_sent = msg.clone();
        self.enqueue(msg);
    }

    /// Keepalive probe.
    pub fn send_time(&mut self, now: Timestamp) {
        self.enqueue(TimeMessage {
            org: Timestamp::EPOCH,
            rec: Timestamp::EPOCH,
            xmt: now,
            dst: Timestamp::EPOCH,
        });
    }

    /// Handle a time message received at `now`. Probes are answered; an
    /// answer to our probe yields the estimated clock offset in nanoseconds.
    pub fn recv_time(&mut self, msg: &TimeMessage, now: Timestamp) -> Option<i64> {
        if msg.xmt.is_epoch() || msg.xmt == self.last_time_xmt {
            return None;
        }
        self.last_time_xmt = msg.xmt;
        if msg.org.is_epoch() {
            self.enqueue(TimeMessage {
                org: msg.xmt,
                rec: now,
                xmt: now,
                dst: Timestamp::EPOCH,
            });
            return None;
        }
        let ns = |t: Timestamp| t.as_nanos() as i128;
        let offset = ((ns(msg.rec) - ns(msg.org)) + (ns(msg.xmt) - ns(now))) / 2;
        let offset = offset.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        self.clock_offset_ns = Some(offset);
        Some(offset)
    }

    // -- Block and transaction serving ------------------------------------------

    /// Record knowledge of a block. Returns `true` if the block was new to
    /// this peer's index.
    pub fn add_peer_block(&mut self, entry: PeerBlockState) -> bool {
        let id = entry.id;
        if self.blk_state.contains(&id) {
            self.blk_state.modify(&id, |e| {
                e.is_known |= entry.is_known;
                e.is_noticed |= entry.is_noticed;
                if entry.block_num != 0 {
                    e.block_num = entry.block_num;
                }
                if !entry.request_time.is_epoch() {
                    e.request_time = entry.request_time;
                }
            });
            false
        } else {
            self.blk_state.insert(id, entry);
            true
        }
    }

    /// Queue the next block of the peer's outstanding pull, if any.
    pub fn enqueue_sync_block(&mut self, chain: &dyn Chain) -> bool {
        let Some(req) = self.peer_requested.as_mut() else {
            return false;
        };
        req.last += 1;
        let num = req.last;
        if num >= req.end_block {
            self.peer_requested = None;
        }
        match chain.fetch_block_by_number(num) {
            Some(block) => {
                trace!(peer = %self.peer_name(), block = num, "enqueue sync block");
                self.enqueue(block);
                true
            }
            None => {
                warn!(peer = %self.peer_name(), block = num, "sync block unavailable, dropping peer request");
                self.peer_requested = None;
                false
            }
        }
    }

    /// Serve a catch-up request: everything from the peer's last
    /// irreversible block up to our head.
    pub fn blk_send_branch(&mut self, chain: &dyn Chain, now: Timestamp) {
        let head_num = chain.head_block_num();
        if head_num == 0 {
            self.enqueue(NoticeMessage {
                known_blocks: SelectIds::new(IdListMode::Normal, 0, vec![]),
                ..Default::default()
            });
            return;
        }
        let peer_lib = self.last_handshake_recv.last_irreversible_block_num;
        let (start, end) = match self.peer_requested {
            None => (peer_lib + 1, head_num),
            Some(prev) => (
                (prev.last + 1).min(peer_lib + 1),
                prev.end_block.max(head_num),
            ),
        };
        if start <= end {
            debug!(peer = %self.peer_name(), start, end, "sending branch");
            self.peer_requested = Some(SyncState::new(start, end, start - 1, now));
            self.enqueue_sync_block(chain);
        }
        self.syncing = false;
    }

    pub fn blk_send(&mut self, id: &BlockId, chain: &dyn Chain) {
        match chain.fetch_block_by_id(id) {
            Some(block) => self.enqueue(block),
            None => debug!(peer = %self.peer_name(), block = %id, "requested block not found"),
        }
    }

    fn send_pooled_txn(&mut self, pool: &mut NodeTransactionIndex, id: TxId) {
        let Some(bytes) = pool
            .get(&id)
            .filter(|t| !t.serialized_txn.is_empty())
            .map(|t| Arc::clone(&t.serialized_txn))
        else {
            return;
        };
        if self.enqueue_bytes(bytes, Some(WriteCompletion::Transaction(id))) {
            pool.modify(&id, |t| t.requests += 1);
        }
    }

    /// Send every unconfirmed pooled transaction the peer did not list.
    pub fn txn_send_pending(&mut self, pool: &mut NodeTransactionIndex, known: &[TxId]) {
        let known: BTreeSet<&TxId> = known.iter().collect();
        let ids: Vec<TxId> = pool
            .iter()
            .filter(|(id, t)| t.block_num == 0 && !known.contains(id))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.send_pooled_txn(pool, id);
        }
    }

    pub fn txn_send(&mut self, pool: &mut NodeTransactionIndex, ids: &[TxId]) {
        for id in ids {
            self.send_pooled_txn(pool, *id);
        }
    }

    /// Ask the peer for a block range and start the response timer.
    pub fn request_sync_blocks(&mut self, start: BlockNum, end: BlockNum, now: Timestamp) {
        self.sync_receiving = Some(SyncState::new(start, end, start.saturating_sub(1), now));
        self.enqueue(SyncRequestMessage {
            start_block: start,
            end_block: end,
        });
        self.sync_wait();
    }

    /// Abandon our sync pull from this peer. Serious reasons end the
    /// session; otherwise the peer is told to stop sending.
    pub fn cancel_sync(&mut self, reason: GoAwayReason) {
        debug!(peer = %self.peer_name(), reason = %reason, "cancel sync");
        self.flush_queues();
        self.sync_receiving = None;
        match reason {
            GoAwayReason::Validation | GoAwayReason::FatalOther => {
                self.no_retry = reason;
                self.enqueue(GoAwayMessage {
                    reason,
                    node_id: Digest::ZERO,
                });
            }
            _ => self.enqueue(SyncRequestMessage {
                start_block: 0,
                end_block: 0,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection set
// ---------------------------------------------------------------------------

/// Every live session, ordered by id.
#[derive(Default)]
pub struct ConnectionSet {
    conns: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
    pending_close: VecDeque<ConnectionId>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    pub fn add_outbound(&mut self, peer_addr: impl Into<String>) -> ConnectionId {
        let id = self.allocate_id();
        self.conns.insert(id, Connection::outbound(id, peer_addr));
        id
    }

    pub fn add_inbound(&mut self, remote: SocketAddr) -> ConnectionId {
        let id = self.allocate_id();
        self.conns.insert(id, Connection::inbound(id, remote));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.conns.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn find_by_peer_addr(&self, peer_addr: &str) -> Option<ConnectionId> {
        self.conns
            .values()
            .find(|c| c.peer_addr == peer_addr)
            .map(|c| c.id)
    }

    /// Mark a session for closing. It stops counting as connected at once;
    /// the owner removes it on its next pass. A session with a go-away
    /// queued is left to close once that is written.
    pub fn request_close(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        conn.socket_open = false;
        conn.connecting = false;
        if conn.close_after_send.is_none() && !self.pending_close.contains(&id) {
            self.pending_close.push_back(id);
        }
    }

    pub fn take_pending_close(&mut self) -> Option<ConnectionId> {
        self.pending_close.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgernet_protocol::decode;

    fn decoded(bytes: &[Arc<[u8]>]) -> Vec<NetMessage> {
        bytes.iter().map(|b| decode(b).unwrap().0).collect()
    }

    #[test]
    fn writes_batch_in_order() {
        let mut c = Connection::inbound(ConnectionId(1), "127.0.0.1:1".parse().unwrap());
        c.enqueue(SyncRequestMessage { start_block: 1, end_block: 2 });
        c.enqueue(SyncRequestMessage { start_block: 3, end_block: 4 });

        let batch = c.take_write_batch().unwrap();
        assert_eq!(
            decoded(&batch),
            vec![
                SyncRequestMessage { start_block: 1, end_block: 2 }.into(),
                SyncRequestMessage { start_block: 3, end_block: 4 }.into(),
            ]
        );

        // Nothing more until the batch completes.
        c.enqueue(SyncRequestMessage { start_block: 5, end_block: 6 });
        assert!(c.take_write_batch().is_none());
        assert!(c.finish_write_batch().is_empty());
        assert_eq!(c.take_write_batch().map(|b| b.len()), Some(1));
    }

    #[test]
    fn go_away_blocks_further_writes_and_survives_flush() {
        let mut c = Connection::inbound(ConnectionId(1), "127.0.0.1:1".parse().unwrap());
        c.enqueue(GoAwayMessage { reason: GoAwayReason::Forked, node_id: Digest::ZERO });
        c.enqueue(SyncRequestMessage::default());
        assert_eq!(c.queued_writes(), 1);
        assert_eq!(c.close_after_send, Some(GoAwayReason::Forked));

        c.flush_queues();
        assert_eq!(c.queued_writes(), 1);
        c.take_write_batch().unwrap();
        assert_eq!(
            c.finish_write_batch(),
            vec![WriteCompletion::Close(GoAwayReason::Forked)]
        );
    }

    #[test]
    fn flush_releases_pooled_sends() {
        let mut c = Connection::inbound(ConnectionId(1), "127.0.0.1:1".parse().unwrap());
        let id = TxId::new([1; 32]);
        assert!(c.enqueue_bytes(Arc::from(vec![0u8; 3]), Some(WriteCompletion::Transaction(id))));
        c.flush_queues();
        assert_eq!(c.queued_writes(), 0);
        assert_eq!(c.take_released(), vec![id]);
    }

    #[test]
    fn stale_wait_token_ignored() {
        let mut c = Connection::outbound(ConnectionId(1), "peer:9876");
        c.fetch_wait();
        let first = c.response_wait().unwrap().token;
        c.sync_wait();
        assert_eq!(c.take_response_wait(first), None);
        let second = c.response_wait().unwrap().token;
        assert_eq!(c.take_response_wait(second), Some(WaitKind::Sync));
        assert!(c.response_wait().is_none());
    }

    #[test]
    fn state_progression() {
        let mut c = Connection::outbound(ConnectionId(1), "peer:9876");
        assert_eq!(c.state(), ConnectionState::Connecting);
        c.socket_connected("10.0.0.2:9876".parse().unwrap());
        assert_eq!(c.state(), ConnectionState::Handshaking);
        c.connecting = false;
        c.last_handshake_recv.generation = 1;
        assert_eq!(c.state(), ConnectionState::Established(SessionMode::Current));
        assert!(c.current());
        c.syncing = true;
        assert_eq!(c.state(), ConnectionState::Established(SessionMode::Syncing));
        assert!(!c.current());
    }

    #[test]
    fn time_probe_answered_and_offset_computed() {
        let mut a = Connection::inbound(ConnectionId(1), "127.0.0.1:1".parse().unwrap());
        let probe = TimeMessage {
            xmt: Timestamp::from_secs(100),
            ..Default::default()
        };
        assert_eq!(a.recv_time(&probe, Timestamp::from_secs(102)), None);
        let reply = decoded(&a.take_write_batch().unwrap());
        assert_eq!(
            reply,
            vec![TimeMessage {
                org: Timestamp::from_secs(100),
                rec: Timestamp::from_secs(102),
                xmt: Timestamp::from_secs(102),
                dst: Timestamp::EPOCH,
            }
            .into()]
        );

        // Our probe left at 10, peer stamped 12 on receive and send, we got it at 10.
        let mut b = Connection::inbound(ConnectionId(2), "127.0.0.1:2".parse().unwrap());
        let answer = TimeMessage {
            org: Timestamp::from_secs(10),
            rec: Timestamp::from_secs(12),
            xmt: Timestamp::from_secs(12),
            dst: Timestamp::EPOCH,
        };
        assert_eq!(
            b.recv_time(&answer, Timestamp::from_secs(10)),
            Some(2_000_000_000)
        );
        // Duplicate transmit time is ignored.
        assert_eq!(b.recv_time(&answer, Timestamp::from_secs(11)), None);
    }

    #[test]
    fn request_close_defers_for_go_away() {
        let mut set = ConnectionSet::new();
        let a = set.add_inbound("127.0.0.1:1".parse().unwrap());
        let b = set.add_inbound("127.0.0.1:2".parse().unwrap());
        set.get_mut(b)
            .unwrap()
            .enqueue(GoAwayMessage { reason: GoAwayReason::Duplicate, node_id: Digest::ZERO });

        set.request_close(a);
        set.request_close(a);
        set.request_close(b);
        assert_eq!(set.take_pending_close(), Some(a));
        assert_eq!(set.take_pending_close(), None);
        assert!(!set.get(b).unwrap().connected());
    }
}
