//! Inbound message handling, one method per message type.

use ledgernet_messages::{
    ChainSizeMessage, GoAwayMessage, GoAwayReason, HandshakeMessage, IdListMode, NetMessage,
    NoticeMessage, PackedTransaction, RequestMessage, SelectIds, SignedBlock, SyncRequestMessage,
    TimeMessage,
};
use ledgernet_protocol::{network_version, to_protocol_version};
use ledgernet_types::TxId;
use tracing::{debug, info, trace, warn};

use crate::chain::Chain;
use crate::connection::{ConnectionId, SyncState};
use crate::handshake;
use crate::state::NetState;

impl<C: Chain> NetState<C> {
    /// Route one decoded message from `id`. Messages on sessions that are
    /// closing are dropped.
    pub fn handle_message(&mut self, id: ConnectionId, msg: NetMessage) {
        let Some(c) = self.connections.get(id) else {
            return;
        };
        if !c.socket_open {
            trace!(peer = %c.peer_name(), msg = msg.type_name(), "message on closing connection dropped");
            return;
        }
        trace!(peer = %c.peer_name(), msg = msg.type_name(), "received");
        match msg {
            NetMessage::Handshake(m) => self.handle_handshake(id, m),
            NetMessage::ChainSize(m) => self.handle_chain_size(id, &m),
            NetMessage::GoAway(m) => self.handle_go_away(id, &m),
            NetMessage::Time(m) => self.handle_time(id, &m),
            NetMessage::Notice(m) => self.handle_notice(id, &m),
            NetMessage::Request(m) => self.handle_request(id, &m),
            NetMessage::SyncRequest(m) => self.handle_sync_request(id, &m),
            NetMessage::SignedBlock(m) => self.handle_signed_block(id, m),
            NetMessage::PackedTransaction(m) => self.handle_packed_transaction(id, m),
        }
        self.settle();
    }

    /// Another live session already speaks for the node behind `msg`.
    /// Both ends compare the same sums of handshake times, so exactly one
    /// of the two sessions is told to go away.
    fn is_duplicate(&self, id: ConnectionId, msg: &HandshakeMessage) -> bool {
        let Some(c) = self.connections.get(id) else {
            return false;
        };
        if !c.peer_addr().is_empty() && !c.node_id.is_zero() {
            return false;
        }
        let ns = |t: ledgernet_types::Timestamp| u128::from(t.as_nanos());
        let ours = ns(msg.time) + ns(c.last_handshake_sent.time);
        self.connections.iter().any(|other| {
            other.id() != id
                && other.connected()
                && other.peer_name() == msg.p2p_address
                && ours > ns(other.last_handshake_sent.time) + ns(other.last_handshake_recv.time)
        })
    }

    /// Our block at the peer's LIB must be the peer's LIB block.
    fn peer_lib_on_our_chain(&self, msg: &HandshakeMessage) -> bool {
        let peer_lib = msg.last_irreversible_block_num;
        if peer_lib == 0 || peer_lib > self.chain.last_irreversible_block_num() {
            return true;
        }
        match self.chain.get_block_id_for_num(peer_lib) {
            Ok(ours) => ours == msg.last_irreversible_block_id,
            Err(e) => {
                warn!(peer = %msg.p2p_address, block = peer_lib, error = %e, "peer lib unknown locally");
                false
            }
        }
    }

    fn handle_handshake(&mut self, id: ConnectionId, msg: HandshakeMessage) {
        let now = self.now();
        info!(
            peer = %msg.p2p_address,
            generation = msg.generation,
            lib = msg.last_irreversible_block_num,
            head = msg.head_num,
            "received handshake"
        );
        if !handshake::is_valid(&msg) {
            self.go_away(id, GoAwayReason::FatalOther);
            return;
        }

        if msg.generation == 1 {
            if msg.node_id == self.handshaker.node_id {
                warn!(peer = %msg.p2p_address, "self connection detected");
                self.go_away(id, GoAwayReason::FatalOther);
                return;
            }
            if self.is_duplicate(id, &msg) {
                info!(peer = %msg.p2p_address, "duplicate connection, sending go away");
                let node_id = self.handshaker.node_id;
                if let Some(c) = self.connections.get_mut(id) {
                    c.enqueue(GoAwayMessage {
                        reason: GoAwayReason::Duplicate,
                        node_id,
                    });
                    c.no_retry = GoAwayReason::Duplicate;
                }
                return;
            }
            if msg.chain_id != self.chain.chain_id() {
                warn!(peer = %msg.p2p_address, chain_id = %msg.chain_id, "peer on a different chain");
                self.go_away(id, GoAwayReason::WrongChain);
                return;
            }
            let protocol_version = to_protocol_version(msg.network_version);
            if protocol_version != to_protocol_version(network_version()) {
                if self.handshaker.network_version_match {
                    warn!(peer = %msg.p2p_address, version = msg.network_version, "peer network version mismatch");
                    self.go_away(id, GoAwayReason::WrongVersion);
                    return;
                }
                info!(peer = %msg.p2p_address, version = msg.network_version, "peer network version differs");
            }
            if let Some(c) = self.connections.get_mut(id) {
                c.protocol_version = protocol_version;
                c.node_id = msg.node_id;
            }
            if !self.handshaker.authenticate_peer(&msg, &self.chain, now) {
                self.go_away(id, GoAwayReason::Authentication);
                return;
            }
            if !self.peer_lib_on_our_chain(&msg) {
                warn!(peer = %msg.p2p_address, "peer chain is forked");
                self.go_away(id, GoAwayReason::Forked);
                return;
            }
            if let Some(c) = self.connections.get_mut(id) {
                if c.sent_handshake_count == 0 {
                    c.send_handshake(&self.handshaker, &self.chain, now);
                }
            }
        }

        let pending = u32::try_from(self.local_txns.len()).unwrap_or(u32::MAX);
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        c.connecting = false;
        c.last_handshake_recv = msg.clone();
        let (mut ctx, sync, _, _) = self.parts();
        sync.recv_handshake(&mut ctx, id, &msg, pending);
    }

    fn handle_chain_size(&mut self, id: ConnectionId, msg: &ChainSizeMessage) {
        if let Some(c) = self.connections.get(id) {
            debug!(peer = %c.peer_name(), lib = msg.last_irreversible_block_num, head = msg.head_num, "chain size");
        }
    }

    fn handle_go_away(&mut self, id: ConnectionId, msg: &GoAwayMessage) {
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        info!(peer = %c.peer_name(), reason = %msg.reason, "received go away");
        c.no_retry = msg.reason;
        if msg.reason == GoAwayReason::Duplicate {
            c.node_id = msg.node_id;
            debug!(peer = %c.peer_name(), node_id = %msg.node_id, "peer already connected to us");
        }
        c.flush_queues();
        self.close(id);
    }

    fn handle_time(&mut self, id: ConnectionId, msg: &TimeMessage) {
        let now = self.now();
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        if let Some(offset_ns) = c.recv_time(msg, now) {
            debug!(peer = %c.peer_name(), offset_ns, "clock offset");
        }
    }

    fn handle_notice(&mut self, id: ConnectionId, msg: &NoticeMessage) {
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        debug!(
            peer = %c.peer_name(),
            trx_mode = %msg.known_trx.mode,
            trx_pending = msg.known_trx.pending,
            blk_mode = %msg.known_blocks.mode,
            blk_pending = msg.known_blocks.pending,
            "received notice"
        );
        c.connecting = false;

        let mut catch_up_req = None;
        match msg.known_trx.mode {
            IdListMode::LastIrrCatchUp => c.last_handshake_recv.head_num = msg.known_blocks.pending,
            IdListMode::CatchUp if msg.known_trx.pending > 0 => {
                let known: Vec<TxId> = self.local_txns.keys().copied().collect();
                catch_up_req = Some(RequestMessage {
                    req_trx: SelectIds::new(IdListMode::CatchUp, 0, known),
                    req_blocks: SelectIds::default(),
                });
            }
            _ => {}
        }

        let relay = msg.known_trx.mode == IdListMode::Normal
            || msg.known_blocks.mode == IdListMode::Normal;
        let (mut ctx, sync, dispatch, pool) = self.parts();
        if matches!(
            msg.known_blocks.mode,
            IdListMode::CatchUp | IdListMode::LastIrrCatchUp
        ) {
            sync.recv_notice(&mut ctx, id, msg);
        }
        if relay {
            dispatch.recv_notice(&mut ctx, pool, id, msg);
        }
        if let Some(req) = catch_up_req {
            if let Some(c) = ctx.conns.get_mut(id) {
                c.enqueue(req);
            }
        }
    }

    fn handle_request(&mut self, id: ConnectionId, msg: &RequestMessage) {
        if msg.req_blocks.ids.len() > 1 {
            warn!(conn = %id, ids = msg.req_blocks.ids.len(), "request names more than one block");
            self.connections.request_close(id);
            return;
        }
        let now = self.now();
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        match msg.req_blocks.mode {
            IdListMode::CatchUp => c.blk_send_branch(&self.chain, now),
            IdListMode::Normal => {
                if let Some(blk_id) = msg.req_blocks.ids.last() {
                    c.blk_send(blk_id, &self.chain);
                }
            }
            _ => {}
        }
        match msg.req_trx.mode {
            IdListMode::CatchUp => c.txn_send_pending(&mut self.local_txns, &msg.req_trx.ids),
            IdListMode::Normal => c.txn_send(&mut self.local_txns, &msg.req_trx.ids),
            IdListMode::None => {
                if msg.req_blocks.mode == IdListMode::None {
                    c.syncing = false;
                }
            }
            IdListMode::LastIrrCatchUp => {
                warn!(peer = %c.peer_name(), "last irreversible catch up is not a transaction request mode");
            }
        }
    }

    fn handle_sync_request(&mut self, id: ConnectionId, msg: &SyncRequestMessage) {
        let now = self.now();
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        if msg.end_block == 0 {
            debug!(peer = %c.peer_name(), "peer cancelled sync");
            c.peer_requested = None;
            c.flush_queues();
            return;
        }
        debug!(peer = %c.peer_name(), start = msg.start_block, end = msg.end_block, "peer requested sync range");
        c.peer_requested = Some(SyncState::new(
            msg.start_block,
            msg.end_block,
            msg.start_block.saturating_sub(1),
            now,
        ));
        c.enqueue_sync_block(&self.chain);
    }

    fn handle_signed_block(&mut self, id: ConnectionId, block: SignedBlock) {
        let Some(c) = self.connections.get_mut(id) else {
            return;
        };
        c.cancel_wait();
        let blk_id = block.id();
        let blk_num = block.block_num();
        self.stats.blocks_received += 1;

        if self.chain.fetch_block_by_id(&blk_id).is_some() {
            trace!(block = blk_num, conn = %id, "already have block");
            let (mut ctx, sync, _, _) = self.parts();
            sync.recv_block(&mut ctx, id, blk_id, blk_num);
            return;
        }

        self.dispatch
            .recv_block(&mut self.connections, id, blk_id, blk_num);
        match self.chain.push_block(block.clone()) {
            Ok(()) => {
                debug!(block = blk_num, id = %blk_id, conn = %id, "accepted block");
                self.note_block_txns(&block);
                let (mut ctx, sync, dispatch, _) = self.parts();
                sync.recv_block(&mut ctx, id, blk_id, blk_num);
                dispatch.bcast_block(&mut ctx, &block);
            }
            Err(e) => {
                warn!(block = blk_num, id = %blk_id, conn = %id, error = %e, "block rejected");
                if let Some(reason) = e.go_away_reason() {
                    self.go_away(id, reason);
                }
                let (mut ctx, sync, dispatch, _) = self.parts();
                dispatch.rejected_block(ctx.conns, &blk_id);
                sync.rejected_block(&mut ctx, id, blk_num);
            }
        }
    }

    fn handle_packed_transaction(&mut self, id: ConnectionId, trx: PackedTransaction) {
        let Some(c) = self.connections.get(id) else {
            return;
        };
        if self.sync.is_active(c, &self.chain) {
            trace!(peer = %c.peer_name(), "transaction during sync dropped");
            return;
        }
        let tx_id = trx.id();
        if self.local_txns.contains(&tx_id) {
            trace!(trx = %tx_id, "duplicate transaction dropped");
            return;
        }
        self.stats.transactions_received += 1;
        self.dispatch
            .recv_transaction(&mut self.connections, id, &trx);
        match self.chain.accept_transaction(&trx) {
            Ok(()) => {
                self.dispatch
                    .bcast_transaction(&mut self.connections, &mut self.local_txns, &trx);
            }
            Err(e) => {
                info!(trx = %tx_id, error = %e, "transaction rejected");
                self.dispatch
                    .rejected_transaction(&mut self.connections, &tx_id);
            }
        }
    }
}
