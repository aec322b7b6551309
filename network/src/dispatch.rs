//! Block and transaction relay.
//!
//! Tracks which connection each received item came from so it is never
//! echoed back, and consults each peer's knowledge index so nothing is sent
//! twice. Items larger than `just_send_it_max` are announced with a notice
//! instead of being pushed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ledgernet_messages::{
    IdListMode, NetMessage, NoticeMessage, PackedTransaction, RequestMessage, SelectIds,
    SignedBlock,
};
use ledgernet_types::{BlockId, BlockNum, Timestamp, TxId};
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionId, ConnectionSet, WriteCompletion};
use crate::context::NetContext;
use crate::index::{NodeTransactionIndex, NodeTransactionState, PeerBlockState, TransactionState};

/// How long a transaction a peer noticed to us is remembered while we wait
/// for it.
pub const NOTICED_TXN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(120);

pub struct DispatchManager {
    pub just_send_it_max: usize,
    received_blocks: HashMap<BlockId, Vec<ConnectionId>>,
    received_transactions: HashMap<TxId, Vec<ConnectionId>>,
}

enum FetchItem {
    Block(BlockId),
    Transaction(TxId),
}

impl DispatchManager {
    pub fn new(just_send_it_max: usize) -> Self {
        Self {
            just_send_it_max,
            received_blocks: HashMap::new(),
            received_transactions: HashMap::new(),
        }
    }

    /// Connections a block arrived from and has not been relayed yet.
    pub fn block_origins(&self, id: &BlockId) -> &[ConnectionId] {
        self.received_blocks.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn transaction_origins(&self, id: &TxId) -> &[ConnectionId] {
        self.received_transactions
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Relay an accepted block to every current peer that lacks it.
    pub fn bcast_block(&mut self, ctx: &mut NetContext<'_>, block: &SignedBlock) {
        let id = block.id();
        let num = block.block_num();
        let skips = self.received_blocks.remove(&id).unwrap_or_default();

        let bytes: Arc<[u8]> = match ledgernet_protocol::encode(&NetMessage::SignedBlock(block.clone())) {
            Ok(bytes) => Arc::from(bytes),
            Err(e) => {
                warn!(block = num, error = %e, "cannot encode block for relay");
                return;
            }
        };
        let notice_only = bytes.len() > self.just_send_it_max;
        debug!(block = num, id = %id, size = bytes.len(), notice_only, "broadcast block");

        for c in ctx.conns.iter_mut() {
            if skips.contains(&c.id()) || !c.current() {
                continue;
            }
            if c.last_handshake_recv.last_irreversible_block_num >= num {
                continue;
            }
            if c.blk_state.get(&id).is_some_and(|b| b.is_known) {
                trace!(peer = %c.peer_name(), block = num, "peer already has block");
                continue;
            }
            c.add_peer_block(PeerBlockState {
                id,
                block_num: num,
                is_known: true,
                is_noticed: true,
                request_time: Timestamp::EPOCH,
            });
            if notice_only {
                c.enqueue(NoticeMessage {
                    known_trx: SelectIds::default(),
                    known_blocks: SelectIds::new(IdListMode::Normal, 0, vec![id]),
                });
            } else {
                c.enqueue_bytes(Arc::clone(&bytes), None);
            }
        }
    }

    /// Pool an accepted transaction and relay it to every current peer that
    /// lacks it.
    pub fn bcast_transaction(
        &mut self,
        conns: &mut ConnectionSet,
        pool: &mut NodeTransactionIndex,
        trx: &PackedTransaction,
    ) {
        let id = trx.id();
        let skips = self.received_transactions.remove(&id).unwrap_or_default();
        if pool.contains(&id) {
            debug!(trx = %id, "transaction already pooled");
            return;
        }
        let bytes: Arc<[u8]> =
            match ledgernet_protocol::encode(&NetMessage::PackedTransaction(trx.clone())) {
                Ok(bytes) => Arc::from(bytes),
                Err(e) => {
                    warn!(trx = %id, error = %e, "cannot encode transaction for relay");
                    return;
                }
            };
        pool.insert(
            id,
            NodeTransactionState {
                id,
                expires: trx.expiration,
                block_num: 0,
                serialized_txn: Arc::clone(&bytes),
                requests: 0,
            },
        );
        let notice_only = bytes.len() > self.just_send_it_max;
        debug!(trx = %id, size = bytes.len(), notice_only, "broadcast transaction");

        for c in conns.iter_mut() {
            if skips.contains(&c.id()) || !c.current() || c.trx_state.contains(&id) {
                continue;
            }
            c.trx_state.insert(
                id,
                TransactionState {
                    id,
                    is_known_by_peer: true,
                    is_noticed_to_peer: true,
                    block_num: 0,
                    expires: trx.expiration,
                    request_time: Timestamp::EPOCH,
                },
            );
            if notice_only {
                c.enqueue(NoticeMessage {
                    known_trx: SelectIds::new(IdListMode::Normal, 0, vec![id]),
                    known_blocks: SelectIds::default(),
                });
            } else if c.enqueue_bytes(Arc::clone(&bytes), Some(WriteCompletion::Transaction(id))) {
                pool.modify(&id, |t| t.requests += 1);
            }
        }
    }

    pub fn recv_block(
        &mut self,
        conns: &mut ConnectionSet,
        id: ConnectionId,
        blk_id: BlockId,
        blk_num: BlockNum,
    ) {
        self.received_blocks.entry(blk_id).or_default().push(id);
        let Some(c) = conns.get_mut(id) else {
            return;
        };
        let answered = c.last_req.as_ref().is_some_and(|r| {
            r.req_blocks.mode != IdListMode::None && r.req_blocks.ids.last() == Some(&blk_id)
        });
        if answered {
            c.last_req = None;
        }
        c.add_peer_block(PeerBlockState {
            id: blk_id,
            block_num: blk_num,
            is_known: true,
            is_noticed: true,
            request_time: Timestamp::EPOCH,
        });
        c.cancel_wait();
    }

    pub fn recv_transaction(
        &mut self,
        conns: &mut ConnectionSet,
        id: ConnectionId,
        trx: &PackedTransaction,
    ) {
        let tx_id = trx.id();
        self.received_transactions.entry(tx_id).or_default().push(id);
        let Some(c) = conns.get_mut(id) else {
            return;
        };
        let answered = c.last_req.as_ref().is_some_and(|r| {
            r.req_trx.mode != IdListMode::None && r.req_trx.ids.last() == Some(&tx_id)
        });
        if answered {
            c.last_req = None;
        }
        let known = c.trx_state.modify(&tx_id, |t| t.is_known_by_peer = true);
        if !known {
            c.trx_state.insert(
                tx_id,
                TransactionState {
                    id: tx_id,
                    is_known_by_peer: true,
                    is_noticed_to_peer: false,
                    block_num: 0,
                    expires: trx.expiration,
                    request_time: Timestamp::EPOCH,
                },
            );
        }
        c.cancel_wait();
    }

    /// Forget a block that failed to apply; it is never relayed.
    pub fn rejected_block(&mut self, conns: &mut ConnectionSet, blk_id: &BlockId) {
        self.received_blocks.remove(blk_id);
        for c in conns.iter_mut() {
            c.blk_state.remove(blk_id);
        }
    }

    pub fn rejected_transaction(&mut self, conns: &mut ConnectionSet, tx_id: &TxId) {
        self.received_transactions.remove(tx_id);
        for c in conns.iter_mut() {
            c.trx_state.remove(tx_id);
        }
    }

    /// Normal-mode notice: remember what the peer holds and request what
    /// we lack and are not already fetching from someone else.
    pub fn recv_notice(
        &mut self,
        ctx: &mut NetContext<'_>,
        pool: &NodeTransactionIndex,
        id: ConnectionId,
        msg: &NoticeMessage,
    ) {
        let now = ctx.now;
        let mut outstanding_blocks = HashSet::new();
        let mut outstanding_trx = HashSet::new();
        for other in ctx.conns.iter().filter(|o| o.id() != id) {
            if let Some(r) = &other.last_req {
                outstanding_blocks.extend(r.req_blocks.ids.iter().copied());
                outstanding_trx.extend(r.req_trx.ids.iter().copied());
            }
        }
        let Some(c) = ctx.conns.get_mut(id) else {
            return;
        };
        let mut req = RequestMessage::default();

        if msg.known_trx.mode == IdListMode::Normal {
            for tx_id in &msg.known_trx.ids {
                if pool.contains(tx_id) || c.trx_state.contains(tx_id) {
                    continue;
                }
                c.trx_state.insert(
                    *tx_id,
                    TransactionState {
                        id: *tx_id,
                        is_known_by_peer: true,
                        is_noticed_to_peer: true,
                        block_num: 0,
                        expires: now.saturating_add(NOTICED_TXN_LIFETIME),
                        request_time: now,
                    },
                );
                if !outstanding_trx.contains(tx_id) {
                    req.req_trx.ids.push(*tx_id);
                }
            }
            if !req.req_trx.ids.is_empty() {
                req.req_trx.mode = IdListMode::Normal;
            }
        }

        if msg.known_blocks.mode == IdListMode::Normal {
            let mut missing = None;
            for blk_id in &msg.known_blocks.ids {
                let have = ctx.chain.fetch_block_by_id(blk_id).is_some();
                let wanted = !have && !outstanding_blocks.contains(blk_id);
                c.add_peer_block(PeerBlockState {
                    id: *blk_id,
                    block_num: blk_id.num(),
                    is_known: true,
                    is_noticed: true,
                    request_time: if wanted { now } else { Timestamp::EPOCH },
                });
                if wanted {
                    missing = Some(*blk_id);
                }
            }
            // A request may name only one block; ask for the newest.
            if let Some(blk_id) = missing {
                req.req_blocks = SelectIds::new(IdListMode::Normal, 0, vec![blk_id]);
            }
        }

        if req.req_trx.ids.is_empty() && req.req_blocks.ids.is_empty() {
            return;
        }
        debug!(
            peer = %c.peer_name(),
            trx = req.req_trx.ids.len(),
            blocks = req.req_blocks.ids.len(),
            "requesting noticed items"
        );
        c.enqueue(req.clone());
        c.fetch_wait();
        c.last_req = Some(req);
    }

    /// A fetch from `from` timed out or `from` went away: ask another
    /// connected peer known to hold the item, else retry `from`.
    pub fn retry_fetch(&mut self, conns: &mut ConnectionSet, from: ConnectionId, last_req: RequestMessage) {
        let trx = &last_req.req_trx;
        let blocks = &last_req.req_blocks;
        let item = if trx.mode == IdListMode::Normal && !trx.ids.is_empty() {
            trx.ids.last().copied().map(FetchItem::Transaction)
        } else if blocks.mode == IdListMode::Normal {
            blocks.ids.last().copied().map(FetchItem::Block)
        } else {
            None
        };
        let Some(item) = item else {
            debug!(conn = %from, "nothing to refetch");
            return;
        };

        for c in conns.iter_mut() {
            if c.id() == from || c.last_req.is_some() || !c.connected() {
                continue;
            }
            let holds = match &item {
                FetchItem::Transaction(t) => c.trx_state.get(t).is_some_and(|s| s.is_known_by_peer),
                FetchItem::Block(b) => c.blk_state.get(b).is_some_and(|s| s.is_known),
            };
            if holds {
                debug!(from = %from, to = %c.peer_name(), "refetching from another peer");
                c.enqueue(last_req.clone());
                c.fetch_wait();
                c.last_req = Some(last_req);
                return;
            }
        }

        if let Some(c) = conns.get_mut(from).filter(|c| c.connected()) {
            debug!(peer = %c.peer_name(), "refetching from the same peer");
            c.enqueue(last_req.clone());
            c.fetch_wait();
            c.last_req = Some(last_req);
        }
    }
}
