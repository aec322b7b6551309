//! Catch-up synchronization.
//!
//! One global state machine decides whether we are in sync, pulling
//! irreversible blocks in chunks from a single source peer (`LibCatchup`), or
//! following a peer whose head is ahead of ours (`HeadCatchup`).
//!
//! - `recv_handshake` compares each validated handshake with our chain and
//!   picks one of five responses
//! - `request_next_chunk` round-robins the source over current connections
//! - `reassign_fetch` moves a timed-out chunk to another peer

use std::fmt;

use ledgernet_messages::{
    GoAwayReason, HandshakeMessage, IdListMode, NoticeMessage, RequestMessage, SelectIds,
};
use ledgernet_types::{BlockId, BlockNum};
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::connection::{Connection, ConnectionId, ConnectionSet};
use crate::context::NetContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStage {
    InSync,
    LibCatchup,
    HeadCatchup,
}

impl SyncStage {
    /// Numeric form for the sync state gauge.
    pub fn as_i64(self) -> i64 {
        match self {
            SyncStage::InSync => 0,
            SyncStage::LibCatchup => 1,
            SyncStage::HeadCatchup => 2,
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStage::InSync => "in sync",
            SyncStage::LibCatchup => "lib catchup",
            SyncStage::HeadCatchup => "head catchup",
        })
    }
}

pub struct SyncManager {
    sync_known_lib_num: BlockNum,
    sync_last_requested_num: BlockNum,
    sync_next_expected_num: BlockNum,
    sync_req_span: u32,
    source: Option<ConnectionId>,
    state: SyncStage,
}

impl SyncManager {
    pub fn new(sync_req_span: u32) -> Self {
        Self {
            sync_known_lib_num: 0,
            sync_last_requested_num: 0,
            sync_next_expected_num: 1,
            sync_req_span: sync_req_span.max(1),
            source: None,
            state: SyncStage::InSync,
        }
    }

    pub fn state(&self) -> SyncStage {
        self.state
    }

    pub fn source(&self) -> Option<ConnectionId> {
        self.source
    }

    pub fn sync_known_lib_num(&self) -> BlockNum {
        self.sync_known_lib_num
    }

    pub fn sync_last_requested_num(&self) -> BlockNum {
        self.sync_last_requested_num
    }

    pub fn sync_next_expected_num(&self) -> BlockNum {
        self.sync_next_expected_num
    }

    fn set_state(&mut self, state: SyncStage) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "sync state change");
            self.state = state;
        }
    }

    /// Whether sync traffic with `conn` should take priority over
    /// transaction relay.
    pub fn is_active(&self, conn: &Connection, chain: &dyn Chain) -> bool {
        if self.state == SyncStage::HeadCatchup {
            return !conn.fork_head.is_zero() && conn.fork_head_num > chain.head_block_num();
        }
        self.state != SyncStage::InSync
    }

    pub fn sync_required(&self, chain: &dyn Chain) -> bool {
        self.sync_last_requested_num < self.sync_known_lib_num
            || chain.head_block_num() < self.sync_last_requested_num
    }

    /// Re-derive what we know of the network's LIB from `id`, or re-request
    /// our chunk elsewhere if `id` was the source and is gone.
    pub fn reset_lib_num(&mut self, ctx: &mut NetContext<'_>, id: ConnectionId) {
        if self.state == SyncStage::InSync {
            self.source = None;
        }
        match ctx.conns.get(id) {
            Some(c) if c.current() => {
                let peer_lib = c.last_handshake_recv.last_irreversible_block_num;
                if peer_lib > self.sync_known_lib_num {
                    self.sync_known_lib_num = peer_lib;
                }
            }
            _ if self.source == Some(id) => {
                self.sync_last_requested_num = 0;
                self.request_next_chunk(ctx, None);
            }
            _ => {}
        }
    }

    /// Next current connection after the previous source, wrapping around.
    /// The previous source itself is considered last.
    fn next_source(&self, conns: &ConnectionSet) -> Option<ConnectionId> {
        let ids = conns.ids();
        if ids.is_empty() {
            return None;
        }
        let start = self
            .source
            .and_then(|prev| ids.iter().position(|id| *id > prev))
            .unwrap_or(0);
        (0..ids.len())
            .map(|i| ids[(start + i) % ids.len()])
            .find(|id| conns.get(*id).is_some_and(Connection::current))
    }

    pub fn request_next_chunk(&mut self, ctx: &mut NetContext<'_>, conn: Option<ConnectionId>) {
        let head = ctx.chain.head_block_num();
        let source_current = self
            .source
            .and_then(|id| ctx.conns.get(id))
            .is_some_and(Connection::current);
        if head < self.sync_last_requested_num && source_current {
            info!(
                head,
                last_requested = self.sync_last_requested_num,
                "ignoring chunk request, previous chunk still being applied"
            );
            return;
        }

        self.source = match conn.filter(|id| ctx.conns.get(*id).is_some_and(Connection::current)) {
            Some(id) => Some(id),
            None => self.next_source(ctx.conns),
        };

        let Some(source) = self
            .source
            .and_then(|id| ctx.conns.get_mut(id))
            .filter(|c| c.current())
        else {
            warn!("unable to continue syncing at this time");
            self.sync_known_lib_num = ctx.chain.last_irreversible_block_num();
            self.sync_last_requested_num = 0;
            self.source = None;
            self.set_state(SyncStage::InSync);
            return;
        };

        let target = self
            .sync_known_lib_num
            .max(source.last_handshake_recv.head_num);
        if self.sync_last_requested_num < target {
            let start = self.sync_next_expected_num;
            let end = start
                .saturating_add(self.sync_req_span - 1)
                .min(target);
            if end > 0 && end >= start {
                info!(start, end, peer = %source.peer_name(), "requesting sync range");
                source.request_sync_blocks(start, end, ctx.now);
                self.sync_last_requested_num = end;
            }
        }
    }

    pub fn start_sync(&mut self, ctx: &mut NetContext<'_>, id: ConnectionId, target: BlockNum) {
        if target > self.sync_known_lib_num {
            self.sync_known_lib_num = target;
        }
        if !self.sync_required(ctx.chain) {
            debug!(
                lib = ctx.chain.last_irreversible_block_num(),
                head = ctx.chain.head_block_num(),
                target,
                "already caught up"
            );
            return;
        }
        if self.state == SyncStage::InSync {
            self.set_state(SyncStage::LibCatchup);
            self.sync_next_expected_num = ctx.chain.last_irreversible_block_num() + 1;
        }
        info!(
            last_requested = self.sync_last_requested_num,
            target,
            "catching up with chain"
        );
        self.request_next_chunk(ctx, Some(id));
    }

    pub fn send_handshakes(ctx: &mut NetContext<'_>) {
        for c in ctx.conns.iter_mut() {
            if c.current() {
                c.send_handshake(ctx.handshaker, ctx.chain, ctx.now);
            }
        }
    }

    /// The source stopped answering: cancel its chunk and ask someone else.
    pub fn reassign_fetch(&mut self, ctx: &mut NetContext<'_>, id: ConnectionId, reason: GoAwayReason) {
        info!(
            last_requested = self.sync_last_requested_num,
            next_expected = self.sync_next_expected_num,
            conn = %id,
            "reassign fetch"
        );
        if self.source == Some(id) {
            if let Some(c) = ctx.conns.get_mut(id) {
                c.cancel_sync(reason);
            }
            self.sync_last_requested_num = 0;
            self.request_next_chunk(ctx, None);
        }
    }

    /// A peer is at or ahead of our head. Unless another peer's announced
    /// fork head already covers it, follow this one.
    pub fn verify_catchup(
        &mut self,
        ctx: &mut NetContext<'_>,
        id: ConnectionId,
        num: BlockNum,
        head_id: BlockId,
    ) {
        let covered = ctx.conns.iter().any(|c| {
            c.id() != id && ((!c.fork_head.is_zero() && c.fork_head == head_id) || c.fork_head_num > num)
        });
        let Some(c) = ctx.conns.get_mut(id) else {
            return;
        };
        let mut req = RequestMessage::default();
        if covered {
            c.fork_head = BlockId::ZERO;
            c.fork_head_num = 0;
        } else {
            c.fork_head = head_id;
            c.fork_head_num = num;
            info!(
                state = %self.state,
                fork_head_num = num,
                target_lib = self.sync_known_lib_num,
                next_expected = self.sync_next_expected_num,
                peer = %c.peer_name(),
                "following peer head"
            );
            if self.state == SyncStage::LibCatchup {
                return;
            }
            req.req_blocks.mode = IdListMode::CatchUp;
            self.set_state(SyncStage::HeadCatchup);
        }
        c.enqueue(req);
    }

    /// Evaluate a validated handshake against our chain view.
    pub fn recv_handshake(
        &mut self,
        ctx: &mut NetContext<'_>,
        id: ConnectionId,
        msg: &HandshakeMessage,
        pending_txns: u32,
    ) {
        let lib_num = ctx.chain.last_irreversible_block_num();
        let head = ctx.chain.head_block_num();
        let head_id = ctx.chain.head_block_id();
        let peer_lib = msg.last_irreversible_block_num;

        self.reset_lib_num(ctx, id);
        let Some(c) = ctx.conns.get_mut(id) else {
            return;
        };
        c.syncing = false;

        if head_id == msg.head_id {
            debug!(peer = %c.peer_name(), "sync check state 0: same head");
            c.enqueue(NoticeMessage {
                known_trx: SelectIds::new(IdListMode::CatchUp, pending_txns, vec![]),
                known_blocks: SelectIds::new(IdListMode::None, 0, vec![]),
            });
            return;
        }
        if head < peer_lib {
            debug!(peer = %c.peer_name(), head, peer_lib, "sync check state 1: peer lib ahead");
            self.start_sync(ctx, id, peer_lib);
            return;
        }
        if lib_num > msg.head_num {
            debug!(peer = %c.peer_name(), lib_num, peer_head = msg.head_num, "sync check state 2: our lib ahead");
            c.enqueue(NoticeMessage {
                known_trx: SelectIds::new(IdListMode::LastIrrCatchUp, lib_num, vec![]),
                known_blocks: SelectIds::new(IdListMode::LastIrrCatchUp, head, vec![]),
            });
            c.syncing = true;
            return;
        }
        if head <= msg.head_num {
            debug!(peer = %c.peer_name(), head, peer_head = msg.head_num, "sync check state 3: peer head ahead");
            self.verify_catchup(ctx, id, msg.head_num, msg.head_id);
            return;
        }
        debug!(peer = %c.peer_name(), head, peer_head = msg.head_num, "sync check state 4: our head ahead");
        c.enqueue(NoticeMessage {
            known_trx: SelectIds::new(IdListMode::None, 0, vec![]),
            known_blocks: SelectIds::new(IdListMode::CatchUp, head, vec![head_id]),
        });
        c.syncing = true;
    }

    /// Catch-up and last-irreversible notices.
    pub fn recv_notice(&mut self, ctx: &mut NetContext<'_>, id: ConnectionId, msg: &NoticeMessage) {
        debug!(mode = %msg.known_blocks.mode, conn = %id, "sync notice");
        if msg.known_blocks.ids.len() > 1 {
            warn!(ids = msg.known_blocks.ids.len(), conn = %id, "invalid notice, too many block ids");
            ctx.conns.request_close(id);
            return;
        }
        if msg.known_blocks.mode == IdListMode::CatchUp {
            match msg.known_blocks.ids.last() {
                Some(&head_id) => self.verify_catchup(ctx, id, msg.known_blocks.pending, head_id),
                None => warn!(conn = %id, "catch up notice without a head id"),
            }
            return;
        }
        let peer_lib = msg.known_trx.pending;
        if let Some(c) = ctx.conns.get_mut(id) {
            c.last_handshake_recv.last_irreversible_block_num = peer_lib;
        }
        self.reset_lib_num(ctx, id);
        self.start_sync(ctx, id, peer_lib);
    }

    /// A block from `id` failed to apply. During catch-up that peer is
    /// dropped and sync is re-derived from the rest.
    pub fn rejected_block(&mut self, ctx: &mut NetContext<'_>, id: ConnectionId, blk_num: BlockNum) {
        if self.state == SyncStage::InSync {
            return;
        }
        info!(block = blk_num, conn = %id, "block not accepted, abandoning source");
        self.sync_last_requested_num = 0;
        self.source = None;
        ctx.conns.request_close(id);
        self.set_state(SyncStage::InSync);
        Self::send_handshakes(ctx);
    }

    pub fn recv_block(
        &mut self,
        ctx: &mut NetContext<'_>,
        id: ConnectionId,
        blk_id: BlockId,
        blk_num: BlockNum,
    ) {
        debug!(block = blk_num, conn = %id, "sync got block");
        match self.state {
            SyncStage::LibCatchup => {
                if blk_num != self.sync_next_expected_num {
                    info!(expected = self.sync_next_expected_num, got = blk_num, conn = %id, "out of order sync block");
                    ctx.conns.request_close(id);
                    return;
                }
                self.sync_next_expected_num = blk_num + 1;
                if blk_num == self.sync_known_lib_num {
                    debug!("caught up with last known irreversible block, resending handshakes");
                    self.set_state(SyncStage::InSync);
                    Self::send_handshakes(ctx);
                } else if blk_num == self.sync_last_requested_num {
                    self.request_next_chunk(ctx, None);
                } else if let Some(c) = ctx.conns.get_mut(id) {
                    c.sync_wait();
                }
            }
            SyncStage::HeadCatchup => {
                self.set_state(SyncStage::InSync);
                self.source = None;
                for c in ctx.conns.iter_mut() {
                    if c.fork_head.is_zero() {
                        continue;
                    }
                    if c.fork_head == blk_id || c.fork_head_num < blk_num {
                        c.fork_head = BlockId::ZERO;
                        c.fork_head_num = 0;
                    } else {
                        self.set_state(SyncStage::HeadCatchup);
                    }
                }
                if self.state == SyncStage::InSync {
                    Self::send_handshakes(ctx);
                }
            }
            SyncStage::InSync => {}
        }
    }
}
