mod common;

use common::*;
use ledgernet_messages::{
    IdListMode, NetMessage, NoticeMessage, PackedTransaction, RequestMessage, SelectIds,
    SyncRequestMessage, TimeMessage,
};
use ledgernet_network::{Chain, ConnectionState, NetSettings, SessionMode, SyncStage};
use ledgernet_nullables::{drain_writes, establish, exchange, NullChain};
use ledgernet_types::Timestamp;

fn sync_requests(msgs: &[NetMessage]) -> Vec<(u32, u32)> {
    msgs.iter()
        .filter_map(|m| match m {
            NetMessage::SyncRequest(r) => Some((r.start_block, r.end_block)),
            _ => None,
        })
        .collect()
}

fn span(n: u32) -> NetSettings {
    NetSettings {
        sync_fetch_span: n,
        ..settings()
    }
}

#[test]
fn peer_lib_ahead_starts_lib_catchup() {
    let (mut node, _) = make_node(1, NullChain::new(CHAIN_ID));
    let (id, sent) = greet(&mut node, 2, &chain(100, 50));

    assert_eq!(sync_requests(&sent), vec![(1, 100)]);
    assert_eq!(node.sync().state(), SyncStage::LibCatchup);
    assert_eq!(node.sync().source(), Some(id));
    assert_eq!(node.sync().sync_known_lib_num(), 50);
    assert_eq!(node.sync().sync_next_expected_num(), 1);
    assert!(node.connection(id).unwrap().response_wait().is_some());
}

#[test]
fn same_head_exchanges_transaction_catch_up() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let (id, sent) = greet(&mut node, 2, &chain(5, 3));
    assert_eq!(
        sent,
        vec![NetMessage::Notice(NoticeMessage {
            known_trx: SelectIds::new(IdListMode::CatchUp, 0, vec![]),
            known_blocks: SelectIds::new(IdListMode::None, 0, vec![]),
        })]
    );

    // The peer has nothing pending either: nothing to do.
    let quiet = NoticeMessage {
        known_trx: SelectIds::new(IdListMode::CatchUp, 0, vec![]),
        known_blocks: SelectIds::default(),
    };
    assert!(deliver(&mut node, id, quiet).is_empty());
    assert_eq!(node.sync().state(), SyncStage::InSync);

    // The peer has pending transactions: ask for the ones we lack.
    let busy = NoticeMessage {
        known_trx: SelectIds::new(IdListMode::CatchUp, 3, vec![]),
        known_blocks: SelectIds::default(),
    };
    let sent = deliver(&mut node, id, busy);
    match sent.as_slice() {
        [NetMessage::Request(r)] => {
            assert_eq!(r.req_trx.mode, IdListMode::CatchUp);
            assert!(r.req_trx.ids.is_empty());
            assert_eq!(r.req_blocks.mode, IdListMode::None);
        }
        other => panic!("expected a catch up request, got {other:?}"),
    }
}

#[test]
fn our_lib_ahead_announces_last_irreversible() {
    let (mut node, _) = make_node(1, chain(20, 15));
    let (id, sent) = greet(&mut node, 2, &chain(10, 5));
    match sent.as_slice() {
        [NetMessage::Notice(n)] => {
            assert_eq!(n.known_trx.mode, IdListMode::LastIrrCatchUp);
            assert_eq!(n.known_trx.pending, 15);
            assert_eq!(n.known_blocks.mode, IdListMode::LastIrrCatchUp);
            assert_eq!(n.known_blocks.pending, 20);
        }
        other => panic!("expected a lib notice, got {other:?}"),
    }
    assert_eq!(
        node.connection(id).unwrap().state(),
        ConnectionState::Established(SessionMode::Syncing)
    );
}

#[test]
fn lib_notice_drives_catch_up() {
    // The peer learns we are behind from our handshake and tells us its LIB.
    let (mut node, _) = make_node(1, chain(10, 5));
    let peer = chain(10, 5);
    let (id, _) = greet(&mut node, 2, &peer);
    let sent = deliver(
        &mut node,
        id,
        NoticeMessage {
            known_trx: SelectIds::new(IdListMode::LastIrrCatchUp, 40, vec![]),
            known_blocks: SelectIds::new(IdListMode::LastIrrCatchUp, 60, vec![]),
        },
    );
    assert_eq!(node.connection(id).unwrap().last_handshake_recv.head_num, 60);
    assert_eq!(sync_requests(&sent), vec![(6, 60)]);
    assert_eq!(node.sync().state(), SyncStage::LibCatchup);
    assert_eq!(node.sync().sync_known_lib_num(), 40);
}

#[test]
fn peer_head_ahead_enters_head_catchup() {
    let peer = chain(20, 8);
    let (mut node, _) = make_node(1, chain(10, 5));
    let (id, sent) = greet(&mut node, 2, &peer);
    match sent.as_slice() {
        [NetMessage::Request(r)] => {
            assert_eq!(r.req_blocks.mode, IdListMode::CatchUp);
            assert_eq!(r.req_trx.mode, IdListMode::None);
        }
        other => panic!("expected a catch up request, got {other:?}"),
    }
    assert_eq!(node.sync().state(), SyncStage::HeadCatchup);
    assert_eq!(node.connection(id).unwrap().fork_head, peer.head_block_id());
    assert_eq!(node.connection(id).unwrap().fork_head_num, 20);

    let mut last = Vec::new();
    for n in 11..=20 {
        let block = peer.fetch_block_by_number(n).unwrap();
        last = deliver(&mut node, id, block);
        let expected = if n < 20 {
            SyncStage::HeadCatchup
        } else {
            SyncStage::InSync
        };
        assert_eq!(node.sync().state(), expected, "after block {n}");
    }
    assert_eq!(node.chain().head_block_num(), 20);
    assert!(node.connection(id).unwrap().fork_head.is_zero());
    // Back in sync, the fresh head is announced.
    assert!(last
        .iter()
        .any(|m| matches!(m, NetMessage::Handshake(h) if h.head_num == 20 && h.generation == 2)));
}

#[test]
fn transactions_from_fork_head_source_dropped_until_caught_up() {
    let peer = chain(20, 8);
    let (mut node, _) = make_node(1, chain(10, 5));
    let (id, _) = greet(&mut node, 2, &peer);
    assert_eq!(node.sync().state(), SyncStage::HeadCatchup);

    let t = PackedTransaction::new(b"early".to_vec(), Timestamp::from_secs(2_000));
    assert!(deliver(&mut node, id, t.clone()).is_empty());
    assert!(node.chain().accepted_transactions().is_empty());
    assert!(node.local_txns().is_empty());
    assert_eq!(node.stats().transactions_received, 0);

    for n in 11..=20 {
        deliver(&mut node, id, peer.fetch_block_by_number(n).unwrap());
    }
    assert_eq!(node.sync().state(), SyncStage::InSync);
    deliver(&mut node, id, t.clone());
    assert_eq!(node.chain().accepted_transactions(), &[t.id()]);
    assert!(node.local_txns().contains(&t.id()));
}

#[test]
fn our_head_ahead_serves_branch_from_peer_lib() {
    let (mut node, _) = make_node(1, chain(10, 5));
    let (id, sent) = greet(&mut node, 2, &chain(6, 3));
    match sent.as_slice() {
        [NetMessage::Notice(n)] => {
            assert_eq!(n.known_trx.mode, IdListMode::None);
            assert_eq!(n.known_blocks.mode, IdListMode::CatchUp);
            assert_eq!(n.known_blocks.pending, 10);
            assert_eq!(n.known_blocks.ids, vec![node.chain().head_block_id()]);
        }
        other => panic!("expected a head notice, got {other:?}"),
    }
    assert!(node.connection(id).unwrap().syncing);

    let sent = deliver(
        &mut node,
        id,
        RequestMessage {
            req_trx: SelectIds::default(),
            req_blocks: SelectIds::new(IdListMode::CatchUp, 0, vec![]),
        },
    );
    assert_eq!(blocks_in(&sent), (4..=10).collect::<Vec<_>>());
    assert!(!node.connection(id).unwrap().syncing);
}

#[test]
fn next_chunk_requested_at_last_requested_block() {
    let peer = chain(30, 25);
    let (mut node, _) = make_node_with(1, NullChain::new(CHAIN_ID), span(10));
    let (id, sent) = greet(&mut node, 2, &peer);
    assert_eq!(sync_requests(&sent), vec![(1, 10)]);

    let mut sent = Vec::new();
    for n in 1..=10 {
        sent = deliver(&mut node, id, peer.fetch_block_by_number(n).unwrap());
        if n < 10 {
            assert!(sync_requests(&sent).is_empty(), "block {n}");
        }
    }
    assert_eq!(sync_requests(&sent), vec![(11, 20)]);
    assert_eq!(node.sync().sync_last_requested_num(), 20);
    assert_eq!(node.sync().state(), SyncStage::LibCatchup);

    for n in 11..=25 {
        sent = deliver(&mut node, id, peer.fetch_block_by_number(n).unwrap());
        if n == 20 {
            assert_eq!(sync_requests(&sent), vec![(21, 30)]);
        }
    }
    // Reaching the known LIB ends lib catch-up and re-announces us.
    assert_eq!(node.sync().state(), SyncStage::InSync);
    assert!(sent
        .iter()
        .any(|m| matches!(m, NetMessage::Handshake(h) if h.head_num == 25)));
}

#[test]
fn out_of_order_sync_block_drops_the_source() {
    let peer = chain(100, 50);
    let (mut node, _) = make_node(1, chain(10, 5));
    let (id, sent) = greet(&mut node, 2, &peer);
    assert_eq!(sync_requests(&sent), vec![(6, 100)]);

    // Block 8 is already ours, but block 6 was expected next.
    deliver(&mut node, id, peer.fetch_block_by_number(8).unwrap());
    assert!(node.connection(id).is_none());
    assert_eq!(node.take_closed(), vec![id]);
    assert_eq!(node.sync().state(), SyncStage::InSync);
    assert_eq!(node.sync().source(), None);
}

#[test]
fn unlinkable_block_gets_go_away() {
    let peer = chain(100, 50);
    let (mut node, _) = make_node(1, NullChain::new(CHAIN_ID));
    let (id, _) = greet(&mut node, 2, &peer);
    let sent = deliver(&mut node, id, peer.fetch_block_by_number(3).unwrap());
    assert!(has_go_away(&sent, ledgernet_messages::GoAwayReason::Unlinkable));
    assert!(node.connection(id).is_none());
    assert_eq!(node.sync().state(), SyncStage::InSync);
}

#[test]
fn timed_out_chunk_moves_to_next_peer() {
    let peer = chain(30, 25);
    let (mut node, _) = make_node_with(1, NullChain::new(CHAIN_ID), span(10));
    let (p2, sent) = greet(&mut node, 2, &peer);
    assert_eq!(sync_requests(&sent), vec![(1, 10)]);
    // The chunk is still outstanding, so a second source is not asked yet.
    let (p3, sent) = greet(&mut node, 3, &peer);
    assert!(sync_requests(&sent).is_empty());

    let token = node.connection(p2).unwrap().response_wait().unwrap().token;
    node.on_response_timeout(p2, token);
    assert_eq!(sync_requests(&drain_writes(&mut node, p2)), vec![(0, 0)]);
    assert_eq!(sync_requests(&drain_writes(&mut node, p3)), vec![(1, 10)]);
    assert_eq!(node.sync().source(), Some(p3));

    // The old token is spent.
    node.on_response_timeout(p2, token);
    assert!(drain_writes(&mut node, p2).is_empty());
    assert!(drain_writes(&mut node, p3).is_empty());
}

#[test]
fn losing_the_source_re_requests_elsewhere() {
    let peer = chain(30, 25);
    let (mut node, _) = make_node_with(1, NullChain::new(CHAIN_ID), span(10));
    let (p2, _) = greet(&mut node, 2, &peer);
    let (p3, _) = greet(&mut node, 3, &peer);

    node.on_io_error(p2, "connection reset");
    assert!(node.connection(p2).is_none());
    assert_eq!(sync_requests(&drain_writes(&mut node, p3)), vec![(1, 10)]);
    assert_eq!(node.sync().source(), Some(p3));
}

#[test]
fn served_range_stops_at_end_block() {
    let (mut node, _) = make_node(1, chain(10, 5));
    let id = inbound(&mut node, 2);
    let sent = deliver(
        &mut node,
        id,
        SyncRequestMessage {
            start_block: 2,
            end_block: 4,
        },
    );
    assert_eq!(blocks_in(&sent), vec![2, 3, 4]);
    assert!(node.connection(id).unwrap().peer_requested.is_none());
}

#[test]
fn empty_sync_request_cancels_serving() {
    let (mut node, _) = make_node(1, chain(10, 5));
    let id = inbound(&mut node, 2);
    node.handle_message(
        id,
        SyncRequestMessage {
            start_block: 2,
            end_block: 8,
        }
        .into(),
    );
    node.handle_message(
        id,
        SyncRequestMessage {
            start_block: 0,
            end_block: 0,
        }
        .into(),
    );
    assert!(node.connection(id).unwrap().peer_requested.is_none());
    assert!(drain_writes(&mut node, id).is_empty());
}

#[test]
fn time_probe_is_answered_and_offset_measured() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let id = inbound(&mut node, 2);
    let sent = deliver(
        &mut node,
        id,
        TimeMessage {
            xmt: Timestamp::from_secs(500),
            ..Default::default()
        },
    );
    assert_eq!(
        sent,
        vec![NetMessage::Time(TimeMessage {
            org: Timestamp::from_secs(500),
            rec: Timestamp::from_secs(1_000),
            xmt: Timestamp::from_secs(1_000),
            dst: Timestamp::EPOCH,
        })]
    );

    node.keepalive();
    match drain_writes(&mut node, id).as_slice() {
        [NetMessage::Time(t)] => {
            assert!(t.org.is_epoch());
            assert_eq!(t.xmt, Timestamp::from_secs(1_000));
        }
        other => panic!("expected a time probe, got {other:?}"),
    }
    // The peer's clock runs two seconds ahead.
    let reply = TimeMessage {
        org: Timestamp::from_secs(1_000),
        rec: Timestamp::from_secs(1_002),
        xmt: Timestamp::from_secs(1_002),
        dst: Timestamp::EPOCH,
    };
    assert!(deliver(&mut node, id, reply).is_empty());
    assert_eq!(
        node.connection(id).unwrap().clock_offset_ns,
        Some(2_000_000_000)
    );
}

#[test]
fn fresh_node_catches_up_over_the_wire() {
    let (mut a, _) = make_node(1, NullChain::new(CHAIN_ID));
    let (mut b, _) = make_node(2, chain(100, 50));
    let (a_id, b_id) = establish(&mut a, addr(1), &mut b, addr(2)).unwrap();
    exchange(&mut a, a_id, &mut b, b_id);

    assert_eq!(a.chain().head_block_num(), 100);
    assert_eq!(a.chain().head_block_id(), b.chain().head_block_id());
    assert_eq!(a.sync().state(), SyncStage::InSync);
    assert!(a.connection(a_id).unwrap().current());
    assert!(b.connection(b_id).unwrap().current());
}
