mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ledgernet_crypto::keypair_from_seed;
use ledgernet_messages::{GoAwayReason, NetMessage};
use ledgernet_network::{AllowedConnections, ConnectionState, NetState, SessionMode};
use ledgernet_nullables::{drain_writes, establish, exchange, NullChain, NullClock};
use ledgernet_types::{Digest, Signature};

#[test]
fn accept_sends_first_handshake() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let id = node.accept_inbound(addr(2)).unwrap();
    let sent = drain_writes(&mut node, id);
    match sent.as_slice() {
        [NetMessage::Handshake(hs)] => {
            assert_eq!(hs.generation, 1);
            assert_eq!(hs.head_num, 5);
            assert_eq!(hs.last_irreversible_block_num, 3);
            assert_eq!(hs.p2p_address, "10.0.0.1:9876 - 0101010");
            assert!(hs.sig.is_zero() && hs.token.is_zero());
        }
        other => panic!("expected one handshake, got {other:?}"),
    }
    assert_eq!(node.connection(id).unwrap().state(), ConnectionState::Handshaking);
}

#[test]
fn invalid_handshakes_get_fatal_go_away() {
    let peer = chain(5, 3);
    let cases: Vec<(&str, Box<dyn Fn(&mut ledgernet_messages::HandshakeMessage)>)> = vec![
        ("lib above head", Box::new(|hs| hs.last_irreversible_block_num = hs.head_num + 1)),
        ("no p2p address", Box::new(|hs| hs.p2p_address.clear())),
        ("no os", Box::new(|hs| hs.os.clear())),
        (
            "token not hash of time",
            Box::new(|hs| {
                hs.sig = Signature([1; 64]);
                hs.token = Digest::new([9; 32]);
            }),
        ),
    ];
    for (name, mutate) in cases {
        let (mut node, _) = make_node(1, chain(5, 3));
        let id = inbound(&mut node, 2);
        let mut hs = handshake_from(2, &peer, &node);
        mutate(&mut hs);
        let sent = deliver(&mut node, id, hs);
        assert!(has_go_away(&sent, GoAwayReason::FatalOther), "{name}");
        assert!(node.connection(id).is_none(), "{name}: closed after go away");
        assert_eq!(node.stats().go_aways_sent, 1, "{name}");
    }
}

#[test]
fn self_connect_is_fatal() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let id = inbound(&mut node, 2);
    let hs = handshake_from(1, &chain(5, 3), &node);
    let sent = deliver(&mut node, id, hs);
    assert!(has_go_away(&sent, GoAwayReason::FatalOther));
    assert!(node.connection(id).is_none());
}

#[test]
fn wrong_chain_rejected() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let other = NullChain::with_blocks(Digest::new([9; 32]), 5, 3);
    let (id, sent) = greet(&mut node, 2, &other);
    assert!(has_go_away(&sent, GoAwayReason::WrongChain));
    assert!(node.connection(id).is_none());
}

#[test]
fn forked_lib_rejected() {
    let (mut node, _) = make_node(1, chain(10, 8));
    let mut forked = NullChain::new(CHAIN_ID);
    forked.extend(5, "alice");
    forked.extend(6, "bob");
    forked.set_lib(7);
    let (_, sent) = greet(&mut node, 2, &forked);
    assert!(has_go_away(&sent, GoAwayReason::Forked));

    // Same history up to the peer's LIB is fine.
    let (mut node, _) = make_node(1, chain(10, 8));
    let (id, sent) = greet(&mut node, 2, &chain(10, 7));
    assert!(!sent.iter().any(|m| matches!(m, NetMessage::GoAway(_))));
    assert!(node.connection(id).unwrap().current());
}

#[test]
fn version_mismatch_only_fatal_when_required() {
    let peer = chain(5, 3);
    for strict in [false, true] {
        let clock = Arc::new(NullClock::new(1_000));
        let mut hs = handshaker(1);
        hs.network_version_match = strict;
        let mut node = NetState::new(chain(5, 3), hs, settings(), clock);
        let id = inbound(&mut node, 2);
        let mut msg = handshake_from(2, &peer, &node);
        msg.network_version = ledgernet_protocol::NET_VERSION_BASE;
        let sent = deliver(&mut node, id, msg);
        assert_eq!(has_go_away(&sent, GoAwayReason::WrongVersion), strict);
        assert_eq!(node.connection(id).is_some(), !strict);
    }
}

#[test]
fn specified_peers_must_sign() {
    let peer = chain(5, 3);
    let peer_keys = keypair_from_seed(&[7; 32]);
    let peer_public = peer_keys.public;

    let clock = Arc::new(NullClock::new(1_000));
    let mut hs = handshaker(1);
    hs.allowed_connections = AllowedConnections::SPECIFIED;
    hs.allowed_peers.insert(peer_public);
    let mut node = NetState::new(chain(5, 3), hs, settings(), clock.clone());

    // Unsigned: refused.
    let id = inbound(&mut node, 2);
    let mut unsigned = handshake_from(2, &peer, &node);
    unsigned.key = peer_public;
    let sent = deliver(&mut node, id, unsigned);
    assert!(has_go_away(&sent, GoAwayReason::Authentication));

    // Signed by the allowed key: admitted.
    let mut signer = handshaker(3);
    signer.keys.push(peer_keys);
    let id = inbound(&mut node, 3);
    let signed = signer.populate(&peer, node.now(), 1);
    assert!(!signed.sig.is_zero());
    let sent = deliver(&mut node, id, signed.clone());
    assert!(!sent.iter().any(|m| matches!(m, NetMessage::GoAway(_))));

    // A stale signed handshake is refused.
    clock.advance(Duration::from_secs(5));
    let id = inbound(&mut node, 4);
    let mut stale = signer.populate(&peer, ledgernet_types::Timestamp::from_secs(1_000), 1);
    stale.node_id = Digest::new([4; 32]);
    stale.p2p_address = "10.0.0.4:9876 - 0404040".into();
    let sent = deliver(&mut node, id, stale);
    assert!(has_go_away(&sent, GoAwayReason::Authentication));
}

#[test]
fn both_sides_reach_current_on_same_head() {
    let (mut a, _) = make_node(1, chain(5, 3));
    let (mut b, _) = make_node(2, chain(5, 3));
    let (a_id, b_id) = establish(&mut a, addr(1), &mut b, addr(2)).unwrap();
    exchange(&mut a, a_id, &mut b, b_id);

    for (state, id) in [(&a, a_id), (&b, b_id)] {
        let c = state.connection(id).unwrap();
        assert_eq!(c.state(), ConnectionState::Established(SessionMode::Current));
        assert_eq!(c.last_handshake_recv.head_num, 5);
    }
    assert_eq!(a.connection(a_id).unwrap().node_id, Digest::new([2; 32]));
}

/// Open a first session a -> b, then a second one b -> a later on, and let
/// `second_first` decide whose handshake on the second session is evaluated
/// first. The later session loses either way.
fn duplicate_session(second_first_to_a: bool) {
    let (mut a, clock_a) = make_node(1, chain(5, 3));
    let (mut b, clock_b) = make_node(2, chain(5, 3));
    let (a1, b1) = establish(&mut a, addr(1), &mut b, addr(2)).unwrap();
    exchange(&mut a, a1, &mut b, b1);

    clock_a.advance(Duration::from_secs(5));
    clock_b.advance(Duration::from_secs(5));
    let (b2, a2) = establish(&mut b, addr(2), &mut a, addr(1)).unwrap();
    if second_first_to_a {
        exchange(&mut b, b2, &mut a, a2);
    } else {
        exchange(&mut a, a2, &mut b, b2);
    }

    assert!(a.connection(a2).is_none());
    assert!(b.connection(b2).is_none());
    assert!(a.connection(a1).unwrap().current());
    assert!(b.connection(b1).unwrap().current());
    // The losing dial is not retried.
    assert!(b.peers_to_dial().is_empty());
}

#[test]
fn duplicate_tie_break_when_a_decides_first() {
    duplicate_session(true);
}

#[test]
fn duplicate_tie_break_when_b_decides_first() {
    duplicate_session(false);
}

#[test]
fn go_away_closes_and_stops_redial() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let id = node.connect("10.0.0.2:9876").unwrap();
    node.dial_succeeded(id, addr(2));
    drain_writes(&mut node, id);
    assert!(node.peers_to_dial().is_empty());

    node.handle_message(
        id,
        ledgernet_messages::GoAwayMessage {
            reason: GoAwayReason::WrongChain,
            node_id: Digest::ZERO,
        }
        .into(),
    );
    assert!(node.connection(id).is_none());
    assert_eq!(node.take_closed(), vec![id]);
    assert!(node.peers_to_dial().is_empty());
}

#[test]
fn failed_dial_is_retried() {
    let (mut node, _) = make_node(1, chain(5, 3));
    let id = node.connect("10.0.0.2:9876").unwrap();
    node.dial_failed(id, "connection refused");
    assert!(node.connection(id).is_none());
    assert_eq!(node.peers_to_dial(), vec!["10.0.0.2:9876".to_string()]);
}
