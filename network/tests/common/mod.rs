#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use ledgernet_messages::{HandshakeMessage, NetMessage};
use ledgernet_network::{Chain, ConnectionId, Handshaker, NetSettings, NetState};
use ledgernet_nullables::{drain_writes, NullChain, NullClock};
use ledgernet_types::{BlockNum, Digest};

pub const CHAIN_ID: Digest = Digest::new([0xC1; 32]);

pub type Node = NetState<NullChain>;

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 9876))
}

pub fn handshaker(n: u8) -> Handshaker {
    Handshaker::new(Digest::new([n; 32]), addr(n).to_string())
}

pub fn settings() -> NetSettings {
    NetSettings {
        max_nodes_per_host: 4,
        ..NetSettings::default()
    }
}

/// Node number `n` over `chain`, at time 1000s.
pub fn make_node(n: u8, chain: NullChain) -> (Node, Arc<NullClock>) {
    make_node_with(n, chain, settings())
}

pub fn make_node_with(n: u8, chain: NullChain, settings: NetSettings) -> (Node, Arc<NullClock>) {
    let clock = Arc::new(NullClock::new(1_000));
    let state = NetState::new(chain, handshaker(n), settings, clock.clone());
    (state, clock)
}

pub fn chain(head: BlockNum, lib: BlockNum) -> NullChain {
    NullChain::with_blocks(CHAIN_ID, head, lib)
}

/// The generation-1 handshake node `n` would send from `chain`.
pub fn handshake_from(n: u8, chain: &NullChain, node: &Node) -> HandshakeMessage {
    handshaker(n).populate(chain, node.now(), 1)
}

/// Accept peer `n` and discard our opening handshake.
pub fn inbound(node: &mut Node, n: u8) -> ConnectionId {
    let id = node.accept_inbound(addr(n)).expect("accepted");
    drain_writes(node, id);
    id
}

/// Accept peer `n` and deliver its handshake; returns what we answered.
pub fn greet(node: &mut Node, n: u8, peer_chain: &NullChain) -> (ConnectionId, Vec<NetMessage>) {
    let id = inbound(node, n);
    let hs = handshake_from(n, peer_chain, node);
    node.handle_message(id, hs.into());
    (id, drain_writes(node, id))
}

pub fn deliver(node: &mut Node, id: ConnectionId, msg: impl Into<NetMessage>) -> Vec<NetMessage> {
    node.handle_message(id, msg.into());
    drain_writes(node, id)
}

pub fn blocks_in(msgs: &[NetMessage]) -> Vec<BlockNum> {
    msgs.iter()
        .filter_map(|m| match m {
            NetMessage::SignedBlock(b) => Some(b.block_num()),
            _ => None,
        })
        .collect()
}

pub fn has_go_away(msgs: &[NetMessage], reason: ledgernet_messages::GoAwayReason) -> bool {
    msgs.iter()
        .any(|m| matches!(m, NetMessage::GoAway(g) if g.reason == reason))
}

pub fn head_of(chain: &impl Chain) -> BlockNum {
    chain.head_block_num()
}
