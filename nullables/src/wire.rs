//! Nullable wire: move frames between in-memory net states.
//!
//! Stands in for the reactor's writer and reader tasks: batches are taken,
//! decoded, delivered and reported written in order.

use std::net::SocketAddr;

use ledgernet_messages::NetMessage;
use ledgernet_network::{Chain, ConnectionId, NetState};
use ledgernet_protocol::decode;

/// Rounds after which [`exchange`] gives up on two chatty peers.
const MAX_ROUNDS: usize = 10_000;

/// Write out everything `id` has queued, batch by batch, and return the
/// decoded messages. Completions run between batches, so a sync range
/// being served is pumped to its end.
pub fn drain_writes<C: Chain>(state: &mut NetState<C>, id: ConnectionId) -> Vec<NetMessage> {
    let mut out = Vec::new();
    while let Some(batch) = state.take_write_batch(id) {
        out.extend(batch.iter().filter_map(|frame| decode(frame).ok().map(|(m, _)| m)));
        state.on_write_complete(id);
    }
    out
}

/// Open a session from `a` (dialing `b_addr`) to `b` (seeing `a_addr`).
/// Both sides have queued their handshakes; nothing is delivered yet.
pub fn establish<A: Chain, B: Chain>(
    a: &mut NetState<A>,
    a_addr: SocketAddr,
    b: &mut NetState<B>,
    b_addr: SocketAddr,
) -> Option<(ConnectionId, ConnectionId)> {
    let b_id = b.accept_inbound(a_addr)?;
    let a_id = a.connect(&b_addr.to_string())?;
    a.dial_succeeded(a_id, b_addr);
    Some((a_id, b_id))
}

/// Deliver queued messages in both directions until both sides go quiet.
/// Returns how many messages crossed.
pub fn exchange<A: Chain, B: Chain>(
    a: &mut NetState<A>,
    a_id: ConnectionId,
    b: &mut NetState<B>,
    b_id: ConnectionId,
) -> usize {
    let mut delivered = 0;
    for _ in 0..MAX_ROUNDS {
        let to_b = drain_writes(a, a_id);
        let to_a = drain_writes(b, b_id);
        if to_b.is_empty() && to_a.is_empty() {
            break;
        }
        delivered += to_b.len() + to_a.len();
        for msg in to_b {
            b.handle_message(b_id, msg);
        }
        for msg in to_a {
            a.handle_message(a_id, msg);
        }
    }
    delivered
}
