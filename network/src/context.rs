use ledgernet_types::Timestamp;

use crate::chain::Chain;
use crate::connection::ConnectionSet;
use crate::handshake::Handshaker;

/// The shared state the sync and dispatch managers act on.
pub struct NetContext<'a> {
    pub conns: &'a mut ConnectionSet,
    pub chain: &'a dyn Chain,
    pub handshaker: &'a Handshaker,
    pub now: Timestamp,
}
