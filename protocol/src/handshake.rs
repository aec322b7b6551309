//! Structural checks on an inbound handshake.
//!
//! These run before anything else looks at the message. Chain, version,
//! identity and authentication checks need node state and live in the
//! network crate.

use ledgernet_crypto::hash_time;
use ledgernet_messages::HandshakeMessage;

use crate::ProtocolError;

/// Reject handshakes whose fields contradict each other.
///
/// A handshake is unusable when its LIB is above its head, when it has no
/// `p2p_address` or `os`, or when it claims to be signed (non-zero `sig` or
/// `token`) but the token is not the hash of its `time`.
pub fn check_handshake(msg: &HandshakeMessage) -> Result<(), ProtocolError> {
    if msg.last_irreversible_block_num > msg.head_num {
        return Err(ProtocolError::HandshakeFailed(format!(
            "lib {} > head {}",
            msg.last_irreversible_block_num, msg.head_num
        )));
    }
    if msg.p2p_address.is_empty() {
        return Err(ProtocolError::HandshakeFailed("no p2p address".into()));
    }
    if msg.os.is_empty() {
        return Err(ProtocolError::HandshakeFailed("no os".into()));
    }
    let signed = !msg.sig.is_zero() || !msg.token.is_zero();
    if signed && msg.token != hash_time(msg.time) {
        return Err(ProtocolError::HandshakeFailed(
            "token does not match time".into(),
        ));
    }
    Ok(())
}
