//! Span constructors for reactor work, so every log line emitted while
//! handling an event carries the session and message it belongs to.

use tracing::{debug_span, info_span, Span};

use ledgernet_network::ConnectionId;

/// Handling of one inbound message.
pub fn message_span(conn: ConnectionId, msg_type: &str) -> Span {
    debug_span!("net_message", conn = %conn, msg_type)
}

/// A socket event (accept, dial result, read or write outcome).
pub fn io_span(conn: Option<ConnectionId>, event: &'static str) -> Span {
    match conn {
        Some(conn) => debug_span!("net_io", conn = %conn, event),
        None => debug_span!("net_io", event),
    }
}

/// An operator command.
pub fn command_span(command: &'static str) -> Span {
    info_span!("net_command", command)
}
