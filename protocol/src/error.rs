use thiserror::Error;

/// Framing and validation failures. Each one closes only the connection
/// that produced it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type tag: {0}")]
    UnknownTag(u8),

    #[error("truncated frame")]
    Truncated,

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("empty frame")]
    EmptyFrame,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}
