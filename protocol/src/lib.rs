//! Wire protocol: message framing, encoding/decoding, handshake checks, versioning.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod version;

pub use codec::{decode, encode, FrameDecoder, FRAME_HEADER_LEN, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use handshake::check_handshake;
pub use version::{
    network_version, to_protocol_version, NET_VERSION, NET_VERSION_BASE, PROTO_BASE,
    PROTO_EXPLICIT_SYNC,
};
