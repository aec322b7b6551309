//! Message codec: framing and serialization for the wire protocol.
//!
//! A frame is a 4-byte little-endian length, a 1-byte type tag, then the
//! bincode (fixed-width integers, little-endian) payload of the message
//! struct. The length counts the tag and the payload.

use bincode::Options;
use ledgernet_messages::{
    ChainSizeMessage, GoAwayMessage, HandshakeMessage, NetMessage, NoticeMessage,
    PackedTransaction, RequestMessage, SignedBlock, SyncRequestMessage, TimeMessage,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ProtocolError;

/// Default largest frame (tag + payload) accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

/// Bytes in front of the tag: the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    options()
        .serialize(msg)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    options()
        .deserialize(bytes)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a message into a complete frame ready for the socket.
pub fn encode(message: &NetMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = match message {
        NetMessage::Handshake(m) => payload(m)?,
        NetMessage::ChainSize(m) => payload(m)?,
        NetMessage::GoAway(m) => payload(m)?,
        NetMessage::Time(m) => payload(m)?,
        NetMessage::Notice(m) => payload(m)?,
        NetMessage::Request(m) => payload(m)?,
        NetMessage::SyncRequest(m) => payload(m)?,
        NetMessage::SignedBlock(m) => payload(m)?,
        NetMessage::PackedTransaction(m) => payload(m)?,
    };
    let frame_len = body.len() + 1;
    let len = u32::try_from(frame_len).map_err(|_| ProtocolError::MessageTooLarge {
        size: frame_len,
        max: u32::MAX as usize,
    })?;

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + frame_len);
    out.extend_from_slice(&len.to_le_bytes());
    out.push(message.tag());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode the tag and payload of one frame (everything after the length).
pub fn decode_body(body: &[u8]) -> Result<NetMessage, ProtocolError> {
    let (&tag, rest) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;
    let msg = match tag {
        0 => NetMessage::Handshake(parse::<HandshakeMessage>(rest)?),
        1 => NetMessage::ChainSize(parse::<ChainSizeMessage>(rest)?),
        2 => NetMessage::GoAway(parse::<GoAwayMessage>(rest)?),
        3 => NetMessage::Time(parse::<TimeMessage>(rest)?),
        4 => NetMessage::Notice(parse::<NoticeMessage>(rest)?),
        5 => NetMessage::Request(parse::<RequestMessage>(rest)?),
        6 => NetMessage::SyncRequest(parse::<SyncRequestMessage>(rest)?),
        7 => NetMessage::SignedBlock(parse::<SignedBlock>(rest)?),
        8 => NetMessage::PackedTransaction(parse::<PackedTransaction>(rest)?),
        other => return Err(ProtocolError::UnknownTag(other)),
    };
    Ok(msg)
}

/// Read the length prefix of a frame, checking it against `max`.
///
/// Returns `Ok(None)` when fewer than four bytes are available.
pub fn frame_len(data: &[u8], max: usize) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..FRAME_HEADER_LEN) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > max {
        return Err(ProtocolError::MessageTooLarge { size: len, max });
    }
    Ok(Some(len))
}

/// Decode one complete frame from the front of `data`.
///
/// Returns the message and the number of bytes consumed. Bytes after the
/// frame are left alone.
pub fn decode(data: &[u8]) -> Result<(NetMessage, usize), ProtocolError> {
    let len = frame_len(data, MAX_MESSAGE_SIZE)?.ok_or(ProtocolError::Truncated)?;
    let end = FRAME_HEADER_LEN + len;
    let body = data
        .get(FRAME_HEADER_LEN..end)
        .ok_or(ProtocolError::Truncated)?;
    Ok((decode_body(body)?, end))
}

/// Incremental decoder for a byte stream.
///
/// Socket reads are pushed in with [`FrameDecoder::extend`] in arrival
/// order; complete messages come out of [`FrameDecoder::next_message`] in
/// the same order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_message_size,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if one has fully arrived.
    ///
    /// An error leaves the decoder unusable; the connection must be closed.
    pub fn next_message(&mut self) -> Result<Option<NetMessage>, ProtocolError> {
        let Some(len) = frame_len(&self.buf, self.max_message_size)? else {
            return Ok(None);
        };
        let end = FRAME_HEADER_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let msg = decode_body(&self.buf[FRAME_HEADER_LEN..end]);
        self.buf.drain(..end);
        msg.map(Some)
    }
}
