use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt};

/// Largest body a single packet frame can carry (24-bit length field)
pub const MAX_PACKET_BODY: usize = (1 << 24) - 1;

/// Wire-level packet kinds exchanged with the server
///
/// Every byte on the socket belongs to a frame of exactly one of these kinds:
/// a one-byte type tag, a 3-byte big-endian body length, and the body itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    /// Client's opening negotiation request, and the server's reply to it
    Handshake = 1,
    /// Client's acknowledgment that the negotiated parameters are in effect
    HandshakeAck = 2,
    /// Liveness probe; carries no body
    Heartbeat = 3,
    /// Application message, encoded by the message codec
    Data = 4,
    /// Server-initiated eviction
    Kick = 5,
}

impl PacketType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Handshake,
            2 => Self::HandshakeAck,
            3 => Self::Heartbeat,
            4 => Self::Data,
            5 => Self::Kick,
            _ => return None,
        })
    }
}

/// Errors from encoding a packet frame
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PacketEncodeError {
    /// Body exceeds what the 24-bit length field can describe
    #[error("packet body of {0} bytes exceeds the {MAX_PACKET_BODY} byte maximum")]
    Oversized(usize),
}

/// Errors from decoding the inbound packet stream
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PacketDecodeError {
    /// The type byte did not name a known packet kind
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// Frame `body` as a single packet of kind `ty`
pub fn encode(ty: PacketType, body: &[u8]) -> Result<Bytes, PacketEncodeError> {
    if body.len() > MAX_PACKET_BODY {
        return Err(PacketEncodeError::Oversized(body.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u8(ty as u8);
    buf.put_u24(body.len() as u32);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Incremental parser for the inbound byte stream
///
/// Reads arrive in arbitrary fragments; the parser buffers them and yields
/// complete `(type, body)` frames as they become available.
#[derive(Debug, Default)]
pub struct PacketParser {
    buf: BytesMut,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the parse buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame out of the buffer, if one is available
    ///
    /// Returns `Ok(None)` when more bytes are needed. An error poisons the
    /// stream; the caller is expected to drop the connection.
    pub fn next_packet(&mut self) -> Result<Option<(PacketType, Bytes)>, PacketDecodeError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut header = &self.buf[..4];
        let ty_byte = header.get_u8_checked().expect("length checked above");
        let len = header.get_u24_checked().expect("length checked above") as usize;
        let ty = PacketType::from_byte(ty_byte).ok_or(PacketDecodeError::UnknownType(ty_byte))?;
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let body = self.buf.split_to(len).freeze();
        Ok(Some((ty, body)))
    }

    /// Discard buffered bytes, e.g. when the socket is torn down
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
