use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt};

/// Kind of an outbound application message
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OutboundKind {
    /// Expects a response correlated by request id
    Request,
    /// Fire-and-forget
    Notify,
}

/// An application message about to be encoded for the wire
///
/// The route code, when present, was resolved against the route dictionary;
/// codecs are free to ignore it and ship the full route string instead.
#[derive(Debug)]
pub struct OutboundMessage<'a> {
    pub kind: OutboundKind,
    /// Meaningful only for requests
    pub req_id: u32,
    pub route: &'a str,
    pub route_code: Option<u16>,
    pub payload: &'a [u8],
}

/// Route identity carried by an inbound message
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RouteId {
    Name(String),
    /// Compressed form; resolved against the route dictionary by the transport
    Code(u16),
}

/// A decoded message from the server
///
/// `req_id` of zero marks a server push; any other value correlates the
/// message with an earlier request.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub req_id: u32,
    pub route: Option<RouteId>,
    pub payload: Bytes,
}

/// Errors from message encoding
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum EncodeError {
    #[error("route must not be empty")]
    EmptyRoute,
    #[error("route of {0} bytes exceeds the 255 byte maximum")]
    RouteTooLong(usize),
}

/// Errors from message decoding
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("message truncated")]
    UnexpectedEnd,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("server sent a message kind only clients send")]
    UnexpectedKind,
    #[error("route is not valid UTF-8")]
    BadRoute,
}

impl From<crate::coding::UnexpectedEnd> for DecodeError {
    fn from(_: crate::coding::UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Pluggable message body codec
///
/// One codec instance is fixed per transport at construction; it is invoked
/// from calling threads (encode) and from the I/O thread (decode), so
/// implementations must be `Send + Sync`.
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(&self, msg: &OutboundMessage<'_>) -> Result<Bytes, EncodeError>;
    fn decode(&self, payload: Bytes) -> Result<InboundMessage, DecodeError>;
}

const KIND_REQUEST: u8 = 0;
const KIND_NOTIFY: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_PUSH: u8 = 3;

const FLAG_COMPRESSED_ROUTE: u8 = 0x01;

/// The stock binary message layout
///
/// Flag byte (kind in bits 1..3, route-compression in bit 0), then a varint
/// request id for request/response kinds, then the route — a `u16` dictionary
/// code when compressed, otherwise a length-prefixed UTF-8 string — and the
/// payload as the remainder. Responses carry no route; pushes carry no id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCodec;

impl MessageCodec for DefaultCodec {
    fn encode(&self, msg: &OutboundMessage<'_>) -> Result<Bytes, EncodeError> {
        if msg.route.is_empty() {
            return Err(EncodeError::EmptyRoute);
        }
        if msg.route.len() > u8::MAX as usize {
            return Err(EncodeError::RouteTooLong(msg.route.len()));
        }
        let kind = match msg.kind {
            OutboundKind::Request => KIND_REQUEST,
            OutboundKind::Notify => KIND_NOTIFY,
        };
        let mut flag = kind << 1;
        if msg.route_code.is_some() {
            flag |= FLAG_COMPRESSED_ROUTE;
        }
        let mut buf = BytesMut::with_capacity(8 + msg.route.len() + msg.payload.len());
        buf.put_u8(flag);
        if msg.kind == OutboundKind::Request {
            buf.put_var(u64::from(msg.req_id));
        }
        match msg.route_code {
            Some(code) => buf.put_u16(code),
            None => {
                buf.put_u8(msg.route.len() as u8);
                buf.put_slice(msg.route.as_bytes());
            }
        }
        buf.put_slice(msg.payload);
        Ok(buf.freeze())
    }

    fn decode(&self, mut payload: Bytes) -> Result<InboundMessage, DecodeError> {
        let flag = payload.get_u8_checked()?;
        let compressed = flag & FLAG_COMPRESSED_ROUTE != 0;
        match flag >> 1 {
            KIND_RESPONSE => {
                let id = payload.get_var()?;
                Ok(InboundMessage {
                    req_id: id as u32,
                    route: None,
                    payload,
                })
            }
            KIND_PUSH => {
                let route = if compressed {
                    RouteId::Code(payload.get_u16_checked()?)
                } else {
                    let len = payload.get_u8_checked()? as usize;
                    if payload.remaining() < len {
                        return Err(DecodeError::UnexpectedEnd);
                    }
                    let raw = payload.split_to(len);
                    RouteId::Name(
                        std::str::from_utf8(&raw)
                            .map_err(|_| DecodeError::BadRoute)?
                            .to_owned(),
                    )
                };
                Ok(InboundMessage {
                    req_id: 0,
                    route: Some(route),
                    payload,
                })
            }
            KIND_REQUEST | KIND_NOTIFY => Err(DecodeError::UnexpectedKind),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}
