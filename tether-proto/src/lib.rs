//! Protocol logic for the tether client transport
//!
//! tether-proto contains a fully deterministic implementation of the
//! transport's connection state machine, write queues and timers. It
//! performs no I/O and never reads the clock: packets, command inputs and
//! timestamps are fed in, and application events, I/O directives and timer
//! deadlines are polled out. Most users want the thread-and-socket API in
//! the `tether` crate instead.
//!
//! The most important types are [`Connection`], which owns the state for a
//! single logical connection and runs exclusively on the transport's I/O
//! thread, and [`Shared`], the thread-safe half holding the write-item pool,
//! the pre-write queues, and the state snapshot that calling threads consult.

#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod coding;
mod config;
mod connection;
mod handshake;
mod message;
mod mutex;
pub mod packet;
mod routes;
mod shared;
#[cfg(test)]
mod tests;
mod timer;
mod write_queue;

pub use config::TransportConfig;
pub use connection::{Connection, DisconnectReason, Event, Io, RequestError};
pub use message::{
    DecodeError, DefaultCodec, EncodeError, InboundMessage, MessageCodec, OutboundKind,
    OutboundMessage, RouteId,
};
pub use packet::{PacketDecodeError, PacketEncodeError, PacketParser, PacketType};
pub use routes::{RouteDictionary, Storage};
pub use shared::{ConnectionState, SendError, Shared};
