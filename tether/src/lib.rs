//! Persistent TCP client transport for request/response + push backends
//!
//! A [`Transport`] manages exactly one logical connection to a backend: it
//! owns the connect → handshake → steady-state → reconnect lifecycle, frames
//! and dispatches protocol packets, multiplexes concurrent requests onto the
//! one socket, probes liveness with heartbeats, and rides out transient
//! network failure with capped exponential reconnection.
//!
//! All protocol logic lives in `tether-proto`, which is deterministic and
//! performs no I/O. This crate supplies the missing half: a private I/O
//! thread running a single-threaded tokio event loop, a command channel that
//! public entry points signal it through, and the sockets and timers the
//! state machine directs. `connect`, `send` and `disconnect` never block;
//! the one blocking call is [`Transport::shutdown`], which joins the I/O
//! thread — and refuses to do so from that thread itself.
//!
//! ```no_run
//! use tether::{Transport, TransportOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let (transport, mut events) = Transport::new(TransportOptions::default())?;
//! transport.connect("game.example.com", 3250, Some(r#"{"user":{"token":"t"}}"#))?;
//! transport.send("gate.join", 1, b"{}", Some(1), None)?;
//! while let Some(event) = events.blocking_recv() {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod driver;
mod transport;

pub use proto::{
    ConnectionState, DecodeError, DefaultCodec, DisconnectReason, EncodeError, Event,
    InboundMessage, MessageCodec, OutboundKind, OutboundMessage, PacketType, RequestError,
    RouteDictionary, RouteId, SendError, Storage, TransportConfig,
};

pub use crate::transport::{ConnectError, InitError, ShutdownError, Transport, TransportOptions};
