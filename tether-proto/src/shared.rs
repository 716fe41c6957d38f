use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use crate::message::{EncodeError, MessageCodec, OutboundKind, OutboundMessage};
use crate::mutex::{Mutex, MutexGuard};
use crate::packet::{self, PacketEncodeError, PacketType};
use crate::routes::RouteDictionary;
use crate::write_queue::{SendQueues, WiKind, WriteItem};
use crate::TransportConfig;

/// Lifecycle of the connection, as observed by any thread
///
/// The authoritative state lives on the I/O thread; this snapshot is
/// published on every transition so `send` can route items without touching
/// the state machine's fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connect requested, or the last connection dropped
    NotConnected = 0,
    /// Raw TCP connect in progress
    Connecting = 1,
    /// TCP established, negotiating
    Handshaking = 2,
    /// Steady state; traffic flows
    Done = 3,
    /// Shut down; the I/O thread has exited or is exiting
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotConnected,
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::Done,
            _ => Self::Closed,
        }
    }
}

/// Errors from `send`
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SendError {
    /// No connect attempt has been initiated, or the transport was shut down
    #[error("transport is not connected")]
    InvalidState,
    /// The message codec rejected the input; nothing was queued
    #[error("message encoding failed: {0}")]
    Encode(#[from] EncodeError),
    /// The packet framer rejected the encoded message; nothing was queued
    #[error("packet encoding failed: {0}")]
    Packet(#[from] PacketEncodeError),
}

/// RTT sentinel meaning "no sample yet"
const RTT_UNKNOWN: i64 = -1;

/// State reachable from both calling threads and the I/O thread
///
/// Lock discipline: the write queues and item pool share one lock because
/// both sides mutate them; the serializer and route dictionary each get
/// their own; everything else here is atomic. The state machine proper
/// (`Connection`) has no lock at all — it is owned by the I/O thread.
pub struct Shared {
    state: AtomicU8,
    queues: Mutex<SendQueues>,
    serializer: StdMutex<Option<String>>,
    routes: StdMutex<RouteDictionary>,
    rtt_micros: AtomicI64,
    codec: Box<dyn MessageCodec>,
    retry_limit: u32,
}

impl Shared {
    pub fn new(
        config: &TransportConfig,
        codec: Box<dyn MessageCodec>,
        routes: RouteDictionary,
    ) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::NotConnected as u8),
            queues: Mutex::new(SendQueues::new(config.pool_slots)),
            serializer: StdMutex::new(None),
            routes: StdMutex::new(routes),
            rtt_micros: AtomicI64::new(RTT_UNKNOWN),
            codec,
            retry_limit: config.send_retry_limit,
        }
    }

    /// Current connection state snapshot
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Serializer name the last handshake negotiated, if any
    pub fn serializer(&self) -> Option<String> {
        self.serializer.lock().unwrap().clone()
    }

    pub(crate) fn set_serializer(&self, name: Option<String>) {
        *self.serializer.lock().unwrap() = name;
    }

    /// Heartbeat round-trip estimate; `None` until the first sample
    pub fn rtt(&self) -> Option<Duration> {
        match self.rtt_micros.load(Ordering::Relaxed) {
            RTT_UNKNOWN => None,
            micros => Some(Duration::from_micros(micros as u64)),
        }
    }

    pub(crate) fn set_rtt(&self, rtt: Duration) {
        self.rtt_micros
            .store(rtt.as_micros().min(i64::MAX as u128) as i64, Ordering::Relaxed);
    }

    pub(crate) fn lock_queues(&self, purpose: &'static str) -> MutexGuard<'_, SendQueues> {
        self.queues.lock(purpose)
    }

    pub(crate) fn routes(&self) -> StdMutexGuard<'_, RouteDictionary> {
        self.routes.lock().unwrap()
    }

    pub(crate) fn codec(&self) -> &dyn MessageCodec {
        &*self.codec
    }

    /// Encode and queue one outbound message; the caller signals the I/O
    /// thread on success
    ///
    /// Runs entirely on the calling thread and never blocks on I/O. Both
    /// encoding stages complete before any write item exists, so an encoding
    /// failure queues nothing and leaks nothing.
    pub fn send(
        &self,
        route: &str,
        seq: u32,
        payload: &[u8],
        req_id: Option<u32>,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<(), SendError> {
        if matches!(
            self.state(),
            ConnectionState::NotConnected | ConnectionState::Closed
        ) {
            return Err(SendError::InvalidState);
        }
        if route.is_empty() {
            return Err(EncodeError::EmptyRoute.into());
        }

        let route_code = self.routes().code_for(route);
        let msg = OutboundMessage {
            kind: match req_id {
                Some(_) => OutboundKind::Request,
                None => OutboundKind::Notify,
            },
            req_id: req_id.unwrap_or(0),
            route,
            route_code,
            payload,
        };
        let body = self.codec.encode(&msg)?;
        let buf = packet::encode(PacketType::Data, &body)?;

        let item = WriteItem {
            kind: match req_id {
                Some(id) => WiKind::Request { req_id: id, timeout },
                None => WiKind::Notify,
            },
            seq,
            buf,
            queued_at: now,
            retries_left: self.retry_limit,
        };

        let mut queues = self.lock_queues("send");
        // Re-read under the lock: the handshake may have completed (or the
        // connection dropped) since the snapshot above.
        let connected = self.state() == ConnectionState::Done;
        let handle = queues.enqueue(item, connected);
        trace!(?handle, seq, ?req_id, connected, "queued write item");
        Ok(())
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state())
            .field("rtt", &self.rtt())
            .finish_non_exhaustive()
    }
}
