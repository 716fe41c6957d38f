use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::handshake;
use crate::message::RouteId;
use crate::packet::{self, PacketType};
use crate::routes::Storage;
use crate::shared::{ConnectionState, Shared};
use crate::timer::{Timer, TimerTable};
use crate::write_queue::{RespPending, SettleOutcome, WiHandle};
use crate::TransportConfig;

/// Things that happened on the connection, for the application
#[derive(Debug, Clone)]
pub enum Event {
    /// Handshake completed; traffic flows
    Connected,
    /// The connection dropped, or an explicit disconnect took effect
    Disconnected { reason: DisconnectReason },
    /// Automatic reconnection gave up after this many failed attempts
    ReconnectFailed { attempts: u32 },
    /// A response arrived for an outstanding request
    Response { req_id: u32, payload: Bytes },
    /// An outstanding request will never get a response
    RequestFailed { req_id: u32, error: RequestError },
    /// A notification was written to the socket
    NotifySent { seq: u32 },
    /// A notification was dropped before it could be written
    NotifyFailed { seq: u32, error: RequestError },
    /// A server-initiated message
    Push { route: String, payload: Bytes },
    /// The server evicted this client
    Kicked,
}

/// Why a connection stopped being usable
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DisconnectReason {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("no server traffic within the heartbeat window")]
    HeartbeatTimeout,
    #[error("handshake rejected with code {0}")]
    HandshakeRejected(u64),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("kicked by server")]
    Kick,
    #[error("disconnect requested")]
    Requested,
}

/// Why a queued request or notification was failed back
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("connection lost before completion")]
    Disconnected,
}

/// I/O the driver must perform on the connection's behalf
#[derive(Debug)]
pub enum Io {
    /// Open a TCP connection; report the outcome with this attempt tag
    Connect {
        host: String,
        port: u16,
        attempt: u64,
    },
    /// Write these buffers to the socket, in order, as one batch
    Write(Vec<Bytes>),
    /// Drop the socket and any buffered output
    Close,
}

#[derive(Debug, Clone)]
struct ConnectTarget {
    host: String,
    port: u16,
    opts: Option<Value>,
}

/// Protocol state and logic for the one connection a transport manages
///
/// Owned exclusively by the I/O thread. Objects of this type perform no I/O
/// themselves: they consume commands, packets and timestamps, and are polled
/// for application `Event`s, `Io` directives, and the next timer deadline.
/// Everything here is deterministic given those inputs, which is what the
/// scenario tests exploit.
pub struct Connection {
    config: Arc<TransportConfig>,
    shared: Arc<Shared>,
    storage: Option<Box<dyn Storage>>,
    state: ConnectionState,
    target: Option<ConnectTarget>,
    /// Generation tag distinguishing the current connect attempt from
    /// superseded ones whose completion may still arrive
    attempt: u64,
    socket_open: bool,
    timers: TimerTable,
    reconn_attempts: u32,
    /// Negotiated heartbeat interval; `None` disables the probe
    heartbeat: Option<Duration>,
    /// When the unacknowledged heartbeat probe went out
    hb_sent_at: Option<Instant>,
    last_packet: Instant,
    /// Items in the batch currently being flushed
    writing: Vec<WiHandle>,
    is_writing: bool,
    /// Written requests awaiting a response or their deadline
    resp_pending: Vec<RespPending>,
    /// Handshake, ack and heartbeat frames awaiting the next flush
    ctrl_out: VecDeque<Bytes>,
    events: VecDeque<Event>,
    io: VecDeque<Io>,
    stopped: bool,
}

impl Connection {
    pub fn new(
        config: Arc<TransportConfig>,
        shared: Arc<Shared>,
        storage: Option<Box<dyn Storage>>,
        now: Instant,
    ) -> Self {
        Self {
            config,
            shared,
            storage,
            state: ConnectionState::NotConnected,
            target: None,
            attempt: 0,
            socket_open: false,
            timers: TimerTable::default(),
            reconn_attempts: 0,
            heartbeat: None,
            hb_sent_at: None,
            last_packet: now,
            writing: Vec::new(),
            is_writing: false,
            resp_pending: Vec::new(),
            ctrl_out: VecDeque::new(),
            events: VecDeque::new(),
            io: VecDeque::new(),
            stopped: false,
        }
    }

    /// Next application event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Next I/O directive for the driver
    pub fn poll_io(&mut self) -> Option<Io> {
        self.io.pop_front()
    }

    /// Earliest timer deadline, to be fed back via `handle_timeout`
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Record a (possibly new) target and start connecting to it
    ///
    /// A connect while another connection is active tears the old one down
    /// first; the two never coexist.
    pub fn connect(&mut self, host: String, port: u16, opts: Option<Value>, now: Instant) {
        if self.stopped {
            return;
        }
        self.target = Some(ConnectTarget { host, port, opts });
        self.reconn_attempts = 0;
        if self.state != ConnectionState::NotConnected {
            debug!("connect request supersedes the active connection");
            self.teardown();
            let inflight = self.take_inflight();
            let outcome = self
                .shared
                .lock_queues("supersede")
                .settle_inflight(inflight, true);
            self.emit_settle(outcome, RequestError::Disconnected);
        }
        self.timers.stop(Timer::Reconnect);
        self.start_connect(now);
    }

    fn start_connect(&mut self, now: Instant) {
        let Some(target) = &self.target else {
            return;
        };
        let host = target.host.clone();
        let port = target.port;
        self.attempt += 1;
        self.set_state(ConnectionState::Connecting);
        debug!(host = %host, port = port, attempt = self.attempt, "connecting");
        self.io.push_back(Io::Connect {
            host,
            port,
            attempt: self.attempt,
        });
        self.timers.set(Timer::Connect, now + self.config.connect_timeout);
    }

    /// Outcome of the raw TCP connect the driver performed
    ///
    /// Returns whether the socket was accepted; a stale attempt's socket
    /// must be dropped by the caller.
    pub fn handle_connect_result(
        &mut self,
        attempt: u64,
        result: Result<(), String>,
        now: Instant,
    ) -> bool {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            trace!(attempt, "discarding superseded connect result");
            return false;
        }
        match result {
            Ok(()) => {
                self.socket_open = true;
                self.timers.stop(Timer::Connect);
                self.set_state(ConnectionState::Handshaking);
                let opts = self.target.as_ref().and_then(|t| t.opts.as_ref());
                let body = handshake::request_body(opts);
                match packet::encode(PacketType::Handshake, &body) {
                    Ok(buf) => {
                        self.ctrl_out.push_back(buf);
                        self.timers
                            .set(Timer::Handshake, now + self.config.handshake_timeout);
                        self.flush();
                    }
                    Err(e) => {
                        self.fail(now, DisconnectReason::HandshakeFailed(e.to_string()));
                    }
                }
                true
            }
            Err(e) => {
                debug!(error = %e, "tcp connect failed");
                self.fail(now, DisconnectReason::Io(e));
                false
            }
        }
    }

    /// A calling thread queued items; flush them if the writer is idle
    pub fn request_flush(&mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        if self.is_writing || !self.socket_open {
            return;
        }
        let mut bufs: Vec<Bytes> = self.ctrl_out.drain(..).collect();
        if self.state == ConnectionState::Done {
            for (handle, buf) in self.shared.lock_queues("flush").begin_write() {
                self.writing.push(handle);
                bufs.push(buf);
            }
        }
        if bufs.is_empty() {
            return;
        }
        trace!(bufs = bufs.len(), items = self.writing.len(), "starting batched write");
        self.is_writing = true;
        self.io.push_back(Io::Write(bufs));
    }

    /// Outcome of the batched write the driver performed
    pub fn handle_write_done(&mut self, result: Result<(), String>, now: Instant) {
        if !self.is_writing {
            return;
        }
        self.is_writing = false;
        match result {
            Ok(()) => {
                let handles = mem::take(&mut self.writing);
                let (pending, notified) = self
                    .shared
                    .lock_queues("write done")
                    .complete_written(handles);
                for seq in notified {
                    self.events.push_back(Event::NotifySent { seq });
                }
                if !pending.is_empty() && self.timers.get(Timer::CheckTimeout).is_none() {
                    self.timers
                        .set(Timer::CheckTimeout, now + self.config.timeout_check_interval);
                }
                self.resp_pending.extend(pending);
                // anything queued while the batch was in flight
                self.flush();
            }
            Err(e) => self.fail(now, DisconnectReason::Io(e)),
        }
    }

    /// One parsed packet from the socket
    pub fn handle_packet(&mut self, ty: PacketType, body: Bytes, now: Instant) {
        if !self.socket_open {
            return;
        }
        // any packet at all proves the server is alive
        self.last_packet = now;
        match ty {
            PacketType::Handshake => self.on_handshake_response(body, now),
            PacketType::HandshakeAck => warn!("server sent a handshake ack; ignoring"),
            PacketType::Heartbeat => self.on_heartbeat(now),
            PacketType::Data => self.on_data(body),
            PacketType::Kick => self.on_kick(),
        }
    }

    fn on_handshake_response(&mut self, body: Bytes, now: Instant) {
        if self.state != ConnectionState::Handshaking {
            warn!(state = ?self.state, "unexpected handshake packet; ignoring");
            return;
        }
        let resp = match handshake::parse_response(&body) {
            Ok(resp) => resp,
            Err(e) => {
                self.fail(now, DisconnectReason::HandshakeFailed(e.to_string()));
                return;
            }
        };
        if resp.code != handshake::CODE_OK {
            self.fail(now, DisconnectReason::HandshakeRejected(resp.code));
            return;
        }
        self.timers.stop(Timer::Handshake);
        let sys = resp.sys.unwrap_or_default();

        if let Some(dict) = sys.dict {
            let persisted = {
                let mut routes = self.shared.routes();
                routes.apply_handshake_dict(dict).then(|| routes.to_persisted())
            };
            if let (Some(blob), Some(storage)) = (persisted, self.storage.as_ref()) {
                storage.write(&blob);
            }
        }
        self.shared.set_serializer(sys.serializer);

        self.heartbeat = sys
            .heartbeat
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);

        if let Ok(ack) = packet::encode(PacketType::HandshakeAck, &[]) {
            self.ctrl_out.push_back(ack);
        }
        self.set_state(ConnectionState::Done);
        self.reconn_attempts = 0;
        debug!(heartbeat = ?self.heartbeat, "handshake complete");
        self.events.push_back(Event::Connected);

        self.shared.lock_queues("promote").promote_pending();
        if let Some(interval) = self.heartbeat {
            self.timers.set(Timer::Heartbeat, now + interval);
        }
        self.flush();
    }

    fn on_heartbeat(&mut self, now: Instant) {
        if let Some(sent) = self.hb_sent_at.take() {
            let rtt = now.duration_since(sent);
            trace!(?rtt, "heartbeat acknowledged");
            self.shared.set_rtt(rtt);
        }
    }

    fn on_data(&mut self, body: Bytes) {
        let msg = match self.shared.codec().decode(body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping undecodable data packet");
                return;
            }
        };
        if msg.req_id != 0 {
            let Some(pos) = self.resp_pending.iter().position(|p| p.req_id == msg.req_id) else {
                warn!(req_id = msg.req_id, "response for unknown request; dropping");
                return;
            };
            let entry = self.resp_pending.remove(pos);
            self.shared.lock_queues("response").release(entry.handle);
            if self.resp_pending.is_empty() {
                self.timers.stop(Timer::CheckTimeout);
            }
            self.events.push_back(Event::Response {
                req_id: msg.req_id,
                payload: msg.payload,
            });
            return;
        }
        let route = match msg.route {
            Some(RouteId::Name(name)) => name,
            Some(RouteId::Code(code)) => match self.shared.routes().route_for(code) {
                Some(name) => name.to_owned(),
                None => {
                    warn!(code, "push with unknown route code; dropping");
                    return;
                }
            },
            None => {
                warn!("push without a route; dropping");
                return;
            }
        };
        self.events.push_back(Event::Push {
            route,
            payload: msg.payload,
        });
    }

    fn on_kick(&mut self) {
        debug!("kicked by server");
        self.events.push_back(Event::Kicked);
        self.teardown();
        let inflight = self.take_inflight();
        let o1 = self.shared.lock_queues("kick").settle_inflight(inflight, false);
        let o2 = self.shared.lock_queues("kick").fail_queued();
        self.emit_settle(o1, RequestError::Disconnected);
        self.emit_settle(o2, RequestError::Disconnected);
        self.reconn_attempts = 0;
        self.set_state(ConnectionState::NotConnected);
        self.events.push_back(Event::Disconnected {
            reason: DisconnectReason::Kick,
        });
    }

    /// Explicit, application-initiated disconnect; never reconnects
    pub fn disconnect(&mut self) {
        if self.stopped {
            return;
        }
        let was_active =
            self.state != ConnectionState::NotConnected || self.timers.get(Timer::Reconnect).is_some();
        self.teardown();
        self.timers.stop(Timer::Reconnect);
        let inflight = self.take_inflight();
        let o1 = self
            .shared
            .lock_queues("disconnect")
            .settle_inflight(inflight, false);
        let o2 = self.shared.lock_queues("disconnect").fail_queued();
        self.emit_settle(o1, RequestError::Disconnected);
        self.emit_settle(o2, RequestError::Disconnected);
        self.reconn_attempts = 0;
        self.set_state(ConnectionState::NotConnected);
        if was_active {
            debug!("disconnected on request");
            self.events.push_back(Event::Disconnected {
                reason: DisconnectReason::Requested,
            });
        }
    }

    /// Final teardown on the way out of the I/O thread
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        debug!("stopping transport");
        self.teardown();
        let inflight = self.take_inflight();
        let o1 = self.shared.lock_queues("stop").settle_inflight(inflight, false);
        let o2 = self.shared.lock_queues("stop").fail_queued();
        self.emit_settle(o1, RequestError::Disconnected);
        self.emit_settle(o2, RequestError::Disconnected);
        self.set_state(ConnectionState::Closed);
        self.stopped = true;
    }

    /// A socket-level read or connection error
    pub fn handle_io_error(&mut self, error: String, now: Instant) {
        if !self.socket_open {
            return;
        }
        self.fail(now, DisconnectReason::Io(error));
    }

    /// Process every timer whose deadline has passed
    pub fn handle_timeout(&mut self, now: Instant) {
        for timer in Timer::VALUES {
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            self.timers.stop(timer);
            trace!(?timer, "timeout");
            match timer {
                Timer::Connect => self.fail(now, DisconnectReason::ConnectTimeout),
                Timer::Handshake => self.fail(now, DisconnectReason::HandshakeTimeout),
                Timer::Heartbeat => self.on_heartbeat_timer(now),
                Timer::CheckTimeout => self.expire_requests(now),
                Timer::Reconnect => self.start_connect(now),
            }
        }
    }

    fn on_heartbeat_timer(&mut self, now: Instant) {
        let Some(interval) = self.heartbeat else {
            return;
        };
        let window = interval * self.config.heartbeat_timeout_factor;
        if now.duration_since(self.last_packet) >= window {
            self.fail(now, DisconnectReason::HeartbeatTimeout);
            return;
        }
        if let Ok(probe) = packet::encode(PacketType::Heartbeat, &[]) {
            self.ctrl_out.push_back(probe);
        }
        if self.hb_sent_at.is_none() {
            self.hb_sent_at = Some(now);
        }
        self.timers.set(Timer::Heartbeat, now + interval);
        self.flush();
    }

    fn expire_requests(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.resp_pending.len() {
            match self.resp_pending[i].deadline {
                Some(deadline) if deadline <= now => {
                    let entry = self.resp_pending.remove(i);
                    debug!(req_id = entry.req_id, "request timed out");
                    self.shared.lock_queues("expire").release(entry.handle);
                    self.events.push_back(Event::RequestFailed {
                        req_id: entry.req_id,
                        error: RequestError::Timeout,
                    });
                }
                _ => i += 1,
            }
        }
        if !self.resp_pending.is_empty() {
            self.timers
                .set(Timer::CheckTimeout, now + self.config.timeout_check_interval);
        }
    }

    /// Failure-driven drop; schedules a reconnect unless attempts ran out
    fn fail(&mut self, now: Instant, reason: DisconnectReason) {
        let error = match reason {
            DisconnectReason::ConnectTimeout
            | DisconnectReason::HandshakeTimeout
            | DisconnectReason::HeartbeatTimeout => RequestError::Timeout,
            _ => RequestError::Disconnected,
        };
        warn!(%reason, "connection failed");
        self.teardown();
        self.reconn_attempts += 1;
        let give_up = self
            .config
            .reconnect_max_attempts
            .map_or(false, |max| self.reconn_attempts > max);

        let inflight = self.take_inflight();
        let outcome = self
            .shared
            .lock_queues("fail")
            .settle_inflight(inflight, !give_up);
        self.emit_settle(outcome, error);

        self.set_state(ConnectionState::NotConnected);
        self.events.push_back(Event::Disconnected { reason });

        if give_up {
            let queued = self.shared.lock_queues("give up").fail_queued();
            self.emit_settle(queued, error);
            warn!(attempts = self.reconn_attempts, "giving up on reconnection");
            self.events.push_back(Event::ReconnectFailed {
                attempts: self.reconn_attempts,
            });
        } else {
            let delay = self.reconnect_delay();
            debug!(?delay, attempt = self.reconn_attempts, "reconnect scheduled");
            self.timers.set(Timer::Reconnect, now + delay);
        }
    }

    fn reconnect_delay(&self) -> Duration {
        let exp = self.reconn_attempts.saturating_sub(1).min(16);
        self.config
            .reconnect_delay_base
            .saturating_mul(1 << exp)
            .min(self.config.reconnect_delay_max)
    }

    /// Shut the socket and every timer; queue state is the caller's problem
    fn teardown(&mut self) {
        self.timers.stop_all();
        self.ctrl_out.clear();
        self.is_writing = false;
        self.hb_sent_at = None;
        self.heartbeat = None;
        if self.socket_open {
            self.socket_open = false;
            self.io.push_back(Io::Close);
        }
    }

    fn take_inflight(&mut self) -> Vec<WiHandle> {
        // resp-pending items were written before the current batch
        let mut handles: Vec<WiHandle> =
            mem::take(&mut self.resp_pending).into_iter().map(|p| p.handle).collect();
        handles.append(&mut self.writing);
        handles
    }

    fn emit_settle(&mut self, outcome: SettleOutcome, error: RequestError) {
        for req_id in outcome.failed_requests {
            self.events.push_back(Event::RequestFailed { req_id, error });
        }
        for seq in outcome.failed_notifies {
            self.events.push_back(Event::NotifyFailed { seq, error });
        }
        if outcome.retried > 0 {
            debug!(items = outcome.retried, "in-flight items preserved for replay");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "state transition");
        }
        self.state = state;
        self.shared.set_state(state);
    }

    #[cfg(test)]
    pub(crate) fn current_attempt(&self) -> u64 {
        self.attempt
    }

    #[cfg(test)]
    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconn_attempts
    }

    #[cfg(test)]
    pub(crate) fn resp_pending_len(&self) -> usize {
        self.resp_pending.len()
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, timer: Timer) -> Option<Instant> {
        self.timers.get(timer)
    }
}
