//! Deterministic scenario tests
//!
//! A `TestTransport` owns a `Connection` and a fake clock; sockets, writes
//! and the passage of time are scripted, so every state transition is exact.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;

use crate::coding::BufMutExt;
use crate::connection::{Connection, DisconnectReason, Event, Io, RequestError};
use crate::message::DefaultCodec;
use crate::packet::{PacketParser, PacketType};
use crate::routes::{RouteDictionary, Storage};
use crate::shared::{ConnectionState, SendError, Shared};
use crate::timer::Timer;
use crate::TransportConfig;

struct TestTransport {
    conn: Connection,
    shared: Arc<Shared>,
    now: Instant,
}

impl TestTransport {
    fn new(config: TransportConfig) -> Self {
        Self::with_storage(config, None)
    }

    fn with_storage(config: TransportConfig, storage: Option<Box<dyn Storage>>) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(Shared::new(
            &config,
            Box::new(DefaultCodec),
            RouteDictionary::default(),
        ));
        let now = Instant::now();
        let conn = Connection::new(config, shared.clone(), storage, now);
        Self { conn, shared, now }
    }

    /// Move the clock forward, firing every timer that comes due
    fn advance(&mut self, by: Duration) {
        self.now += by;
        while matches!(self.conn.poll_timeout(), Some(t) if t <= self.now) {
            self.conn.handle_timeout(self.now);
        }
    }

    fn events(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.conn.poll()).collect()
    }

    fn io(&mut self) -> Vec<Io> {
        std::iter::from_fn(|| self.conn.poll_io()).collect()
    }

    fn feed(&mut self, ty: PacketType, body: &[u8]) {
        self.conn
            .handle_packet(ty, Bytes::copy_from_slice(body), self.now);
    }

    fn connect(&mut self) {
        self.conn
            .connect("example.test".into(), 3250, None, self.now);
    }

    /// Complete the TCP connect for the most recent `Io::Connect`
    fn establish_tcp(&mut self) {
        let attempt = self
            .io()
            .iter()
            .rev()
            .find_map(|io| match io {
                Io::Connect { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .expect("a connect directive");
        assert!(self.conn.handle_connect_result(attempt, Ok(()), self.now));
    }

    fn complete_write(&mut self) {
        self.conn.handle_write_done(Ok(()), self.now);
    }

    fn handshake_ok(&mut self, heartbeat_secs: u64) {
        let body =
            serde_json::to_vec(&json!({"code": 200, "sys": {"heartbeat": heartbeat_secs, "serializer": "json"}}))
                .unwrap();
        self.feed(PacketType::Handshake, &body);
    }

    /// Connect, finish TCP and the handshake with the given heartbeat
    fn establish(&mut self, heartbeat_secs: u64) {
        self.connect();
        self.establish_tcp();
        self.io(); // handshake packet write
        self.complete_write();
        self.handshake_ok(heartbeat_secs);
        self.io(); // handshake ack write
        self.complete_write();
        assert_eq!(self.conn.state(), ConnectionState::Done);
        self.events();
    }

    fn send_request(&mut self, route: &str, req_id: u32, timeout: Option<Duration>) {
        self.shared
            .send(route, req_id, b"{}", Some(req_id), timeout, self.now)
            .unwrap();
        self.conn.request_flush();
    }

    /// Decode one batch of written buffers back into packets
    fn written_packets(bufs: &[Bytes]) -> Vec<(PacketType, Bytes)> {
        let mut parser = PacketParser::new();
        for buf in bufs {
            parser.feed(buf);
        }
        std::iter::from_fn(|| parser.next_packet().unwrap()).collect()
    }
}

fn response_body(req_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![2u8 << 1];
    body.put_var(u64::from(req_id));
    body.extend_from_slice(payload);
    body
}

#[derive(Clone, Default)]
struct MemStorage {
    cell: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Storage for MemStorage {
    fn read(&self) -> Option<Vec<u8>> {
        self.cell.lock().unwrap().clone()
    }

    fn write(&self, data: &[u8]) {
        *self.cell.lock().unwrap() = Some(data.to_vec());
    }
}

#[test]
fn connect_then_handshake_reaches_done() {
    let mut t = TestTransport::new(TransportConfig::default());
    assert_eq!(t.conn.state(), ConnectionState::NotConnected);

    t.connect();
    assert_eq!(t.conn.state(), ConnectionState::Connecting);
    assert_eq!(t.shared.state(), ConnectionState::Connecting);

    t.establish_tcp();
    assert_eq!(t.conn.state(), ConnectionState::Handshaking);
    let ios = t.io();
    let Some(Io::Write(bufs)) = ios.first() else {
        panic!("handshake should be written, got {ios:?}");
    };
    let packets = TestTransport::written_packets(bufs);
    assert_eq!(packets[0].0, PacketType::Handshake);
    t.complete_write();

    t.handshake_ok(5);
    assert_eq!(t.conn.state(), ConnectionState::Done);
    assert_eq!(t.conn.reconnect_attempts(), 0);
    assert_eq!(t.shared.serializer().as_deref(), Some("json"));
    assert!(t.conn.timer_deadline(Timer::Heartbeat).is_some());
    assert!(t.events().iter().any(|e| matches!(e, Event::Connected)));
}

#[test]
fn pre_connect_sends_flush_in_order_after_done() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.connect();
    for req_id in 1..=3 {
        t.send_request("gate.join", req_id, None);
    }
    t.establish_tcp();
    t.io();
    t.complete_write();
    t.handshake_ok(0);

    let ios = t.io();
    let Some(Io::Write(bufs)) = ios.first() else {
        panic!("queued items should flush at DONE, got {ios:?}");
    };
    let packets = TestTransport::written_packets(bufs);
    assert_eq!(packets[0].0, PacketType::HandshakeAck);
    let ids: Vec<u8> = packets[1..]
        .iter()
        .map(|(ty, body)| {
            assert_eq!(*ty, PacketType::Data);
            body[1] // varint request id, single byte for small ids
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn connect_timeout_schedules_reconnect() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.connect();
    t.advance(Duration::from_secs(30));
    assert_eq!(t.conn.state(), ConnectionState::NotConnected);
    assert_eq!(t.conn.reconnect_attempts(), 1);
    assert!(t.conn.timer_deadline(Timer::Reconnect).is_some());
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::Disconnected {
            reason: DisconnectReason::ConnectTimeout
        }
    )));
}

#[test]
fn handshake_timeout_drops_connection() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.connect();
    t.establish_tcp();
    t.io();
    t.complete_write();
    t.advance(Duration::from_secs(10));
    assert_eq!(t.conn.state(), ConnectionState::NotConnected);
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::Disconnected {
            reason: DisconnectReason::HandshakeTimeout
        }
    )));
    // the socket from the failed attempt is released
    assert!(t.io().iter().any(|io| matches!(io, Io::Close)));
}

#[test]
fn handshake_rejection_reconnects() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.connect();
    t.establish_tcp();
    t.io();
    t.complete_write();
    t.feed(PacketType::Handshake, br#"{"code":501}"#);
    assert_eq!(t.conn.state(), ConnectionState::NotConnected);
    assert!(t.conn.timer_deadline(Timer::Reconnect).is_some());
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::Disconnected {
            reason: DisconnectReason::HandshakeRejected(501)
        }
    )));
}

#[test]
fn liveness_timeout_fails_pending_requests() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(1);
    t.send_request("a.b", 1, None);
    t.io();
    t.complete_write();
    assert_eq!(t.conn.resp_pending_len(), 1);

    // one interval: probe goes out; two: silence exceeds the 2x window
    t.advance(Duration::from_secs(1));
    t.io();
    t.complete_write();
    t.advance(Duration::from_secs(1));

    assert_eq!(t.conn.state(), ConnectionState::NotConnected);
    assert_eq!(t.conn.resp_pending_len(), 0);
    assert!(t.conn.timer_deadline(Timer::Reconnect).is_some());
    let events = t.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RequestFailed {
            req_id: 1,
            error: RequestError::Timeout
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Disconnected {
            reason: DisconnectReason::HeartbeatTimeout
        }
    )));
}

#[test]
fn heartbeat_rtt_sample() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(1);
    assert_eq!(t.shared.rtt(), None);

    t.advance(Duration::from_secs(1));
    let ios = t.io();
    let Some(Io::Write(bufs)) = ios.first() else {
        panic!("heartbeat probe should be written, got {ios:?}");
    };
    assert_eq!(
        TestTransport::written_packets(bufs)[0].0,
        PacketType::Heartbeat
    );
    t.complete_write();

    t.now += Duration::from_millis(200);
    t.feed(PacketType::Heartbeat, &[]);
    assert_eq!(t.shared.rtt(), Some(Duration::from_millis(200)));
}

#[test]
fn response_releases_item_and_pool_slot() {
    let mut config = TransportConfig::default();
    config.pool_slots(1);
    let mut t = TestTransport::new(config);
    t.establish(0);

    t.send_request("a.b", 7, None);
    t.io();
    t.complete_write();
    assert_eq!(t.conn.resp_pending_len(), 1);
    assert_eq!(t.shared.lock_queues("test").live_items(), 1);

    t.feed(PacketType::Data, &response_body(7, b"ok"));
    assert_eq!(t.conn.resp_pending_len(), 0);
    assert_eq!(t.shared.lock_queues("test").live_items(), 0);
    let events = t.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Response { req_id: 7, payload } if &payload[..] == b"ok"
    )));
}

#[test]
fn request_timeout_scan() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(0);
    t.send_request("a.b", 3, Some(Duration::from_millis(500)));
    t.io();
    t.complete_write();
    assert!(t.conn.timer_deadline(Timer::CheckTimeout).is_some());

    t.advance(Duration::from_secs(1));
    assert_eq!(t.conn.resp_pending_len(), 0);
    assert!(t.conn.timer_deadline(Timer::CheckTimeout).is_none());
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::RequestFailed {
            req_id: 3,
            error: RequestError::Timeout
        }
    )));
    // connection itself is unaffected
    assert_eq!(t.conn.state(), ConnectionState::Done);
}

#[test]
fn reconnect_backoff_doubles_until_give_up() {
    let mut config = TransportConfig::default();
    config.reconnect_max_attempts(Some(2));
    let mut t = TestTransport::new(config);
    t.connect();

    let mut attempt = match t.io().first() {
        Some(Io::Connect { attempt, .. }) => *attempt,
        other => panic!("expected connect, got {other:?}"),
    };

    // first failure: 2s delay; second: 4s
    for expected_delay in [2u64, 4] {
        t.conn
            .handle_connect_result(attempt, Err("refused".into()), t.now);
        let deadline = t.conn.timer_deadline(Timer::Reconnect).expect("reconnect armed");
        assert_eq!(deadline - t.now, Duration::from_secs(expected_delay));
        t.advance(Duration::from_secs(expected_delay));
        attempt = match t.io().first() {
            Some(Io::Connect { attempt, .. }) => *attempt,
            other => panic!("expected reconnect, got {other:?}"),
        };
    }

    // third failure exceeds the budget
    t.conn
        .handle_connect_result(attempt, Err("refused".into()), t.now);
    assert!(t.conn.timer_deadline(Timer::Reconnect).is_none());
    assert!(t
        .events()
        .iter()
        .any(|e| matches!(e, Event::ReconnectFailed { attempts: 3 })));

    // a fresh connect starts with a clean counter
    t.connect();
    assert_eq!(t.conn.reconnect_attempts(), 0);
    assert_eq!(t.conn.state(), ConnectionState::Connecting);
}

#[test]
fn counter_resets_on_done() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.connect();
    let attempt = t.conn.current_attempt();
    t.conn
        .handle_connect_result(attempt, Err("refused".into()), t.now);
    assert_eq!(t.conn.reconnect_attempts(), 1);

    t.advance(Duration::from_secs(2));
    t.establish_tcp();
    t.io();
    t.complete_write();
    t.handshake_ok(0);
    assert_eq!(t.conn.state(), ConnectionState::Done);
    assert_eq!(t.conn.reconnect_attempts(), 0);
}

#[test]
fn explicit_disconnect_fails_items_without_reconnect() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(0);
    t.send_request("a.b", 11, None);
    t.io();
    t.complete_write();

    t.conn.disconnect();
    assert_eq!(t.conn.state(), ConnectionState::NotConnected);
    assert!(t.conn.timer_deadline(Timer::Reconnect).is_none());
    let events = t.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RequestFailed {
            req_id: 11,
            error: RequestError::Disconnected
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Disconnected {
            reason: DisconnectReason::Requested
        }
    )));
    assert!(t.io().iter().any(|io| matches!(io, Io::Close)));
    assert_eq!(t.shared.lock_queues("test").live_items(), 0);
}

#[test]
fn kick_is_terminal_for_the_session() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(0);
    t.feed(PacketType::Kick, &[]);
    assert_eq!(t.conn.state(), ConnectionState::NotConnected);
    assert!(t.conn.timer_deadline(Timer::Reconnect).is_none());
    let events = t.events();
    assert!(events.iter().any(|e| matches!(e, Event::Kicked)));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Disconnected {
            reason: DisconnectReason::Kick
        }
    )));
}

#[test]
fn connect_supersedes_pending_attempt() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.connect();
    let first = t.conn.current_attempt();
    t.connect();
    let second = t.conn.current_attempt();
    assert_ne!(first, second);

    // the stale socket must be rejected, the current one accepted
    assert!(!t.conn.handle_connect_result(first, Ok(()), t.now));
    assert!(t.conn.handle_connect_result(second, Ok(()), t.now));
    assert_eq!(t.conn.state(), ConnectionState::Handshaking);
}

#[test]
fn retry_budget_preserves_requests_across_one_reconnect() {
    let mut config = TransportConfig::default();
    config.send_retry_limit(1);
    let mut t = TestTransport::new(config);
    t.establish(1);
    t.send_request("a.b", 5, None);
    t.io();
    t.complete_write();

    // silence kills the connection; the request is preserved, not failed
    t.advance(Duration::from_secs(2));
    assert!(!t
        .events()
        .iter()
        .any(|e| matches!(e, Event::RequestFailed { .. })));
    assert_eq!(t.shared.lock_queues("test").live_items(), 1);

    // reconnect and complete a fresh handshake: the item is replayed
    t.advance(Duration::from_secs(2));
    t.establish_tcp();
    t.io();
    t.complete_write();
    t.handshake_ok(1);
    let ios = t.io();
    let Some(Io::Write(bufs)) = ios.first() else {
        panic!("replayed item should flush, got {ios:?}");
    };
    let packets = TestTransport::written_packets(bufs);
    assert!(packets
        .iter()
        .any(|(ty, body)| *ty == PacketType::Data && body[1] == 5));
    t.complete_write();
    t.events();

    // a second loss exhausts the budget
    t.advance(Duration::from_secs(2));
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::RequestFailed {
            req_id: 5,
            error: RequestError::Timeout
        }
    )));
    assert_eq!(t.shared.lock_queues("test").live_items(), 0);
}

#[test]
fn dict_update_persists_and_compresses_routes() {
    let storage = MemStorage::default();
    let mut t = TestTransport::with_storage(
        TransportConfig::default(),
        Some(Box::new(storage.clone())),
    );
    t.connect();
    t.establish_tcp();
    t.io();
    t.complete_write();
    let body = serde_json::to_vec(
        &json!({"code": 200, "sys": {"heartbeat": 0, "dict": {"chat.msg": 1}}}),
    )
    .unwrap();
    t.feed(PacketType::Handshake, &body);
    assert_eq!(t.conn.state(), ConnectionState::Done);
    t.io();
    t.complete_write();
    t.events();

    // write-back happened and survives a reload
    let persisted = storage.read().expect("dictionary persisted");
    let reloaded = RouteDictionary::load(&persisted);
    assert_eq!(reloaded.code_for("chat.msg"), Some(1));

    // outbound routes now travel as codes
    t.send_request("chat.msg", 1, None);
    let ios = t.io();
    let Some(Io::Write(bufs)) = ios.first() else {
        panic!("send should flush, got {ios:?}");
    };
    let packets = TestTransport::written_packets(bufs);
    let (_, data) = &packets[0];
    assert_eq!(data[0] & 0x01, 0x01, "route-compressed flag set");

    // inbound pushes resolve codes back to names
    t.complete_write();
    t.feed(PacketType::Data, &[(3 << 1) | 1, 0, 1, b'!']);
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::Push { route, payload } if route == "chat.msg" && &payload[..] == b"!"
    )));
}

#[test]
fn stop_closes_everything() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(0);
    t.send_request("a.b", 9, None);
    t.conn.stop();
    assert!(t.conn.is_stopped());
    assert_eq!(t.shared.state(), ConnectionState::Closed);
    assert_eq!(t.shared.lock_queues("test").live_items(), 0);
    assert_eq!(
        t.shared
            .send("a.b", 1, b"{}", None, None, t.now)
            .unwrap_err(),
        SendError::InvalidState
    );
    assert!(t.events().iter().any(|e| matches!(
        e,
        Event::RequestFailed {
            req_id: 9,
            error: RequestError::Disconnected
        }
    )));
}

#[test]
fn notify_lifecycle() {
    let mut t = TestTransport::new(TransportConfig::default());
    t.establish(0);
    t.shared
        .send("chat.say", 21, b"hi", None, None, t.now)
        .unwrap();
    t.conn.request_flush();
    t.io();
    t.complete_write();
    // released at write completion, no response tracking
    assert_eq!(t.conn.resp_pending_len(), 0);
    assert_eq!(t.shared.lock_queues("test").live_items(), 0);
    assert!(t
        .events()
        .iter()
        .any(|e| matches!(e, Event::NotifySent { seq: 21 })));
}
