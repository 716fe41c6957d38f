use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use proto::{
    Connection, ConnectionState, DefaultCodec, Event, MessageCodec, RouteDictionary, SendError,
    Shared, Storage, TransportConfig,
};

use crate::driver::{self, Command, Driver};

/// Everything a transport is built from
///
/// The codec and storage hooks replace the original plugin-global
/// configuration: they are fixed per instance, not process-wide.
pub struct TransportOptions {
    pub config: TransportConfig,
    /// Message body codec, invoked on calling threads (encode) and the I/O
    /// thread (decode)
    pub codec: Box<dyn MessageCodec>,
    /// Persisted storage for the route dictionary; `None` disables both the
    /// initial load and the handshake write-back
    pub storage: Option<Box<dyn Storage>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            config: TransportConfig::default(),
            codec: Box::new(DefaultCodec),
            storage: None,
        }
    }
}

/// Errors from constructing a transport
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create the event loop")]
    Reactor(#[source] std::io::Error),
    #[error("failed to spawn the i/o thread")]
    Thread(#[source] std::io::Error),
}

/// Errors from `connect`
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The handshake options string was non-empty but not valid JSON
    #[error("handshake options are not valid JSON")]
    InvalidJson(#[source] serde_json::Error),
    /// The transport was already shut down
    #[error("transport was shut down")]
    Closed,
}

/// Errors from `shutdown`
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Joining the I/O thread from itself would deadlock
    #[error("cannot shut down from the transport's own i/o thread")]
    InvalidThread,
    #[error("the i/o thread panicked")]
    WorkerPanicked,
}

/// One logical client connection and the I/O thread driving it
///
/// Entry points may be called from any thread, concurrently; none of them
/// block on network I/O. Each validates and queues under the appropriate
/// lock, signals the I/O thread over the command channel, and returns.
/// Application-visible outcomes arrive on the [`Event`] receiver handed out
/// by [`Transport::new`].
#[derive(Debug)]
pub struct Transport {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
}

impl Transport {
    /// Allocate resources and start the I/O thread
    ///
    /// Fails if the event loop or the thread cannot be created. The route
    /// dictionary is loaded from `storage` here, best-effort.
    pub fn new(
        options: TransportOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>), InitError> {
        let TransportOptions {
            config,
            codec,
            storage,
        } = options;

        let dict = storage
            .as_ref()
            .and_then(|s| s.read())
            .map(|blob| RouteDictionary::load(&blob))
            .unwrap_or_default();

        let config = Arc::new(config);
        let shared = Arc::new(Shared::new(&config, codec, dict));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(InitError::Reactor)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(config, shared.clone(), storage, Instant::now());

        let worker = thread::Builder::new()
            .name("tether-io".into())
            .spawn(move || {
                driver::run(
                    runtime,
                    Driver {
                        conn,
                        commands: cmd_rx,
                        events: event_tx,
                    },
                )
            })
            .map_err(InitError::Thread)?;
        let worker_thread = worker.thread().id();
        debug!(?worker_thread, "transport initialized");

        Ok((
            Self {
                shared,
                commands: cmd_tx,
                worker: Mutex::new(Some(worker)),
                worker_thread,
            },
            event_rx,
        ))
    }

    /// Connect to `host:port`, optionally with a JSON handshake options string
    ///
    /// Always accepted once the options parse; a connect while another
    /// connection is active replaces it. Malformed non-empty options are
    /// rejected here, before anything is queued.
    pub fn connect(&self, host: &str, port: u16, opts: Option<&str>) -> Result<(), ConnectError> {
        let opts = match opts {
            Some(raw) if !raw.trim().is_empty() => {
                Some(serde_json::from_str(raw).map_err(ConnectError::InvalidJson)?)
            }
            _ => None,
        };
        self.commands
            .send(Command::Connect {
                host: host.to_owned(),
                port,
                opts,
            })
            .map_err(|_| ConnectError::Closed)
    }

    /// Queue one message for transmission
    ///
    /// A `req_id` of `None` marks a notification: no response is expected
    /// and completion is reported as [`Event::NotifySent`]. Requests resolve
    /// to [`Event::Response`] or [`Event::RequestFailed`], the latter after
    /// `timeout` if the server stays silent. Encodes on the calling thread;
    /// fails without queuing anything if the transport has never been told
    /// to connect or if encoding rejects the input.
    pub fn send(
        &self,
        route: &str,
        seq: u32,
        payload: &[u8],
        req_id: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<(), SendError> {
        self.shared
            .send(route, seq, payload, req_id, timeout, Instant::now())?;
        let _ = self.commands.send(Command::Flush);
        Ok(())
    }

    /// Drop the connection without reconnecting; asynchronous, never fails
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Stop the I/O thread and block until it has exited
    ///
    /// The one blocking entry point. Safe to call more than once; fails only
    /// when invoked from the I/O thread itself, without attempting the join.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown_from(thread::current().id())
    }

    pub(crate) fn shutdown_from(&self, caller: ThreadId) -> Result<(), ShutdownError> {
        if caller == self.worker_thread {
            return Err(ShutdownError::InvalidThread);
        }
        let Some(worker) = self.worker.lock().unwrap().take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Shutdown);
        worker.join().map_err(|_| ShutdownError::WorkerPanicked)
    }

    /// Connection lifecycle snapshot
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Heartbeat round-trip estimate, as a connection-quality signal
    ///
    /// `None` until the first heartbeat acknowledgment arrives.
    pub fn rtt(&self) -> Option<Duration> {
        self.shared.rtt()
    }

    /// Serializer name negotiated by the last handshake
    pub fn serializer(&self) -> Option<String> {
        self.shared.serializer()
    }

    #[cfg(test)]
    pub(crate) fn worker_thread(&self) -> ThreadId {
        self.worker_thread
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
