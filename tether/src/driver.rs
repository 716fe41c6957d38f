use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, trace};

use proto::{Connection, Event, Io, PacketParser};

/// Work queued for the I/O thread by public entry points
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        host: String,
        port: u16,
        opts: Option<serde_json::Value>,
    },
    /// Items were queued; flush if the writer is idle
    Flush,
    Disconnect,
    Shutdown,
}

pub(crate) struct Driver {
    pub(crate) conn: Connection,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) events: mpsc::UnboundedSender<Event>,
}

/// I/O thread entry point: run the event loop to completion
pub(crate) fn run(runtime: Runtime, driver: Driver) {
    debug!("i/o thread started");
    runtime.block_on(drive(driver));
    debug!("i/o thread exiting");
}

type ConnectFuture = Pin<Box<dyn Future<Output = (u64, io::Result<TcpStream>)>>>;

const READ_CHUNK: usize = 16 * 1024;

/// The single-threaded event loop
///
/// Sole consumer of the command channel and sole owner of the connection
/// state machine, the socket, and the in-flight write buffers. Each turn
/// first drains the state machine's I/O directives and application events,
/// then waits on whichever of command arrival, connect completion, socket
/// readability, write progress, or the next timer deadline comes first.
async fn drive(driver: Driver) {
    let Driver {
        mut conn,
        mut commands,
        events,
    } = driver;

    let mut connecting: Option<ConnectFuture> = None;
    let mut reader: Option<OwnedReadHalf> = None;
    let mut writer: Option<OwnedWriteHalf> = None;
    let mut parser = PacketParser::new();
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
    let mut out: VecDeque<Bytes> = VecDeque::new();

    loop {
        while let Some(io) = conn.poll_io() {
            match io {
                Io::Connect {
                    host,
                    port,
                    attempt,
                } => {
                    // a fresh attempt supersedes whatever socket we had; a
                    // still-pending connect future is simply dropped
                    reader = None;
                    writer = None;
                    out.clear();
                    parser.reset();
                    connecting = Some(Box::pin(async move {
                        (attempt, TcpStream::connect((host.as_str(), port)).await)
                    }));
                }
                Io::Write(bufs) => out.extend(bufs),
                Io::Close => {
                    reader = None;
                    writer = None;
                    out.clear();
                    parser.reset();
                }
            }
        }
        while let Some(event) = conn.poll() {
            if events.send(event).is_err() {
                trace!("event receiver dropped");
            }
        }
        if conn.is_stopped() {
            break;
        }

        let deadline = conn.poll_timeout().map(TokioInstant::from_std);

        tokio::select! {
            cmd = commands.recv() => {
                let now = Instant::now();
                match cmd {
                    Some(Command::Connect { host, port, opts }) => conn.connect(host, port, opts, now),
                    Some(Command::Flush) => conn.request_flush(),
                    Some(Command::Disconnect) => conn.disconnect(),
                    // a dropped sender means the handle is gone; stop too
                    Some(Command::Shutdown) | None => conn.stop(),
                }
            }
            (attempt, result) = async { connecting.as_mut().expect("guarded by arm condition").as_mut().await },
                if connecting.is_some() =>
            {
                connecting = None;
                let now = Instant::now();
                match result {
                    Ok(stream) => {
                        if conn.handle_connect_result(attempt, Ok(()), now) {
                            if let Err(e) = stream.set_nodelay(true) {
                                trace!(error = %e, "failed to set TCP_NODELAY");
                            }
                            let (r, w) = stream.into_split();
                            reader = Some(r);
                            writer = Some(w);
                        }
                        // otherwise: superseded attempt, drop the stream
                    }
                    Err(e) => {
                        conn.handle_connect_result(attempt, Err(e.to_string()), now);
                    }
                }
            }
            result = async { reader.as_mut().expect("guarded by arm condition").read_buf(&mut read_buf).await },
                if reader.is_some() =>
            {
                let now = Instant::now();
                match result {
                    Ok(0) => conn.handle_io_error("connection closed by server".into(), now),
                    Ok(_) => {
                        parser.feed(&read_buf);
                        read_buf.clear();
                        loop {
                            match parser.next_packet() {
                                Ok(Some((ty, body))) => conn.handle_packet(ty, body, now),
                                Ok(None) => break,
                                Err(e) => {
                                    conn.handle_io_error(e.to_string(), now);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => conn.handle_io_error(e.to_string(), now),
                }
            }
            result = write_some(writer.as_mut(), &mut out), if writer.is_some() && !out.is_empty() => {
                match result {
                    Ok(true) => conn.handle_write_done(Ok(()), Instant::now()),
                    Ok(false) => {}
                    Err(e) => {
                        out.clear();
                        conn.handle_write_done(Err(e.to_string()), Instant::now());
                    }
                }
            }
            _ = async { sleep_until(deadline.expect("guarded by arm condition")).await },
                if deadline.is_some() =>
            {
                conn.handle_timeout(Instant::now());
            }
        }
    }

    while let Some(event) = conn.poll() {
        let _ = events.send(event);
    }
}

/// Push the front buffer toward the socket; `Ok(true)` once the batch is out
///
/// Progress survives cancellation: consumed bytes advance the `Bytes`
/// cursor, so re-entering resumes where the last poll left off.
async fn write_some(
    writer: Option<&mut OwnedWriteHalf>,
    out: &mut VecDeque<Bytes>,
) -> io::Result<bool> {
    let writer = writer.expect("guarded by arm condition");
    let front = out.front_mut().expect("guarded by arm condition");
    let n = writer.write_buf(front).await?;
    if n == 0 && front.has_remaining() {
        return Err(io::ErrorKind::WriteZero.into());
    }
    if !front.has_remaining() {
        out.pop_front();
    }
    Ok(out.is_empty())
}
