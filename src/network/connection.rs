//! A single live TCP connection.
//!
//! Each [`Connection`] splits its socket in two: the read half is driven by
//! the caller (typically a [`Handler`](crate::network::Handler) loop), while
//! the write half is owned by a dedicated task that drains a bounded outbound
//! queue in FIFO order. The write task is the sole writer to the socket, so
//! frames enqueued on one connection are never reordered.
//!
//! Overload policy is fail-fast: if the outbound queue is full when a frame
//! (or a close request) arrives, the connection is forcibly destroyed with
//! `SO_LINGER` zero and the socket closed at once, bypassing the queue,
//! instead of blocking the producer or letting the queue grow. A slow
//! consumer is disconnected, not accommodated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use crate::network::FrameCodec;

// Connection lifecycle is monotonic: open -> closing -> closed.
const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Command consumed by the write task.
///
/// A tagged command rather than a sentinel buffer, so that a legitimate
/// zero-length frame can never be mistaken for a shutdown request.
#[derive(Debug)]
enum WriteCommand {
    Data(Bytes),
    Close,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    // forced destroy requested; the write task applies SO_LINGER(0)
    abort: AtomicBool,
    // cancelled as soon as teardown is requested; unblocks reads
    shutdown: CancellationToken,
    // cancelled only once the write task has fully torn the socket down
    done: CancellationToken,
    // read half parked here so the write task can reunite and close the
    // socket outright on the forced-destroy path
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
}

/// One live socket with a serialized write path.
///
/// Created by [`TcpServer`](crate::network::TcpServer) when it admits a
/// socket, by [`TcpClient`](crate::network::TcpClient) when a dial succeeds,
/// or directly via [`Connection::new`] by embedders wrapping their own
/// streams. Must be created inside a tokio runtime, since construction spawns
/// the write task.
#[derive(Debug)]
pub struct Connection {
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<WriteCommand>,
    codec: FrameCodec,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(socket: TcpStream, config: &NetConfig) -> Connection {
        let local_addr = socket.local_addr().ok();
        let peer_addr = socket.peer_addr().ok();
        let (read_half, write_half) = socket.into_split();

        let (outbound, outbound_rx) = mpsc::channel(config.pending_write_capacity());
        let shared = Arc::new(Shared {
            state: AtomicU8::new(OPEN),
            abort: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            reader: tokio::sync::Mutex::new(Some(read_half)),
        });

        tokio::spawn(write_loop(write_half, outbound_rx, shared.clone()));

        Connection {
            local_addr,
            peer_addr,
            outbound,
            codec: config.codec(),
            shared,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Reads raw bytes from the socket, bypassing the codec.
    ///
    /// Blocks until data arrives, the peer closes, an error occurs, or this
    /// connection is closed.
    pub async fn read(&self, buf: &mut [u8]) -> NetResult<usize> {
        tokio::select! {
            res = async {
                let mut reader = self.shared.reader.lock().await;
                match reader.as_mut() {
                    Some(reader) => reader.read(buf).await.map_err(NetError::from),
                    None => Err(NetError::ConnectionClosed),
                }
            } => res,
            _ = self.shared.shutdown.cancelled() => Err(NetError::ConnectionClosed),
        }
    }

    /// Reads one length-prefixed frame and returns its payload.
    ///
    /// The codec consumes bytes from the shared stream position, so only one
    /// logical reader may call this at a time; concurrent callers serialize on
    /// an internal lock and will observe interleaved frames.
    pub async fn read_frame(&self) -> NetResult<Bytes> {
        tokio::select! {
            res = async {
                let mut reader = self.shared.reader.lock().await;
                match reader.as_mut() {
                    Some(reader) => self.codec.decode(reader).await,
                    None => Err(NetError::ConnectionClosed),
                }
            } => res,
            _ = self.shared.shutdown.cancelled() => Err(NetError::ConnectionClosed),
        }
    }

    /// Encodes the fragments into one frame and enqueues it for writing.
    ///
    /// Never blocks on socket I/O. Encoding failures (frame too long) are
    /// returned and leave the connection usable. After close the frame is
    /// silently dropped. If the outbound queue is at capacity the connection
    /// is forcibly destroyed; overload is observable only as the connection
    /// closing, never as an error value.
    pub fn write_frame(&self, fragments: &[&[u8]]) -> NetResult<()> {
        let frame = self.codec.encode(fragments)?;

        if self.shared.state.load(Ordering::Acquire) != OPEN {
            return Ok(());
        }

        match self.outbound.try_send(WriteCommand::Data(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(peer = ?self.peer_addr, "outbound queue full, destroying connection");
                self.destroy();
                Ok(())
            }
            // write task already exited
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Requests shutdown of this connection. Idempotent and non-blocking.
    ///
    /// The write task drains frames already queued ahead of the close request,
    /// then flushes and closes the socket. If the queue happens to be full the
    /// connection is forcibly destroyed instead.
    pub fn close(&self) {
        if self
            .shared
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match self.outbound.try_send(WriteCommand::Close) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = ?self.peer_addr, "close with full outbound queue, destroying connection");
                self.destroy();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Whether close has been requested or completed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != OPEN
    }

    /// Resolves once the write task has exited and the socket is torn down.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }

    // Abrupt teardown: reset instead of graceful FIN/drain, bypassing the
    // queue entirely. Cancelling the shutdown token wakes the write task even
    // mid-write; it then closes the socket with linger zero. Safe to reach
    // from any state at or past OPEN.
    fn destroy(&self) {
        self.shared.abort.store(true, Ordering::Release);
        self.shared.state.fetch_max(CLOSING, Ordering::AcqRel);
        self.shared.shutdown.cancel();
    }
}

/// Drains the outbound queue to the socket, one frame at a time, in order.
///
/// Exits on the first write error, on a close command, when every sender is
/// dropped, or when the connection is force-destroyed. Cancellation is
/// checked ahead of the queue and races every in-flight write, so a forced
/// destroy stops transmission immediately rather than after the queue
/// drains. In every case the task ends with the socket torn down and the
/// connection marked closed.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<WriteCommand>,
    shared: Arc<Shared>,
) {
    let aborted = loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => {
                break shared.abort.load(Ordering::Acquire);
            }
            cmd = outbound.recv() => match cmd {
                Some(WriteCommand::Data(frame)) => {
                    let result = tokio::select! {
                        biased;
                        _ = shared.shutdown.cancelled() => {
                            break shared.abort.load(Ordering::Acquire);
                        }
                        res = writer.write_all(&frame) => res,
                    };
                    if let Err(err) = result {
                        debug!("connection write error: {}", err);
                        break false;
                    }
                }
                Some(WriteCommand::Close) | None => break false,
            }
        }
    };

    if aborted {
        // Reset rather than drain: linger zero, then close the socket
        // outright by reuniting the halves. Any blocked reader was already
        // unblocked when the shutdown token was cancelled, so the read half
        // is reclaimable here.
        let _ = writer.as_ref().set_linger(Some(Duration::ZERO));
        let read_half = shared.reader.lock().await.take();
        if let Some(read_half) = read_half {
            if let Ok(stream) = read_half.reunite(writer) {
                drop(stream);
            }
        }
    } else {
        let _ = writer.shutdown().await;
    }

    shared.state.store(CLOSED, Ordering::Release);
    shared.shutdown.cancel();
    shared.done.cancel();
}
