//! TCP server lifecycle: listen, accept, admit, shut down.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{NetConfig, NetOptions};
use crate::error::{NetError, NetResult};
use crate::network::{Connection, Handler, HandlerFactory};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type ConnMap = Arc<Mutex<HashMap<u64, Arc<Connection>>>>;

/// A listening TCP server that hands every admitted connection to a
/// [`Handler`].
///
/// Lifecycle: `bind` -> [`start`](TcpServer::start) -> [`close`](TcpServer::close).
/// The accept loop runs as an independent task; each admitted connection gets
/// its own handling task. The live-connection count never exceeds the
/// configured maximum: sockets accepted past the cap are closed immediately
/// without ever seeing a handler.
#[derive(Debug)]
pub struct TcpServer<F: HandlerFactory> {
    config: NetConfig,
    factory: Arc<F>,
    local_addr: SocketAddr,
    conns: ConnMap,
    listener: Mutex<Option<TcpListener>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    // Completion tracking for handling tasks: every task holds a sender
    // clone; close() drops ours and drains the receiver until all are gone.
    conn_done_tx: Mutex<Option<mpsc::Sender<()>>>,
    conn_done_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl<F: HandlerFactory> TcpServer<F> {
    /// Validates the options and binds the listener.
    ///
    /// A bind failure is returned to the caller, who decides whether to retry
    /// or abort; nothing here terminates the process.
    pub async fn bind(options: NetOptions, factory: F) -> NetResult<TcpServer<F>> {
        let config = options.validate()?;
        if config.max_connections() == 0 {
            return Err(NetError::InvalidMaxConnections(0));
        }

        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        let (conn_done_tx, conn_done_rx) = mpsc::channel(1);

        Ok(TcpServer {
            config,
            factory: Arc::new(factory),
            local_addr,
            conns: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(Some(listener)),
            accept_handle: Mutex::new(None),
            shutdown: CancellationToken::new(),
            conn_done_tx: Mutex::new(Some(conn_done_tx)),
            conn_done_rx: Mutex::new(Some(conn_done_rx)),
        })
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Starts the accept loop as an independent task and returns immediately.
    ///
    /// Calling `start` more than once is a no-op.
    pub fn start(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let Some(conn_done_tx) = self.conn_done_tx.lock().clone() else {
            return;
        };

        let acceptor = Acceptor {
            listener,
            config: self.config.clone(),
            factory: self.factory.clone(),
            conns: self.conns.clone(),
            shutdown: self.shutdown.clone(),
            conn_done_tx,
        };
        *self.accept_handle.lock() = Some(tokio::spawn(acceptor.run()));
    }

    /// Gracefully shuts the server down. Idempotent; never fails.
    ///
    /// Stops the listener, waits for the accept loop to finish, force-closes
    /// every connection still live, and only returns once every handling task
    /// has finished, including having run its `on_close` callback. After
    /// `close` returns the live-connection set is empty.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let handle = self.accept_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // close was called before start: release the listener too
        drop(self.listener.lock().take());

        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.conns.lock();
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close();
        }

        drop(self.conn_done_tx.lock().take());
        let rx = self.conn_done_rx.lock().take();
        if let Some(mut rx) = rx {
            while rx.recv().await.is_some() {}
        }
        debug!("tcp server closed");
    }
}

/// The accept loop, holding everything it needs once `start` moves the
/// listener into it.
struct Acceptor<F: HandlerFactory> {
    listener: TcpListener,
    config: NetConfig,
    factory: Arc<F>,
    conns: ConnMap,
    shutdown: CancellationToken,
    conn_done_tx: mpsc::Sender<()>,
}

impl<F: HandlerFactory> Acceptor<F> {
    async fn run(self) {
        let mut delay = Duration::ZERO;

        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.listener.accept() => res,
            };

            match result {
                Ok((socket, addr)) => {
                    delay = Duration::ZERO;
                    debug!(%addr, "accepted connection");
                    self.admit(socket);
                }
                Err(err) if is_transient(&err) => {
                    delay = next_backoff(delay);
                    error!("accept error: {}; retrying in {:?}", err, delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    error!("accept error: {}; stopping accept loop", err);
                    break;
                }
            }
        }
        debug!("accept loop exited");
    }

    /// Admission control plus handling-task spawn.
    ///
    /// Only the accept loop inserts into the live map, so checking the cap and
    /// inserting in two short critical sections cannot overshoot it; removals
    /// in between only make room.
    fn admit(&self, socket: TcpStream) {
        if self.conns.lock().len() >= self.config.max_connections() {
            debug!("too many connections");
            return;
        }

        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(socket, &self.config));
        self.conns.lock().insert(conn_id, conn.clone());

        let mut handler = self.factory.create();
        let conns = self.conns.clone();
        let conn_done_tx = self.conn_done_tx.clone();
        tokio::spawn(async move {
            handler.run(conn.clone()).await;

            // Cleanup ordering matters: transport close before map removal
            // before user notification, so admission accounting never lags
            // behind actual socket teardown.
            conn.close();
            conns.lock().remove(&conn_id);
            handler.on_close().await;

            drop(conn_done_tx);
        });
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

// 5ms on the first consecutive failure, doubling, capped at 1s.
fn next_backoff(delay: Duration) -> Duration {
    if delay.is_zero() {
        Duration::from_millis(5)
    } else {
        (delay * 2).min(Duration::from_secs(1))
    }
}
