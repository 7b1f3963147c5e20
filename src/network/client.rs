//! TCP client lifecycle: dial, retry, reconnect, shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{NetConfig, NetOptions};
use crate::error::NetResult;
use crate::network::{Connection, Handler, HandlerFactory};

/// A dialing TCP client that hands its connection to a [`Handler`].
///
/// Maintains at most one live connection and at most one dial attempt in
/// flight. Failed dials are retried on the configured interval; if
/// auto-reconnect is enabled the dial loop starts over after the handler
/// finishes, otherwise the client stops.
#[derive(Debug)]
pub struct TcpClient<F: HandlerFactory> {
    config: NetConfig,
    factory: Arc<F>,
    closed: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<Arc<Connection>>>>,
    shutdown: CancellationToken,
    dial_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: HandlerFactory> TcpClient<F> {
    pub fn new(options: NetOptions, factory: F) -> NetResult<TcpClient<F>> {
        let config = options.validate()?;
        Ok(TcpClient {
            config,
            factory: Arc::new(factory),
            closed: Arc::new(AtomicBool::new(false)),
            conn: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            dial_handle: Mutex::new(None),
        })
    }

    /// Starts the dial loop as an independent task and returns immediately.
    ///
    /// Calling `start` more than once is a no-op.
    pub fn start(&self) {
        let mut handle = self.dial_handle.lock();
        if handle.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let dialer = Dialer {
            config: self.config.clone(),
            factory: self.factory.clone(),
            closed: self.closed.clone(),
            conn: self.conn.clone(),
            shutdown: self.shutdown.clone(),
        };
        *handle = Some(tokio::spawn(dialer.run()));
    }

    /// Whether the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the client down. Idempotent; never fails.
    ///
    /// Marks the client closed, closes the active connection (unblocking a
    /// blocked read or dial sleep) and waits for the dial task to finish,
    /// including the handler's `on_close`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();

        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close();
        }

        let handle = self.dial_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("tcp client closed");
    }
}

/// Dial loop states. The sequence dial/connect/run/reconnect is an explicit
/// state machine so each transition is testable in isolation.
enum DialState {
    Connecting,
    Connected(TcpStream),
    Closed,
}

struct Dialer<F: HandlerFactory> {
    config: NetConfig,
    factory: Arc<F>,
    closed: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<Arc<Connection>>>>,
    shutdown: CancellationToken,
}

impl<F: HandlerFactory> Dialer<F> {
    async fn run(self) {
        let mut state = DialState::Connecting;
        loop {
            state = match state {
                DialState::Connecting => self.connect().await,
                DialState::Connected(socket) => self.serve(socket).await,
                DialState::Closed => break,
            };
        }
        debug!("dial loop exited");
    }

    async fn connect(&self) -> DialState {
        if self.closed.load(Ordering::Acquire) {
            return DialState::Closed;
        }

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return DialState::Closed,
            res = TcpStream::connect(self.config.remote_addr()) => res,
        };

        match result {
            Ok(socket) => DialState::Connected(socket),
            Err(err) => {
                error!(
                    "connect to {} error: {}",
                    self.config.remote_addr(),
                    err
                );
                self.sleep_or_closed().await
            }
        }
    }

    async fn serve(&self, socket: TcpStream) -> DialState {
        // closed while the dial was in flight
        if self.closed.load(Ordering::Acquire) {
            drop(socket);
            return DialState::Closed;
        }

        let conn = Arc::new(Connection::new(socket, &self.config));
        *self.conn.lock() = Some(conn.clone());

        // close() may have run between the check above and the store; it then
        // found the slot empty, so close the connection on its behalf here
        if self.closed.load(Ordering::Acquire) {
            conn.close();
        }

        let mut handler = self.factory.create();
        handler.run(conn.clone()).await;

        conn.close();
        self.conn.lock().take();
        handler.on_close().await;

        if self.config.auto_reconnect() && !self.closed.load(Ordering::Acquire) {
            self.sleep_or_closed().await
        } else {
            DialState::Closed
        }
    }

    /// Waits out the reconnect interval; shutting down cuts the wait short.
    async fn sleep_or_closed(&self) -> DialState {
        tokio::select! {
            _ = self.shutdown.cancelled() => DialState::Closed,
            _ = time::sleep(self.config.reconnect_interval()) => DialState::Connecting,
        }
    }
}
