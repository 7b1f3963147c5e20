//! The seam between the connection engine and application logic.

use std::future::Future;
use std::sync::Arc;

use crate::network::Connection;

/// Per-connection business logic supplied by the embedding application.
///
/// One handler instance is created for each admitted or dialed connection.
/// `run` is invoked exactly once and is expected to loop reading and writing
/// frames until it decides the connection is done, typically on a read or
/// codec error, and then return. `on_close` is invoked exactly once after the
/// connection's transport has already been torn down.
pub trait Handler: Send + 'static {
    fn run(&mut self, conn: Arc<Connection>) -> impl Future<Output = ()> + Send;

    fn on_close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Creates one [`Handler`] per connection.
///
/// Implemented for any `Fn() -> H` closure, so a server for a stateless
/// handler is as simple as `TcpServer::bind(options, || EchoHandler).await`.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler;

    fn create(&self) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler,
{
    type Handler = H;

    fn create(&self) -> H {
        self()
    }
}
