//! framewire is a reusable TCP connection engine: it accepts or dials TCP
//! sockets, frames the byte stream into discrete length-prefixed messages,
//! and hands each connection to caller-supplied [`Handler`] logic while
//! managing concurrency, back-pressure and the shutdown lifecycle of every
//! socket.
//!
//! It is infrastructure for building message-oriented network services
//! (custom RPC, game servers, gateways), not an application itself: there is
//! no built-in request dispatch, encryption or stream multiplexing.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use framewire::{Connection, Handler, NetOptions, TcpServer};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn run(&mut self, conn: Arc<Connection>) {
//!         while let Ok(payload) = conn.read_frame().await {
//!             if conn.write_frame(&[&payload]).is_err() {
//!                 break;
//!             }
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> framewire::NetResult<()> {
//!     let options = NetOptions {
//!         listen_addr: "0.0.0.0:7000".into(),
//!         ..Default::default()
//!     };
//!     let server = TcpServer::bind(options, || Echo).await?;
//!     server.start();
//!     tokio::signal::ctrl_c().await?;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod message;
mod network;

pub use config::{Endianness, LengthFieldWidth, NetConfig, NetOptions};
pub use error::{NetError, NetResult};
pub use message::{
    CompressType, Envelope, EnvelopeHeader, SerializeType, ENVELOPE_HEADER_LEN,
};
pub use network::{Connection, FrameCodec, Handler, HandlerFactory, TcpClient, TcpServer};
