//! Network Module Implementation
//!
//! This module provides the core networking functionality of the engine:
//! TCP connection handling, frame encoding and decoding, and the server and
//! client lifecycle state machines.
//!
//! # Architecture
//!
//! The module is built on tokio's async I/O primitives and consists of:
//! - `FrameCodec`: length-prefixed frame encoding and decoding
//! - `Connection`: one socket with a bounded outbound queue drained by a
//!   dedicated write task
//! - `TcpServer`: listen, accept with backoff, admission control, graceful
//!   shutdown
//! - `TcpClient`: dial with retry, optional auto-reconnect, graceful shutdown
//! - `Handler` / `HandlerFactory`: the seam where caller-supplied logic runs

pub use client::TcpClient;
pub use connection::Connection;
pub use frame::FrameCodec;
pub use handler::{Handler, HandlerFactory};
pub use server::TcpServer;

mod client;
mod connection;
mod frame;
mod handler;
mod server;
