//! Configuration for the connection engine.
//!
//! [`NetOptions`] is the raw, caller-assembled parameter set. It is validated
//! exactly once by [`NetOptions::validate`], which produces an immutable
//! [`NetConfig`]; the raw value is consumed rather than patched in place, so a
//! caller can never observe a half-adjusted options struct.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{NetError, NetResult};

/// Byte order of the length prefix on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Width of the length prefix. Only 1, 2 and 4 byte prefixes are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFieldWidth {
    One,
    Two,
    Four,
}

impl LengthFieldWidth {
    pub fn bytes(self) -> usize {
        match self {
            LengthFieldWidth::One => 1,
            LengthFieldWidth::Two => 2,
            LengthFieldWidth::Four => 4,
        }
    }

    /// The largest frame length representable by this prefix width.
    pub fn max_representable(self) -> u32 {
        match self {
            LengthFieldWidth::One => u8::MAX as u32,
            LengthFieldWidth::Two => u16::MAX as u32,
            LengthFieldWidth::Four => u32::MAX,
        }
    }

    fn from_raw(raw: usize) -> NetResult<LengthFieldWidth> {
        match raw {
            1 => Ok(LengthFieldWidth::One),
            2 => Ok(LengthFieldWidth::Two),
            4 => Ok(LengthFieldWidth::Four),
            other => Err(NetError::InvalidLengthWidth(other)),
        }
    }
}

/// Raw engine options as assembled by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOptions {
    /// Address the server listens on.
    pub listen_addr: String,
    /// Maximum number of live connections a server will admit.
    pub max_connections: usize,

    /// Address a client dials.
    pub remote_addr: String,
    /// Delay between client dial attempts.
    pub reconnect_interval: Duration,
    /// Whether a client dials again after its connection ends.
    pub auto_reconnect: bool,

    /// Capacity of each connection's outbound queue.
    pub pending_write_capacity: usize,

    /// Width of the length prefix in bytes: 1, 2 or 4.
    pub length_field_width: usize,
    /// Maximum frame payload length, clamped down to what the width can carry.
    pub max_frame_len: u32,
    /// Byte order of the length prefix.
    pub endianness: Endianness,
}

impl Default for NetOptions {
    fn default() -> Self {
        NetOptions {
            listen_addr: String::new(),
            max_connections: 100,
            remote_addr: String::new(),
            reconnect_interval: Duration::from_secs(1),
            auto_reconnect: false,
            pending_write_capacity: 100,
            length_field_width: 2,
            max_frame_len: 4096,
            endianness: Endianness::Big,
        }
    }
}

impl NetOptions {
    /// Validates the options and produces an immutable [`NetConfig`].
    ///
    /// An invalid length field width or a zero outbound queue capacity is
    /// fatal. `max_frame_len` is clamped down to the prefix width's natural
    /// ceiling, never up. A zero reconnect interval is reset to one second.
    pub fn validate(self) -> NetResult<NetConfig> {
        let width = LengthFieldWidth::from_raw(self.length_field_width)?;

        if self.pending_write_capacity == 0 {
            return Err(NetError::InvalidPendingWriteCapacity);
        }

        let max_frame_len = self.max_frame_len.min(width.max_representable());

        let reconnect_interval = if self.reconnect_interval.is_zero() {
            let fallback = Duration::from_secs(1);
            info!("invalid reconnect interval, reset to {:?}", fallback);
            fallback
        } else {
            self.reconnect_interval
        };

        Ok(NetConfig {
            listen_addr: self.listen_addr,
            max_connections: self.max_connections,
            remote_addr: self.remote_addr,
            reconnect_interval,
            auto_reconnect: self.auto_reconnect,
            pending_write_capacity: self.pending_write_capacity,
            width,
            max_frame_len,
            endianness: self.endianness,
        })
    }
}

/// Validated, immutable engine configuration.
///
/// Only constructed through [`NetOptions::validate`].
#[derive(Debug, Clone)]
pub struct NetConfig {
    listen_addr: String,
    max_connections: usize,
    remote_addr: String,
    reconnect_interval: Duration,
    auto_reconnect: bool,
    pending_write_capacity: usize,
    width: LengthFieldWidth,
    max_frame_len: u32,
    endianness: Endianness,
}

impl NetConfig {
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn pending_write_capacity(&self) -> usize {
        self.pending_write_capacity
    }

    pub fn length_field_width(&self) -> LengthFieldWidth {
        self.width
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Builds the frame codec described by this configuration.
    pub fn codec(&self) -> crate::network::FrameCodec {
        crate::network::FrameCodec::new(self.width, self.endianness, self.max_frame_len)
    }
}
