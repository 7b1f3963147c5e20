// Copyright 2025 framewire contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// configuration errors, returned synchronously from construction
    #[error("invalid length field width: {0} (must be 1, 2 or 4)")]
    InvalidLengthWidth(usize),

    #[error("invalid max connections: {0}")]
    InvalidMaxConnections(usize),

    #[error("invalid pending write capacity: must be greater than zero")]
    InvalidPendingWriteCapacity,

    /// a frame exceeded the configured maximum length.
    ///
    /// Recoverable on the encode side; fatal to the connection on the decode
    /// side, since the stream position is past the prefix and desynchronized.
    #[error("frame too long: {len} exceeds maximum {max}")]
    FrameTooLong { len: u64, max: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// the connection was closed while an operation was in flight
    #[error("connection closed")]
    ConnectionClosed,
}
