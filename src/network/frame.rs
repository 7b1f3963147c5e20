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

//! Length-prefixed frame codec.
//!
//! Wire format: `[length prefix: 1|2|4 bytes][payload: that many bytes]`.
//! No magic number, no version byte, no checksum. The prefix width, byte
//! order and maximum payload length come from the validated configuration.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{Endianness, LengthFieldWidth};
use crate::error::{NetError, NetResult};

/// Encodes and decodes length-prefixed frames.
///
/// Carries no mutable state; a single codec value is safely shared by every
/// connection, and the read and write sides of one connection use it
/// concurrently on their independent stream halves.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    width: LengthFieldWidth,
    endianness: Endianness,
    max_frame_len: u32,
}

impl FrameCodec {
    pub fn new(width: LengthFieldWidth, endianness: Endianness, max_frame_len: u32) -> FrameCodec {
        FrameCodec {
            width,
            endianness,
            max_frame_len: max_frame_len.min(width.max_representable()),
        }
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    /// Builds one frame out of the given payload fragments.
    ///
    /// The fragments are concatenated in call order after the length prefix,
    /// so a caller can prepend e.g. an envelope header without first copying
    /// it into the body buffer. Fails with [`NetError::FrameTooLong`] before
    /// allocating anything if the combined length exceeds the maximum.
    pub fn encode(&self, fragments: &[&[u8]]) -> NetResult<Bytes> {
        let total: u64 = fragments.iter().map(|f| f.len() as u64).sum();
        if total > self.max_frame_len as u64 {
            return Err(NetError::FrameTooLong {
                len: total,
                max: self.max_frame_len,
            });
        }

        let mut frame = BytesMut::with_capacity(self.width.bytes() + total as usize);
        self.put_prefix(&mut frame, total as u32);
        for fragment in fragments {
            frame.extend_from_slice(fragment);
        }
        Ok(frame.freeze())
    }

    /// Reads exactly one frame from `reader` and returns its payload.
    ///
    /// A stream that ends inside the prefix or the payload yields an IO error,
    /// never a partial payload. A prefix that declares more than the maximum
    /// yields [`NetError::FrameTooLong`] with no payload bytes consumed; the
    /// stream is desynchronized at that point and the connection carrying it
    /// must be torn down.
    pub async fn decode<R>(&self, reader: &mut R) -> NetResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; 4];
        let prefix = &mut prefix[..self.width.bytes()];
        reader.read_exact(prefix).await?;

        let frame_len = self.parse_prefix(prefix);
        if frame_len > self.max_frame_len {
            return Err(NetError::FrameTooLong {
                len: frame_len as u64,
                max: self.max_frame_len,
            });
        }

        let mut payload = BytesMut::zeroed(frame_len as usize);
        reader.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    }

    fn put_prefix(&self, buf: &mut BytesMut, len: u32) {
        match (self.width, self.endianness) {
            (LengthFieldWidth::One, _) => buf.put_u8(len as u8),
            (LengthFieldWidth::Two, Endianness::Big) => buf.put_u16(len as u16),
            (LengthFieldWidth::Two, Endianness::Little) => buf.put_u16_le(len as u16),
            (LengthFieldWidth::Four, Endianness::Big) => buf.put_u32(len),
            (LengthFieldWidth::Four, Endianness::Little) => buf.put_u32_le(len),
        }
    }

    fn parse_prefix(&self, prefix: &[u8]) -> u32 {
        match (self.width, self.endianness) {
            (LengthFieldWidth::One, _) => prefix[0] as u32,
            (LengthFieldWidth::Two, Endianness::Big) => {
                u16::from_be_bytes(prefix.try_into().unwrap()) as u32
            }
            (LengthFieldWidth::Two, Endianness::Little) => {
                u16::from_le_bytes(prefix.try_into().unwrap()) as u32
            }
            (LengthFieldWidth::Four, Endianness::Big) => {
                u32::from_be_bytes(prefix.try_into().unwrap())
            }
            (LengthFieldWidth::Four, Endianness::Little) => {
                u32::from_le_bytes(prefix.try_into().unwrap())
            }
        }
    }
}
