//! Optional application envelope.
//!
//! Callers layering request dispatch atop raw payloads may place this fixed
//! 8-byte header at the start of a frame's payload:
//!
//! ```text
//! byte 0      compression kind
//! byte 1      serialization kind
//! bytes 2..6  declared data length, big-endian u32
//! bytes 6..8  command id, big-endian u16
//! ```
//!
//! The engine itself never reads or writes these bytes; this module is purely
//! an accessor/mutator contract. In particular, **the declared data length is
//! never cross-checked against the actual frame length by any layer** — callers
//! who use the envelope own that invariant themselves, and some deliberately
//! rely on it being unchecked.

use bytes::Bytes;

/// Compression marker carried in byte 0 of an [`EnvelopeHeader`].
///
/// An open set: values other than [`CompressType::NONE`] are reserved and pass
/// through the engine untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressType(pub u8);

impl CompressType {
    /// No compression.
    pub const NONE: CompressType = CompressType(0);
}

/// Serialization marker carried in byte 1 of an [`EnvelopeHeader`].
///
/// Markers only, never enforced by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializeType(pub u8);

impl SerializeType {
    /// Raw bytes, no serialization.
    pub const NONE: SerializeType = SerializeType(0);
    /// A structured text format.
    pub const JSON: SerializeType = SerializeType(1);
    /// A structured binary format.
    pub const PROTOBUF: SerializeType = SerializeType(2);
}

/// Size of the envelope header in bytes.
pub const ENVELOPE_HEADER_LEN: usize = 8;

/// The fixed 8-byte envelope header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeHeader([u8; ENVELOPE_HEADER_LEN]);

impl EnvelopeHeader {
    pub fn new() -> EnvelopeHeader {
        EnvelopeHeader::default()
    }

    pub fn compress_type(&self) -> CompressType {
        CompressType(self.0[0])
    }

    pub fn set_compress_type(&mut self, ct: CompressType) {
        self.0[0] = ct.0;
    }

    pub fn serialize_type(&self) -> SerializeType {
        SerializeType(self.0[1])
    }

    pub fn set_serialize_type(&mut self, st: SerializeType) {
        self.0[1] = st.0;
    }

    /// The declared payload length. Not validated against anything.
    pub fn data_len(&self) -> u32 {
        u32::from_be_bytes(self.0[2..6].try_into().unwrap())
    }

    pub fn set_data_len(&mut self, len: u32) {
        self.0[2..6].copy_from_slice(&len.to_be_bytes());
    }

    pub fn cmd_id(&self) -> u16 {
        u16::from_be_bytes(self.0[6..8].try_into().unwrap())
    }

    pub fn set_cmd_id(&mut self, cmd_id: u16) {
        self.0[6..8].copy_from_slice(&cmd_id.to_be_bytes());
    }

    /// The raw header bytes, suitable as the first fragment of a frame.
    pub fn as_bytes(&self) -> &[u8; ENVELOPE_HEADER_LEN] {
        &self.0
    }
}

impl From<[u8; ENVELOPE_HEADER_LEN]> for EnvelopeHeader {
    fn from(raw: [u8; ENVELOPE_HEADER_LEN]) -> EnvelopeHeader {
        EnvelopeHeader(raw)
    }
}

/// An envelope header paired with its body.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub data: Bytes,
}

impl Envelope {
    /// Splits a received frame payload into header and body.
    ///
    /// Returns `None` if the payload is shorter than the header. The body is
    /// whatever follows the 8 header bytes, regardless of the header's declared
    /// data length.
    pub fn from_payload(payload: Bytes) -> Option<Envelope> {
        if payload.len() < ENVELOPE_HEADER_LEN {
            return None;
        }
        let header: [u8; ENVELOPE_HEADER_LEN] =
            payload[..ENVELOPE_HEADER_LEN].try_into().unwrap();
        Some(Envelope {
            header: EnvelopeHeader(header),
            data: payload.slice(ENVELOPE_HEADER_LEN..),
        })
    }

    /// Header and body as the two fragments of one frame, for
    /// [`Connection::write_frame`](crate::network::Connection::write_frame).
    pub fn fragments(&self) -> [&[u8]; 2] {
        [self.header.as_bytes(), &self.data]
    }
}
