//! Connection frame header.
//!
//! Persistent connections carry length-prefixed frames with a 10-byte
//! header:
//! ```text
//! ┌────────┬───────┬──────────┬──────────┐
//! │ Kind   │ Flags │ Req ID   │ Length   │
//! │ 1 byte │ 1 byte│ 4 bytes  │ 4 bytes  │
//! │        │       │ uint32 BE│ uint32 BE│
//! └────────┴───────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{LinkwireError, Result};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 10;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Absolute maximum payload size (max i32).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = 2_147_483_647;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client → server: a serialized operation.
    Request = 1,
    /// Server → client: a result envelope.
    Response = 2,
    /// Client → server: cancel the call with this request id.
    Abort = 3,
}

impl FrameKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Response),
            3 => Some(FrameKind::Abort),
            _ => None,
        }
    }
}

/// Flag bits of response frames.
pub mod flags {
    /// Payload is an error envelope.
    pub const IS_ERROR: u8 = 0b0000_0001;
    /// Frame belongs to a subscription stream.
    pub const IS_STREAM: u8 = 0b0000_0010;
    /// Last frame of a subscription stream.
    pub const STREAM_END: u8 = 0b0000_0100;
    /// Subscription accepted by the server.
    pub const STARTED: u8 = 0b0000_1000;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0b1111_0000;

    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    /// See [`flags`].
    pub flags: u8,
    /// Connection-scoped call identifier.
    pub request_id: u32,
    pub payload_length: u32,
}

impl Header {
    pub fn new(kind: FrameKind, flags: u8, request_id: u32, payload_length: u32) -> Self {
        Self {
            kind,
            flags,
            request_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use linkwire::protocol::{FrameKind, Header, HEADER_SIZE};
    ///
    /// let bytes = Header::new(FrameKind::Request, 0, 42, 100).encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// assert_eq!(bytes[0], 1);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.request_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(LinkwireError::Protocol(format!(
                "Header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| LinkwireError::Protocol(format!("Unknown frame kind {}", buf[0])))?;
        Ok(Self {
            kind,
            flags: buf[1],
            request_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            payload_length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Checks payload length against `max_payload_size` and that reserved
    /// flag bits are clear.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(LinkwireError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(LinkwireError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_STREAM)
    }

    #[inline]
    pub fn is_stream_end(&self) -> bool {
        flags::has_flag(self.flags, flags::STREAM_END)
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        flags::has_flag(self.flags, flags::STARTED)
    }
}
