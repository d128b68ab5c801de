//! Frame struct with typed accessors.

use bytes::{Bytes, BytesMut};

use super::wire_format::{flags, FrameKind, Header, HEADER_SIZE};

/// A complete connection frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Request frame carrying an encoded operation.
    pub fn request(request_id: u32, payload: Bytes) -> Self {
        Self::with_kind(FrameKind::Request, 0, request_id, payload)
    }

    /// Response frame; `flags` describe the envelope inside.
    pub fn response(request_id: u32, flags: u8, payload: Bytes) -> Self {
        Self::with_kind(FrameKind::Response, flags, request_id, payload)
    }

    /// Empty abort frame.
    pub fn abort(request_id: u32) -> Self {
        Self::with_kind(FrameKind::Abort, 0, request_id, Bytes::new())
    }

    fn with_kind(kind: FrameKind, flags: u8, request_id: u32, payload: Bytes) -> Self {
        let header = Header::new(kind, flags, request_id, payload.len() as u32);
        Self { header, payload }
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.header.request_id
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.header.flags, flags::IS_ERROR)
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.header.flags, flags::IS_STREAM)
    }

    #[inline]
    pub fn is_stream_end(&self) -> bool {
        flags::has_flag(self.header.flags, flags::STREAM_END)
    }

    /// Encoded header and payload in one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;

    #[test]
    fn test_constructors_set_length() {
        let frame = Frame::request(5, Bytes::from_static(b"{}"));
        assert_eq!(frame.kind(), FrameKind::Request);
        assert_eq!(frame.header.payload_length, 2);

        let abort = Frame::abort(5);
        assert_eq!(abort.kind(), FrameKind::Abort);
        assert!(abort.payload().is_empty());
    }

    #[test]
    fn test_to_bytes_parses_back() {
        let frame = Frame::response(
            456,
            flags::IS_STREAM | flags::STREAM_END,
            Bytes::from_static(b"0123456789"),
        );
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 10);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_id(), 456);
        assert!(frames[0].is_stream_end());
        assert_eq!(frames[0].payload(), b"0123456789");
    }
}
