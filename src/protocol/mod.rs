//! Wire framing.
//!
//! - indexed batch streaming (`{"<i>":<result>\n ... }`) for request/response
//!   transports
//! - 10-byte header binary frames for persistent connections

mod batch_stream;
mod frame;
mod frame_buffer;
mod wire_format;

pub use batch_stream::{parse_batch_stream, BatchStreamDecoder, BatchStreamEncoder};
pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, FrameKind, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};
