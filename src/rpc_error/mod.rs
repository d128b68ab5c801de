//! Error normalization across the client/server boundary.
//!
//! - [`NormalizedError`] is created once where a procedure fails
//! - [`default_shape`] / [`ErrorFormatter`] turn it into the wire value
//! - [`ClientError`] is what a caller receives, rebuilt from that value

mod client;
mod kind;
mod normalized;
mod shape;

pub use client::{ClientError, ErrorOrigin};
pub use kind::ErrorKind;
pub use normalized::{BoxError, NormalizedError};
pub use shape::{
    default_shape, format_error, DefaultErrorFormatter, ErrorFormatter, FormatterInput,
    SharedFormatter,
};
