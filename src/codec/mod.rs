//! Codecs.
//!
//! - [`Transformer`] - per-value transform applied to inputs and results
//! - [`PayloadCodec`] - byte encoding of frame payloads on persistent
//!   connections (JSON or MsgPack)
//!
//! # Example
//!
//! ```
//! use linkwire::codec::PayloadCodec;
//! use serde_json::json;
//!
//! let bytes = PayloadCodec::MsgPack.encode(&json!({"a": 1})).unwrap();
//! let back: serde_json::Value = PayloadCodec::MsgPack.decode(&bytes).unwrap();
//! assert_eq!(back, json!({"a": 1}));
//! ```

mod msgpack;
mod transformer;

#[cfg(test)]
pub(crate) use transformer::testing;

pub use msgpack::MsgPackCodec;
pub use transformer::{IdentityTransformer, Transformer, Transformers};

use bytes::Bytes;

use crate::error::Result;

/// Byte encoding of connection frame payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadCodec {
    #[default]
    Json,
    MsgPack,
}

impl PayloadCodec {
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Bytes> {
        match self {
            PayloadCodec::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
            PayloadCodec::MsgPack => Ok(Bytes::from(MsgPackCodec::encode(value)?)),
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadCodec::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}
