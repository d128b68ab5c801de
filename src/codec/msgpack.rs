//! MsgPack payload codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` so they travel as maps
//! with field names; peers decoding into dynamic values need the names.

use crate::error::Result;

/// MessagePack codec for connection payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ProcedureKind, ResponseEnvelope, WireRequest};
    use serde_json::{json, Value};

    #[test]
    fn test_wire_request_travels_as_map() {
        let req = WireRequest {
            id: Some(3),
            path: "user.get".into(),
            kind: ProcedureKind::Query,
            input: json!({"id": 7}),
        };
        let encoded = MsgPackCodec::encode(&req).unwrap();

        let dynamic: Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(dynamic["path"], "user.get");
        assert_eq!(dynamic["type"], "query");

        let decoded: WireRequest = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_envelope_with_nested_values() {
        let env = ResponseEnvelope::data(json!({"list": [1, "two", null], "ok": true}));
        let encoded = MsgPackCodec::encode(&env).unwrap();
        let decoded: ResponseEnvelope = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<WireRequest> = MsgPackCodec::decode(&[0xc1]);
        assert!(result.is_err());
    }
}
