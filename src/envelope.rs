//! Data shapes exchanged between client and server.
//!
//! ```text
//! request   {"path": "user.get", "type": "query", "input": ...}      (or an array of them)
//! response  {"result": {"type": "data", "data": ...}}
//!           {"result": {"type": "error", "error": <shape>}}
//! ```

use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Metadata key selecting the batch response framing.
pub const BATCH_MODE_KEY: &str = "batch-mode";

/// Value of [`BATCH_MODE_KEY`] selecting the streamed indexed framing.
pub const BATCH_MODE_STREAM: &str = "stream";

/// Metadata key carrying the response content type.
pub const CONTENT_TYPE_KEY: &str = "content-type";

/// Declared type of a procedure and of the operations calling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureKind::Query => "query",
            ProcedureKind::Mutation => "mutation",
            ProcedureKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical call travelling through the client link chain.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Caller-scoped identifier, unique per in-flight call.
    pub id: u64,
    pub kind: ProcedureKind,
    /// Dot-separated procedure address.
    pub path: String,
    pub input: Value,
    /// Free-form metadata links may read and extend.
    pub context: Map<String, Value>,
    /// Cancelled when the caller gives up on this operation.
    pub signal: CancellationToken,
}

impl Operation {
    pub fn new(id: u64, kind: ProcedureKind, path: impl Into<String>, input: Value) -> Self {
        Self {
            id,
            kind,
            path: path.into(),
            input,
            context: Map::new(),
            signal: CancellationToken::new(),
        }
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Wire form of this operation with `input` replaced.
    pub fn to_wire(&self, input: Value) -> WireRequest {
        WireRequest {
            id: Some(self.id),
            path: self.path.clone(),
            kind: self.kind,
            input,
        }
    }
}

/// Successful result delivered to a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub data: Value,
    /// True for values emitted by a subscription.
    pub streaming: bool,
}

impl OperationResponse {
    pub fn single(data: Value) -> Self {
        Self {
            data,
            streaming: false,
        }
    }

    pub fn stream_item(data: Value) -> Self {
        Self {
            data,
            streaming: true,
        }
    }
}

/// Serialized operation as carried in a request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ProcedureKind,
    #[serde(default)]
    pub input: Value,
}

/// `{"result": {...}}` envelope around one result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub result: ResultPayload,
}

/// Tagged body of a [`ResponseEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    Data { data: Value },
    Error { error: Value },
    /// Subscription accepted; data envelopes follow.
    Started,
    /// Subscription ended.
    Stopped,
}

impl ResponseEnvelope {
    pub fn data(data: Value) -> Self {
        Self {
            id: None,
            result: ResultPayload::Data { data },
        }
    }

    pub fn error(shape: Value) -> Self {
        Self {
            id: None,
            result: ResultPayload::Error { error: shape },
        }
    }

    pub fn started() -> Self {
        Self {
            id: None,
            result: ResultPayload::Started,
        }
    }

    pub fn stopped() -> Self {
        Self {
            id: None,
            result: ResultPayload::Stopped,
        }
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.result, ResultPayload::Error { .. })
    }
}

/// Raw request handed over by a transport binding.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    /// Header-like metadata, keys lowercase.
    pub metadata: HashMap<String, String>,
    pub body: Bytes,
}

impl RawRequest {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            metadata: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Whether the caller asked for the streamed batch framing.
    pub fn wants_stream(&self) -> bool {
        self.metadata(BATCH_MODE_KEY) == Some(BATCH_MODE_STREAM)
    }
}

/// Response produced for a [`RawRequest`]; the body is written as it is yielded.
pub struct RawResponse {
    pub status: u16,
    pub metadata: HashMap<String, String>,
    pub body: BoxStream<'static, Bytes>,
}

impl RawResponse {
    /// Response with a body already in memory.
    pub fn full(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            metadata: json_metadata(),
            body: futures::stream::once(async move { body }).boxed(),
        }
    }

    /// Response whose body chunks are produced over time.
    pub fn streaming(status: u16, body: BoxStream<'static, Bytes>) -> Self {
        Self {
            status,
            metadata: json_metadata(),
            body,
        }
    }

    /// Concatenate the whole body.
    pub async fn collect_body(self) -> Bytes {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn json_metadata() -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(CONTENT_TYPE_KEY.to_string(), "application/json".to_string());
    metadata
}
