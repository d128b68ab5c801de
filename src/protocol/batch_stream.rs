//! Indexed streaming batch framing.
//!
//! A batch response is a JSON object keyed by request index, written one
//! entry per line as results complete:
//!
//! ```text
//! {"0":<result>\n
//! ,"2":<result>\n
//! ,"1":<result>\n
//! }
//! ```
//!
//! Arrival order is completion order. The decoder hands out each entry as
//! soon as its line is buffered and only yields the aggregate once the
//! closing `}` has been seen. Values are opaque here; transformers run on
//! them before encoding and after decoding.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{LinkwireError, Result};

/// Writes batch entries in the indexed framing.
#[derive(Debug, Default)]
pub struct BatchStreamEncoder {
    started: bool,
}

impl BatchStreamEncoder {
    /// Encoder for a batch with no entry written yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one `"<index>":<value>` line.
    pub fn item(&mut self, index: usize, value: &Value) -> Result<Bytes> {
        let json = serde_json::to_vec(value)?;
        let mut buf = BytesMut::with_capacity(json.len() + 16);
        buf.extend_from_slice(if self.started { b"," } else { b"{" });
        buf.extend_from_slice(format!("\"{index}\":").as_bytes());
        buf.extend_from_slice(&json);
        buf.extend_from_slice(b"\n");
        self.started = true;
        Ok(buf.freeze())
    }

    /// Closing chunk. An empty batch encodes as `{}`.
    pub fn finish(self) -> Bytes {
        if self.started {
            Bytes::from_static(b"}")
        } else {
            Bytes::from_static(b"{}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for `{`.
    Open,
    /// Inside the object; `first` until one entry was read.
    Entries { first: bool },
    /// `}` seen.
    Closed,
    /// Input was malformed; nothing more is accepted.
    Failed,
}

/// Incremental reader for the indexed framing.
///
/// # Example
///
/// ```
/// use linkwire::protocol::BatchStreamDecoder;
///
/// let mut decoder = BatchStreamDecoder::new();
/// let items = decoder.push(b"{\"1\":\"b\"\n,\"0\":\"a\"").unwrap();
/// assert_eq!(items.len(), 1);
/// let items = decoder.push(b"\n}").unwrap();
/// assert_eq!(items[0].0, 0);
/// assert_eq!(decoder.finish().unwrap().len(), 2);
/// ```
#[derive(Debug)]
pub struct BatchStreamDecoder {
    buffer: BytesMut,
    state: State,
    items: BTreeMap<usize, Value>,
}

impl BatchStreamDecoder {
    /// Decoder waiting for the opening `{`.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::Open,
            items: BTreeMap::new(),
        }
    }

    /// Feed bytes; returns every entry completed by them, in arrival order.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<(usize, Value)>> {
        if self.state == State::Failed {
            return Err(protocol("batch stream already failed"));
        }
        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            match self.step() {
                Ok(Some(item)) => out.push(item),
                Ok(None) => return Ok(out),
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Whether the closing `}` has been read.
    pub fn is_complete(&self) -> bool {
        self.state == State::Closed
    }

    /// Aggregate of all entries. Fails if the stream is truncated or failed.
    pub fn finish(self) -> Result<BTreeMap<usize, Value>> {
        match self.state {
            State::Closed => Ok(self.items),
            State::Failed => Err(protocol("malformed batch stream")),
            _ => Err(protocol("batch stream ended before closing brace")),
        }
    }

    fn step(&mut self) -> Result<Option<(usize, Value)>> {
        match self.state {
            State::Open => {
                skip_whitespace(&mut self.buffer);
                match self.buffer.first().copied() {
                    None => Ok(None),
                    Some(b'{') => {
                        self.buffer.advance(1);
                        self.state = State::Entries { first: true };
                        self.step()
                    }
                    Some(other) => Err(protocol(format!(
                        "expected '{{' at start of batch stream, found {:?}",
                        other as char
                    ))),
                }
            }

            State::Entries { first } => {
                skip_whitespace(&mut self.buffer);
                match self.buffer.first().copied() {
                    None => return Ok(None),
                    Some(b'}') => {
                        self.buffer.advance(1);
                        self.state = State::Closed;
                        return self.step();
                    }
                    Some(b',') if !first => {}
                    Some(_) if first => {}
                    Some(other) => {
                        return Err(protocol(format!(
                            "expected ',' between batch entries, found {:?}",
                            other as char
                        )))
                    }
                }

                let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                    return Ok(None);
                };
                let line = self.buffer.split_to(newline + 1);
                let body = if first { &line[..newline] } else { &line[1..newline] };

                let (index, value) = parse_entry(body)?;
                if self.items.contains_key(&index) {
                    return Err(protocol(format!("duplicate batch index {index}")));
                }
                self.items.insert(index, value.clone());
                self.state = State::Entries { first: false };
                Ok(Some((index, value)))
            }

            State::Closed => {
                skip_whitespace(&mut self.buffer);
                if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(protocol("trailing data after batch stream"))
                }
            }

            State::Failed => Err(protocol("batch stream already failed")),
        }
    }
}

impl Default for BatchStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive a decoder over a byte stream, calling `on_item` for every entry as
/// it arrives.
///
/// Entries delivered before a failure stay delivered; the error only
/// affects the aggregate.
pub async fn parse_batch_stream<S, F>(stream: S, mut on_item: F) -> Result<BTreeMap<usize, Value>>
where
    S: Stream<Item = Result<Bytes>>,
    F: FnMut(usize, Value),
{
    futures::pin_mut!(stream);
    let mut decoder = BatchStreamDecoder::new();
    while let Some(chunk) = stream.next().await {
        for (index, value) in decoder.push(&chunk?)? {
            on_item(index, value);
        }
    }
    decoder.finish()
}

/// `"<index>":<value>` without surrounding punctuation.
fn parse_entry(body: &[u8]) -> Result<(usize, Value)> {
    let mut wrapped = Vec::with_capacity(body.len() + 2);
    wrapped.push(b'{');
    wrapped.extend_from_slice(body);
    wrapped.push(b'}');

    let map: serde_json::Map<String, Value> = serde_json::from_slice(&wrapped)
        .map_err(|e| protocol(format!("malformed batch entry: {e}")))?;
    if map.len() != 1 {
        return Err(protocol("batch entry must hold exactly one index"));
    }
    let Some((key, value)) = map.into_iter().next() else {
        return Err(protocol("empty batch entry"));
    };
    let index = key
        .parse::<usize>()
        .map_err(|_| protocol(format!("batch index is not a number: {key:?}")))?;
    Ok((index, value))
}

fn skip_whitespace(buf: &mut BytesMut) {
    let n = buf
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .count();
    buf.advance(n);
}

fn protocol(msg: impl Into<String>) -> LinkwireError {
    LinkwireError::Protocol(msg.into())
}
