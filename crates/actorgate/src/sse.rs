//! Server-Sent Events framing.
//!
//! Every payload pushed through an SSE sink becomes one event: each line is
//! prefixed with `data: ` and the event ends with a blank line. No other SSE
//! fields are emitted.

use std::sync::Arc;

use crate::envelope::Payload;
use crate::sink::{FrameEncoder, SinkError, StreamSink};

/// Content type of an event stream response.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Comment frame written while a stream is idle.
pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

/// Frame `payload` as a single `text/event-stream` event.
///
/// One trailing newline is dropped so `"msg\n"` and `"msg"` produce the same
/// event; `\r\n` line endings are accepted.
pub fn encode_event(payload: &str) -> String {
    let body = payload.strip_suffix('\n').unwrap_or(payload);
    let mut out = String::with_capacity(body.len() + 8);
    for line in body.split('\n') {
        out.push_str("data: ");
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Encoder installed on SSE sinks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SseEncoder;

impl FrameEncoder for SseEncoder {
    fn encode(&self, payload: Payload) -> Result<Payload, SinkError> {
        match payload {
            Payload::Text(text) => Ok(Payload::Text(encode_event(&text))),
            Payload::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => Ok(Payload::Text(encode_event(text))),
                Err(_) => Err(SinkError::Unsupported(
                    "event streams carry UTF-8 text only".to_string(),
                )),
            },
        }
    }
}

/// Wrap a raw stream sink so that every push is written as one SSE event.
///
/// The returned sink keeps the identity of `sink`.
pub fn adapt(sink: &StreamSink) -> StreamSink {
    sink.map(Arc::new(SseEncoder))
}
