//! Uniform message vocabulary exchanged between transports and actors.
//!
//! Every envelope carries the sink the actor replies through, so actor code
//! never needs a transport-specific type.

use bytes::Bytes;
use http::{Method, Uri};
use url::form_urlencoded;

use crate::actor::{ActorId, ExitReason};
use crate::headers::HeaderView;
use crate::response::HttpResponse;
use crate::sink::{ConnectionKey, ResponseSink, SinkError, StreamSink};

// ============================================================================
// Payload
// ============================================================================

/// Data carried by a stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(s) => Bytes::from(s),
            Self::Binary(b) => b,
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Kind of long-lived stream attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    WebSocket,
    Sse,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// An inbound HTTP request awaiting exactly one reply.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    headers: HeaderView,
    body: Bytes,
    params: Vec<(String, String)>,
    session_id: String,
    reply_to: ResponseSink,
}

impl HttpRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderView,
        body: Bytes,
        session_id: impl Into<String>,
        reply_to: ResponseSink,
    ) -> Self {
        let params = parse_params(&uri, &headers, &body);
        Self {
            method,
            uri,
            headers,
            body,
            params,
            session_id: session_id.into(),
            reply_to,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn headers(&self) -> &HeaderView {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decoded request parameters in order: query string first, then an
    /// `application/x-www-form-urlencoded` body. Names may repeat.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// First value of parameter `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Every value of parameter `name`, in order.
    pub fn param_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.params
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Request cookies as `(name, value)` pairs.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.cookies()
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn reply_to(&self) -> &ResponseSink {
        &self.reply_to
    }

    /// Answer the request. Only the first reply reaches the client.
    pub fn reply(&self, response: HttpResponse) -> Result<(), SinkError> {
        self.reply_to.send(response)
    }
}

fn parse_params(uri: &Uri, headers: &HeaderView, body: &Bytes) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = uri
        .query()
        .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let is_form = headers.content_type().is_some_and(|ct| {
        ct.split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
    });
    if is_form {
        params.extend(form_urlencoded::parse(body).into_owned());
    }
    params
}

/// A WebSocket or SSE stream was attached to the session.
#[derive(Debug, Clone)]
pub struct StreamOpened {
    pub kind: StreamKind,
    /// For SSE streams the sink already applies event-stream framing.
    pub reply_to: StreamSink,
}

/// A frame received on a stream attached to the session.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub payload: Payload,
    pub from: StreamSink,
}

/// A watched actor terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleExit {
    pub actor: ActorId,
    pub reason: ExitReason,
}

/// Everything an actor's mailbox can receive.
#[derive(Debug)]
pub enum WebMessage {
    Http(HttpRequest),
    StreamOpened(StreamOpened),
    Data(DataMessage),
    /// A watched stream went away (see `ActorContext::watch_stream`).
    StreamClosed(ConnectionKey),
    /// A watched actor terminated (see `ActorContext::watch_actor`).
    Exit(LifecycleExit),
}

impl WebMessage {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::StreamOpened(_) => "stream_opened",
            Self::Data(_) => "data",
            Self::StreamClosed(_) => "stream_closed",
            Self::Exit(_) => "exit",
        }
    }
}
