//! Reply sinks.
//!
//! A sink is bound to exactly one connection. HTTP exchanges use a
//! [`ResponseSink`] that accepts a single reply; WebSocket and SSE streams use
//! a [`StreamSink`] that accepts any number of frames in order.
//!
//! Sink identity is the [`ConnectionKey`] (session id plus connection number),
//! never the object itself, so decorated sinks (see [`StreamSink::map`]) still
//! compare and hash equal to the sink they wrap.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::envelope::{Payload, StreamKind};
use crate::response::HttpResponse;

// ============================================================================
// Connection Key
// ============================================================================

/// Identity of one client connection within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    session_id: String,
    connection: u64,
}

impl ConnectionKey {
    pub fn new(session_id: impl Into<String>, connection: u64) -> Self {
        Self {
            session_id: session_id.into(),
            connection,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.connection)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("connection is closed")]
    Closed,

    #[error("request was already answered")]
    AlreadyReplied,

    #[error("outbound buffer is full")]
    Full,

    #[error("payload not supported on this stream: {0}")]
    Unsupported(String),
}

// ============================================================================
// Response Sink (HTTP)
// ============================================================================

/// Single-use reply channel for one HTTP exchange.
///
/// Clones share the same slot: whichever clone replies first wins, later
/// replies are dropped with a warning.
#[derive(Clone)]
pub struct ResponseSink {
    key: ConnectionKey,
    slot: Arc<Mutex<Option<oneshot::Sender<HttpResponse>>>>,
}

impl ResponseSink {
    /// Create a sink and the receiver the connection task awaits.
    pub fn channel(key: ConnectionKey) -> (Self, oneshot::Receiver<HttpResponse>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            key,
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (sink, rx)
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Deliver the reply.
    ///
    /// Returns `AlreadyReplied` for a second reply and `Closed` when the
    /// connection stopped waiting (timeout or client gone).
    pub fn send(&self, response: HttpResponse) -> Result<(), SinkError> {
        let tx = self.slot.lock().expect("mutex poisoned").take();
        match tx {
            Some(tx) => tx.send(response).map_err(|_| SinkError::Closed),
            None => {
                warn!(
                    connection = %self.key,
                    status = %response.status(),
                    "Dropping second reply to an already answered HTTP request"
                );
                Err(SinkError::AlreadyReplied)
            }
        }
    }

    /// Whether a reply was sent or the connection stopped waiting.
    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .expect("mutex poisoned")
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("key", &self.key)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl PartialEq for ResponseSink {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ResponseSink {}

// ============================================================================
// Stream Sink (WebSocket / SSE)
// ============================================================================

/// Transformation applied to every payload pushed through a decorated sink.
pub trait FrameEncoder: Send + Sync + 'static {
    fn encode(&self, payload: Payload) -> Result<Payload, SinkError>;
}

/// Multi-frame reply channel bound to one stream connection.
///
/// Frames are written in the order they are sent. Dropping the last sink
/// does not close the connection; call [`close`](Self::close) for that.
#[derive(Clone)]
pub struct StreamSink {
    key: ConnectionKey,
    kind: StreamKind,
    tx: mpsc::Sender<Payload>,
    closer: CancellationToken,
    /// Applied in order before a payload is queued.
    encoders: Arc<[Arc<dyn FrameEncoder>]>,
}

impl StreamSink {
    /// Create a sink and the frame queue the connection writer drains.
    pub fn channel(key: ConnectionKey, kind: StreamKind, capacity: usize) -> (Self, OutboundFrames) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closer = CancellationToken::new();
        let sink = Self {
            key,
            kind,
            tx,
            closer: closer.clone(),
            encoders: Arc::from(Vec::new()),
        };
        let frames = OutboundFrames {
            rx,
            closer,
            closing: false,
        };
        (sink, frames)
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Queue a frame, waiting while the outbound buffer is full.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<(), SinkError> {
        if self.closer.is_cancelled() {
            return Err(SinkError::Closed);
        }
        let payload = self.encode(payload.into())?;
        self.tx.send(payload).await.map_err(|_| SinkError::Closed)
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, payload: impl Into<Payload>) -> Result<(), SinkError> {
        if self.closer.is_cancelled() {
            return Err(SinkError::Closed);
        }
        let payload = self.encode(payload.into())?;
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    /// Close the connection after already queued frames are written.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the connection is gone or the sink was closed.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closer.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Decorate the sink: `encoder` runs on every payload before any encoder
    /// already present. The decorated sink keeps this sink's identity.
    pub fn map(&self, encoder: Arc<dyn FrameEncoder>) -> Self {
        let mut encoders: Vec<Arc<dyn FrameEncoder>> = Vec::with_capacity(self.encoders.len() + 1);
        encoders.push(encoder);
        encoders.extend(self.encoders.iter().cloned());
        Self {
            key: self.key.clone(),
            kind: self.kind,
            tx: self.tx.clone(),
            closer: self.closer.clone(),
            encoders: Arc::from(encoders),
        }
    }

    fn encode(&self, payload: Payload) -> Result<Payload, SinkError> {
        self.encoders
            .iter()
            .try_fold(payload, |payload, encoder| encoder.encode(payload))
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("encoders", &self.encoders.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for StreamSink {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for StreamSink {}

impl Hash for StreamSink {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

// ============================================================================
// Outbound Frames
// ============================================================================

/// Connection-side end of a [`StreamSink`].
///
/// Dropping it marks every clone of the sink closed.
pub struct OutboundFrames {
    rx: mpsc::Receiver<Payload>,
    closer: CancellationToken,
    closing: bool,
}

impl OutboundFrames {
    /// Next frame to write, or `None` once the sink was closed and drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        if self.closing {
            return self.rx.try_recv().ok();
        }
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closer.cancelled() => {
                self.closing = true;
                self.rx.close();
                self.rx.try_recv().ok()
            }
        }
    }

    /// Next already queued frame, without waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::response::ResponseBody;

    struct Upper;

    impl FrameEncoder for Upper {
        fn encode(&self, payload: Payload) -> Result<Payload, SinkError> {
            match payload {
                Payload::Text(s) => Ok(Payload::Text(s.to_uppercase())),
                Payload::Binary(_) => Err(SinkError::Unsupported("binary".to_string())),
            }
        }
    }

    fn key(n: u64) -> ConnectionKey {
        ConnectionKey::new("sess_test", n)
    }

    #[tokio::test]
    async fn response_sink_accepts_one_reply() {
        let (sink, rx) = ResponseSink::channel(key(1));
        let clone = sink.clone();

        sink.send(HttpResponse::ok("first")).unwrap();
        assert_eq!(
            clone.send(HttpResponse::ok("second")),
            Err(SinkError::AlreadyReplied)
        );
        assert!(sink.is_completed());

        let reply = rx.await.unwrap();
        assert_eq!(reply.into_body(), ResponseBody::from("first"));
    }

    #[tokio::test]
    async fn response_sink_reports_abandoned_exchange() {
        let (sink, rx) = ResponseSink::channel(key(1));
        drop(rx);
        assert!(sink.is_completed());
        assert_eq!(sink.send(HttpResponse::ok("late")), Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn stream_sink_preserves_order() {
        let (sink, mut frames) = StreamSink::channel(key(1), StreamKind::WebSocket, 8);
        for i in 0..5 {
            sink.send(format!("m{i}")).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(frames.recv().await, Some(Payload::Text(format!("m{i}"))));
        }
    }

    #[tokio::test]
    async fn close_drains_queued_frames_then_ends() {
        let (sink, mut frames) = StreamSink::channel(key(1), StreamKind::WebSocket, 8);
        sink.send("bye").await.unwrap();
        sink.close();

        assert_eq!(sink.send("late").await, Err(SinkError::Closed));
        assert_eq!(frames.recv().await, Some(Payload::Text("bye".to_string())));
        assert_eq!(frames.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_connection_closes_sink() {
        let (sink, frames) = StreamSink::channel(key(1), StreamKind::WebSocket, 8);
        drop(frames);

        sink.closed().await;
        assert!(sink.is_closed());
        assert_eq!(sink.send("x").await, Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn try_send_reports_full_buffer() {
        let (sink, _frames) = StreamSink::channel(key(1), StreamKind::WebSocket, 1);
        sink.try_send("a").unwrap();
        assert_eq!(sink.try_send("b"), Err(SinkError::Full));
    }

    #[tokio::test]
    async fn mapped_sink_keeps_identity_and_encodes() {
        let (sink, mut frames) = StreamSink::channel(key(7), StreamKind::WebSocket, 8);
        let upper = sink.map(Arc::new(Upper));

        assert_eq!(upper, sink);
        let mut listeners = HashSet::new();
        listeners.insert(upper.clone());
        assert!(listeners.remove(&sink));

        upper.send("hello").await.unwrap();
        assert_eq!(frames.recv().await, Some(Payload::Text("HELLO".to_string())));
        assert!(matches!(
            upper.send(Payload::Binary(bytes::Bytes::from_static(b"x"))).await,
            Err(SinkError::Unsupported(_))
        ));
    }
}
