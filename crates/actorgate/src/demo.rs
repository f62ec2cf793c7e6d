//! Sample chat application served by `actorgate serve`.
//!
//! | Request              | Reply                                          |
//! |----------------------|------------------------------------------------|
//! | `GET /`              | `httpResponse` as `text/html`                  |
//! | `GET /notfound`      | 404 `Not found`                                |
//! | `GET /die`           | actor fails with `die`                         |
//! | `GET /redirect`      | 302 to `/foo`                                  |
//! | `GET /ssechannel`    | opens an SSE stream for the session            |
//! | `POST /ssepublish`   | pushes the body to the session's latest stream |
//!
//! Data received on a WebSocket is echoed to the sender and forwarded to
//! every other stream in the room.
//!
//! Room broadcast is best-effort: a member whose stream buffer is full misses
//! the frame (logged at `warn`). The echo to the sender waits for buffer space
//! like any other actor reply.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use http::StatusCode;
use tracing::{debug, warn};

use crate::actor::{ActorContext, ActorError, ExitReason, WebActor};
use crate::context::ActorFactory;
use crate::envelope::{DataMessage, HttpRequest, Payload, StreamOpened, WebMessage};
use crate::response::HttpResponse;
use crate::sink::{ConnectionKey, SinkError, StreamSink};

// ============================================================================
// Room
// ============================================================================

/// Streams of every session that currently has one open.
#[derive(Default)]
pub struct Room {
    members: DashMap<ConnectionKey, StreamSink>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, sink: StreamSink) {
        self.members.insert(sink.key().clone(), sink);
    }

    pub fn leave(&self, key: &ConnectionKey) {
        self.members.remove(key);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Push `payload` to every member except `from`, without waiting on slow
    /// members. Frames for a member with a full buffer are dropped.
    pub fn broadcast(&self, from: &ConnectionKey, payload: &Payload) {
        let targets: Vec<StreamSink> = self
            .members
            .iter()
            .filter(|entry| entry.key() != from)
            .map(|entry| entry.value().clone())
            .collect();

        for sink in targets {
            match sink.try_send(payload.clone()) {
                Ok(()) => {}
                Err(SinkError::Closed) => self.leave(sink.key()),
                Err(e) => warn!(connection = %sink.key(), error = %e, "Dropping broadcast frame"),
            }
        }
    }
}

/// Factory creating one [`DemoActor`] per session, all sharing `room`.
pub fn factory(room: Arc<Room>) -> ActorFactory {
    Arc::new(move |_session_id: &str| {
        Ok(Box::new(DemoActor::new(room.clone())) as Box<dyn WebActor>)
    })
}

// ============================================================================
// DemoActor
// ============================================================================

pub struct DemoActor {
    room: Arc<Room>,
    /// Most recently opened stream of this session.
    peer: Option<StreamSink>,
    streams: Vec<ConnectionKey>,
}

impl DemoActor {
    pub fn new(room: Arc<Room>) -> Self {
        Self {
            room,
            peer: None,
            streams: Vec::new(),
        }
    }

    async fn on_request(&mut self, req: HttpRequest) -> Result<(), ActorError> {
        let response = match req.path() {
            "/" => HttpResponse::ok("httpResponse").with_content_type("text/html"),
            "/notfound" => HttpResponse::error(StatusCode::NOT_FOUND, "Not found"),
            "/die" => return Err(ActorError::failed("die")),
            "/redirect" => HttpResponse::redirect("/foo"),
            "/ssechannel" => HttpResponse::start_sse(),
            "/ssepublish" => self.publish(&req).await,
            _ => HttpResponse::error(StatusCode::NOT_FOUND, "Not found"),
        };
        // The client may have given up already.
        let _ = req.reply(response);
        Ok(())
    }

    async fn publish(&self, req: &HttpRequest) -> HttpResponse {
        let Some(text) = req.body_text() else {
            return HttpResponse::error(StatusCode::BAD_REQUEST, "body must be UTF-8 text");
        };
        let Some(peer) = &self.peer else {
            return HttpResponse::error(StatusCode::CONFLICT, "no stream is open for this session");
        };
        match peer.send(text).await {
            Ok(()) => HttpResponse::ok(""),
            Err(e) => HttpResponse::error(StatusCode::GONE, e.to_string()),
        }
    }

    fn on_opened(&mut self, opened: StreamOpened, ctx: &ActorContext) {
        let sink = opened.reply_to;
        debug!(connection = %sink.key(), kind = %opened.kind, "Stream joined room");
        ctx.watch_stream(&sink);
        self.streams.push(sink.key().clone());
        self.room.join(sink.clone());
        self.peer = Some(sink);
    }

    async fn on_data(&mut self, data: DataMessage) {
        if let Err(e) = data.from.send(data.payload.clone()).await {
            debug!(connection = %data.from.key(), error = %e, "Echo not delivered");
        }
        self.room.broadcast(data.from.key(), &data.payload);
    }

    fn on_closed(&mut self, key: &ConnectionKey) {
        self.room.leave(key);
        self.streams.retain(|k| k != key);
        if self.peer.as_ref().is_some_and(|peer| peer.key() == key) {
            self.peer = None;
        }
    }
}

#[async_trait]
impl WebActor for DemoActor {
    async fn handle(&mut self, msg: WebMessage, ctx: &mut ActorContext) -> Result<(), ActorError> {
        match msg {
            WebMessage::Http(req) => self.on_request(req).await?,
            WebMessage::StreamOpened(opened) => self.on_opened(opened, ctx),
            WebMessage::Data(data) => self.on_data(data).await,
            WebMessage::StreamClosed(key) => self.on_closed(&key),
            WebMessage::Exit(_) => {}
        }
        Ok(())
    }

    async fn stopping(&mut self, _reason: &ExitReason) {
        for key in self.streams.drain(..) {
            self.room.leave(&key);
        }
    }
}
