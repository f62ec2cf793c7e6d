//! axum binding of the gateway.
//!
//! Every path that is not a health probe lands in [`dispatch`], which
//! classifies it and hands it to the transport-agnostic core.

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, FromRequestParts, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::problem_details;
use crate::context::Binding;
use crate::envelope::Payload;
use crate::gateway::{
    EventStream, FrameWriter, Gateway, HttpOutcome, InboundFrame, InboundRequest, TransportError,
};
use crate::headers::HeaderView;
use crate::patterns::Route;
use crate::response::{Cookie, HttpResponse};
use crate::server::AppState;

/// Fallback handler for all gateway traffic.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    match state.gateway.route(&path) {
        Route::Http => serve_http(&state, request).await,
        Route::WebSocket => serve_websocket(&state, request).await,
        Route::NotFound => {
            debug!(method = %request.method(), path = %path, "No route for request");
            problem_details::not_found(format!("no web actor handles '{path}'")).into_response()
        }
    }
}

// ============================================================================
// HTTP
// ============================================================================

async fn serve_http(state: &AppState, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let body = match Bytes::from_request(request, state).await {
        Ok(body) => body,
        Err(rejection) => {
            return problem_details::from_rejection(rejection.status(), rejection.body_text())
                .into_response();
        }
    };

    let exchange = state
        .gateway
        .serve_http(InboundRequest {
            method,
            uri,
            headers,
            body,
        })
        .await;

    let mut response = match exchange.outcome {
        Ok(HttpOutcome::Response(reply)) => render(reply),
        Ok(HttpOutcome::Stream(stream)) => render_stream(stream),
        Err(e) => problem_details::from_error(&e).into_response(),
    };
    if let Some(session_id) = exchange.new_session {
        let cookie = Cookie::session(state.gateway.cookie_name(), session_id);
        append_cookie(response.headers_mut(), &cookie);
    }
    response
}

fn render(reply: HttpResponse) -> Response {
    let status = reply.status();
    let mut headers = HeaderMap::new();
    apply_head(&reply, &mut headers);

    let body = reply.into_body().into_bytes();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    (status, headers, Body::from(body)).into_response()
}

fn render_stream(stream: EventStream) -> Response {
    let (head, body) = stream.into_parts();
    let mut headers = HeaderMap::new();
    apply_head(&head, &mut headers);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (head.status(), headers, Body::from_stream(body)).into_response()
}

fn apply_head(head: &HttpResponse, headers: &mut HeaderMap) {
    if let Some(location) = head.redirect_location() {
        insert_header(headers, header::LOCATION, location);
    }
    if let Some(content_type) = head.content_type() {
        insert_header(headers, header::CONTENT_TYPE, &content_type);
    }
    for (name, value) in head.headers() {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }
    for cookie in head.cookies() {
        append_cookie(headers, cookie);
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Skipping invalid response header"),
    }
}

fn append_cookie(headers: &mut HeaderMap, cookie: &Cookie) {
    match HeaderValue::from_str(&cookie.to_header_value()) {
        Ok(value) => {
            headers.append(header::SET_COOKIE, value);
        }
        Err(_) => warn!(cookie = %cookie.name, "Skipping invalid cookie"),
    }
}

// ============================================================================
// WebSocket
// ============================================================================

async fn serve_websocket(state: &AppState, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            return problem_details::from_rejection(rejection.status(), rejection.body_text())
                .into_response();
        }
    };

    let gateway = state.gateway.clone();
    let headers = HeaderView::new(parts.headers);
    let binding = match gateway.bind(&headers) {
        Ok(binding) => binding,
        Err(e) => return problem_details::from_error(&e).into_response(),
    };
    let cookie = binding
        .new_session
        .then(|| Cookie::session(gateway.cookie_name(), binding.session_id.clone()));

    // The actor learns about the stream only after the handshake has completed.
    let mut response = upgrade.on_upgrade(move |socket| run_socket(gateway, binding, socket));
    if let Some(cookie) = cookie {
        append_cookie(response.headers_mut(), &cookie);
    }
    response
}

async fn run_socket(gateway: Gateway, binding: Binding, mut socket: WebSocket) {
    let session = match gateway.open_websocket(&binding).await {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id = %binding.session_id, error = %e, "Closing WebSocket without an actor");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let (sink, stream) = socket.split();
    let reader = stream.map(inbound_frame);
    session.run(reader, SocketWriter(sink)).await;
}

fn inbound_frame(message: Result<Message, axum::Error>) -> Result<InboundFrame, TransportError> {
    match message {
        Ok(Message::Text(text)) => Ok(InboundFrame::Data(Payload::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(bytes)) => Ok(InboundFrame::Data(Payload::Binary(bytes))),
        Ok(Message::Ping(_) | Message::Pong(_)) => Ok(InboundFrame::Control),
        Ok(Message::Close(_)) => Ok(InboundFrame::Close),
        Err(e) => Err(TransportError::Io(e.to_string())),
    }
}

struct SocketWriter(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameWriter for SocketWriter {
    async fn send_frame(&mut self, payload: Payload) -> Result<(), TransportError> {
        let message = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
