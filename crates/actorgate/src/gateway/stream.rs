//! Long-lived connections: WebSocket sessions and SSE event streams.

use std::convert::Infallible;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

use super::transport::{FrameWriter, InboundFrame, TransportError};
use super::{Gateway, GatewayError, StreamGuard};
use crate::actor::{ActorHandle, ExitReason};
use crate::context::Binding;
use crate::envelope::{DataMessage, LifecycleExit, Payload, StreamKind, StreamOpened, WebMessage};
use crate::response::HttpResponse;
use crate::sink::{ConnectionKey, OutboundFrames, StreamSink};
use crate::sse;

/// Why a WebSocket session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of the inbound stream.
    ClientClosed,
    /// The actor closed the stream sink.
    ClosedByActor,
    ActorExited(ExitReason),
    TransportError(String),
    /// An inbound frame could not be enqueued in time.
    MailboxFull,
}

// ============================================================================
// Server-Sent Events
// ============================================================================

/// Body of an SSE response: encoded events plus keep-alive comments.
pub type EventBody = BoxStream<'static, Result<Bytes, Infallible>>;

/// An SSE response the actor opened with `HttpResponse::start_sse`.
pub struct EventStream {
    head: HttpResponse,
    body: EventBody,
}

impl EventStream {
    /// Status, headers and cookies of the reply that started the stream.
    pub fn head(&self) -> &HttpResponse {
        &self.head
    }

    pub fn into_parts(self) -> (HttpResponse, EventBody) {
        (self.head, self.body)
    }
}

struct EventState {
    key: ConnectionKey,
    frames: OutboundFrames,
    exit: BoxFuture<'static, LifecycleExit>,
    keep_alive: Option<Interval>,
    _guard: StreamGuard,
}

impl EventState {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;

            frame = self.frames.recv() => {
                if frame.is_none() {
                    debug!(connection = %self.key, "Event stream closed by actor");
                }
                frame.map(Payload::into_bytes)
            }
            exit = &mut self.exit => {
                debug!(connection = %self.key, reason = %exit.reason, "Event stream ended by actor exit");
                None
            }
            _ = tick(&mut self.keep_alive) => Some(Bytes::from_static(sse::KEEP_ALIVE_FRAME)),
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Gateway {
    /// Attach an SSE stream for the exchange identified by `key`.
    ///
    /// The actor receives `StreamOpened` with a sink that frames every push
    /// as one event.
    pub(super) async fn open_event_stream(
        &self,
        binding: &Binding,
        key: ConnectionKey,
        head: HttpResponse,
    ) -> Result<EventStream, GatewayError> {
        let (sink, frames) = StreamSink::channel(key.clone(), StreamKind::Sse, self.config().stream_buffer);
        let guard = self.stream_guard();
        let exit = binding.actor.watch().exited().boxed();

        let opened = StreamOpened {
            kind: StreamKind::Sse,
            reply_to: sse::adapt(&sink),
        };
        self.deliver(&binding.actor, WebMessage::StreamOpened(opened)).await?;
        debug!(connection = %key, "Event stream opened");

        let keep_alive = self.config().keep_alive_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let state = EventState {
            key,
            frames,
            exit,
            keep_alive,
            _guard: guard,
        };
        let body = stream::unfold(state, |mut state| async move {
            let chunk = state.next_chunk().await?;
            Some((Ok(chunk), state))
        })
        .boxed();

        Ok(EventStream { head, body })
    }
}

// ============================================================================
// WebSocket
// ============================================================================

/// An accepted WebSocket connection bound to its session actor.
pub struct WebSocketSession {
    gateway: Gateway,
    key: ConnectionKey,
    actor: ActorHandle,
    sink: StreamSink,
    frames: OutboundFrames,
    _guard: StreamGuard,
}

impl Gateway {
    /// Attach an upgraded WebSocket connection to the bound actor.
    ///
    /// Call once the handshake has completed. The actor receives
    /// `StreamOpened` before any data frame.
    pub async fn open_websocket(&self, binding: &Binding) -> Result<WebSocketSession, GatewayError> {
        let key = self.next_key(&binding.session_id);
        let (sink, frames) =
            StreamSink::channel(key.clone(), StreamKind::WebSocket, self.config().stream_buffer);
        let guard = self.stream_guard();

        let opened = StreamOpened {
            kind: StreamKind::WebSocket,
            reply_to: sink.clone(),
        };
        self.deliver(&binding.actor, WebMessage::StreamOpened(opened)).await?;
        debug!(connection = %key, "WebSocket opened");

        Ok(WebSocketSession {
            gateway: self.clone(),
            key,
            actor: binding.actor.clone(),
            sink,
            frames,
            _guard: guard,
        })
    }
}

impl WebSocketSession {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Pump frames in both directions until either side ends the connection.
    ///
    /// Inbound data frames reach the actor as `Data` envelopes in arrival
    /// order. The session actor outlives the connection.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> CloseReason
    where
        R: Stream<Item = Result<InboundFrame, TransportError>> + Send + Unpin,
        W: FrameWriter,
    {
        let Self {
            gateway,
            key,
            actor,
            sink,
            mut frames,
            _guard,
        } = self;

        let exit = actor.watch().exited();

        let outbound = async {
            while let Some(frame) = frames.recv().await {
                if let Err(e) = writer.send_frame(frame).await {
                    return CloseReason::TransportError(e.to_string());
                }
            }
            CloseReason::ClosedByActor
        };

        let inbound = async {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(InboundFrame::Data(payload)) => {
                        let msg = WebMessage::Data(DataMessage {
                            payload,
                            from: sink.clone(),
                        });
                        match gateway.deliver(&actor, msg).await {
                            Ok(()) => {}
                            Err(GatewayError::ActorDead(reason)) => {
                                return CloseReason::ActorExited(reason);
                            }
                            // deliver fails only on a full or closed mailbox
                            Err(_) => return CloseReason::MailboxFull,
                        }
                    }
                    Ok(InboundFrame::Control) => {}
                    Ok(InboundFrame::Close) => return CloseReason::ClientClosed,
                    Err(e) => return CloseReason::TransportError(e.to_string()),
                }
            }
            CloseReason::ClientClosed
        };

        let reason = tokio::select! {
            reason = outbound => reason,
            reason = inbound => reason,
            exit = exit => CloseReason::ActorExited(exit.reason),
        };

        // Frames the actor queued before exiting still reach the client.
        if matches!(reason, CloseReason::ActorExited(_)) {
            while let Some(frame) = frames.try_recv() {
                if writer.send_frame(frame).await.is_err() {
                    break;
                }
            }
        }
        if !matches!(
            reason,
            CloseReason::ClientClosed | CloseReason::TransportError(_)
        ) {
            let _ = writer.close().await;
        }

        debug!(connection = %key, reason = ?reason, "WebSocket closed");
        reason
    }
}
