//! Plain HTTP exchanges: one request, exactly one reply.

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use super::stream::EventStream;
use super::{EXIT_GRACE, Gateway, GatewayError};
use crate::actor::Watch;
use crate::context::Binding;
use crate::envelope::{HttpRequest, WebMessage};
use crate::headers::HeaderView;
use crate::patterns::Route;
use crate::response::HttpResponse;
use crate::sink::{ConnectionKey, ResponseSink};

/// A fully read HTTP request handed over by the transport.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the transport writes back.
pub enum HttpOutcome {
    Response(HttpResponse),
    /// The actor started a Server-Sent Events stream.
    Stream(EventStream),
}

/// Result of [`Gateway::serve_http`].
pub struct HttpExchange {
    /// Id of the session created for this request; the transport issues
    /// the session cookie for it.
    pub new_session: Option<String>,
    pub outcome: Result<HttpOutcome, GatewayError>,
}

impl HttpExchange {
    fn failed(error: GatewayError) -> Self {
        Self {
            new_session: None,
            outcome: Err(error),
        }
    }
}

impl Gateway {
    /// Route an HTTP request to its session actor and await the reply.
    ///
    /// Unrouted paths fail with `NotFound` before any session is touched.
    /// The wait for the reply is bounded by `reply_timeout`.
    pub async fn serve_http(&self, request: InboundRequest) -> HttpExchange {
        let InboundRequest {
            method,
            uri,
            headers,
            body,
        } = request;

        if self.route(uri.path()) != Route::Http {
            return HttpExchange::failed(GatewayError::NotFound(uri.path().to_string()));
        }

        let headers = HeaderView::new(headers);
        let binding = match self.bind(&headers) {
            Ok(binding) => binding,
            Err(e) => return HttpExchange::failed(e),
        };

        let new_session = binding.new_session.then(|| binding.session_id.clone());
        let key = self.next_key(&binding.session_id);
        let (reply_to, reply) = ResponseSink::channel(key.clone());
        let request = HttpRequest::new(
            method,
            uri,
            headers,
            body,
            binding.session_id.clone(),
            reply_to,
        );

        let outcome = self.exchange(&binding, key, request, reply).await;
        HttpExchange {
            new_session,
            outcome,
        }
    }

    async fn exchange(
        &self,
        binding: &Binding,
        key: ConnectionKey,
        request: HttpRequest,
        reply: oneshot::Receiver<HttpResponse>,
    ) -> Result<HttpOutcome, GatewayError> {
        let watch = binding.actor.watch();
        self.deliver(&binding.actor, WebMessage::Http(request)).await?;

        let response = self.await_reply(&key, reply, watch).await?;
        if response.keeps_open() {
            let stream = self.open_event_stream(binding, key, response).await?;
            return Ok(HttpOutcome::Stream(stream));
        }
        Ok(HttpOutcome::Response(response))
    }

    async fn await_reply(
        &self,
        key: &ConnectionKey,
        reply: oneshot::Receiver<HttpResponse>,
        watch: Watch,
    ) -> Result<HttpResponse, GatewayError> {
        let timeout = self.config().reply_timeout;
        let deadline = Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(response)) => Ok(response),
            // Sink dropped unanswered; report the exit if the actor died.
            Ok(Err(_)) => {
                let grace = deadline.min(Instant::now() + EXIT_GRACE);
                match tokio::time::timeout_at(grace, watch.exited()).await {
                    Ok(exit) => Err(GatewayError::ActorDead(exit.reason)),
                    Err(_) => {
                        warn!(connection = %key, "Actor dropped HTTP request without replying");
                        Err(GatewayError::NoReply)
                    }
                }
            }
            Err(_) => {
                warn!(connection = %key, timeout = ?timeout, "Timed out waiting for actor reply");
                Err(GatewayError::Timeout(timeout))
            }
        }
    }
}
