//! Transport-agnostic gateway core.
//!
//! The gateway resolves the session for an inbound request, wraps the
//! transport event in an envelope, enqueues it to the session actor and
//! adapts the actor's replies back to the connection. Transports plug in
//! through [`FrameWriter`] and an inbound frame stream; see
//! `handlers::gateway` for the axum binding.

mod exchange;
mod stream;
mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::actor::{ActorHandle, ExitReason, MailboxError};
use crate::context::{Binding, Context, ContextError, resolve_binding};
use crate::envelope::WebMessage;
use crate::headers::HeaderView;
use crate::patterns::Route;
use crate::sink::ConnectionKey;

pub use exchange::{HttpExchange, HttpOutcome, InboundRequest};
pub use stream::{CloseReason, EventBody, EventStream, WebSocketSession};
pub use transport::{FrameWriter, InboundFrame, TransportError};

/// How long to wait for an exit notification once a mailbox or reply sink
/// reports the actor gone.
const EXIT_GRACE: Duration = Duration::from_millis(500);

// ============================================================================
// Configuration & Errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on waiting for the reply to an HTTP request.
    pub reply_timeout: Duration,
    /// Upper bound on waiting for space in a full actor mailbox.
    pub mailbox_send_timeout: Duration,
    /// Outbound frames buffered per stream connection.
    pub stream_buffer: usize,
    /// Comment frames on idle SSE streams; `None` disables them.
    pub keep_alive_interval: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            mailbox_send_timeout: Duration::from_secs(1),
            stream_buffer: 64,
            keep_alive_interval: Some(Duration::from_secs(15)),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no web actor handles '{0}'")]
    NotFound(String),

    #[error("{message}")]
    SessionRejected { status: StatusCode, message: String },

    #[error("failed to create actor: {0}")]
    ActorCreation(String),

    #[error("actor mailbox is full")]
    MailboxFull,

    #[error("{}", .0.describe())]
    ActorDead(ExitReason),

    #[error("actor did not answer the request")]
    NoReply,

    #[error("actor did not answer within {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionRejected { status, .. } => *status,
            Self::ActorCreation(_) | Self::ActorDead(_) | Self::NoReply => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::MailboxFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<ContextError> for GatewayError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::ActorCreation(msg) => Self::ActorCreation(msg),
            ContextError::Rejected { status, message } => Self::SessionRejected { status, message },
        }
    }
}

// ============================================================================
// Gateway
// ============================================================================

struct GatewayInner {
    context: Arc<dyn Context>,
    config: GatewayConfig,
    next_connection: AtomicU64,
    open_streams: Arc<AtomicUsize>,
}

/// Shared gateway core. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(context: Arc<dyn Context>, config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                context,
                config,
                next_connection: AtomicU64::new(1),
                open_streams: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn context(&self) -> &dyn Context {
        self.inner.context.as_ref()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn cookie_name(&self) -> &str {
        self.inner.context.cookie_name()
    }

    /// Classify a request path.
    pub fn route(&self, path: &str) -> Route {
        self.inner.context.route(path)
    }

    /// Resolve the session and actor for a request.
    pub fn bind(&self, headers: &HeaderView) -> Result<Binding, GatewayError> {
        Ok(resolve_binding(self.context(), headers)?)
    }

    /// Number of open WebSocket and SSE connections.
    pub fn active_streams(&self) -> usize {
        self.inner.open_streams.load(Ordering::Relaxed)
    }

    fn next_key(&self, session_id: &str) -> ConnectionKey {
        let n = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        ConnectionKey::new(session_id, n)
    }

    fn stream_guard(&self) -> StreamGuard {
        self.inner.open_streams.fetch_add(1, Ordering::Relaxed);
        StreamGuard(self.inner.open_streams.clone())
    }

    /// Enqueue an envelope, waiting a bounded time for mailbox space.
    async fn deliver(&self, actor: &ActorHandle, msg: WebMessage) -> Result<(), GatewayError> {
        let kind = msg.kind();
        match actor.send(msg, self.inner.config.mailbox_send_timeout).await {
            Ok(()) => Ok(()),
            Err(MailboxError::Full) => {
                warn!(
                    actor = %actor.id(),
                    envelope = kind,
                    timeout = ?self.inner.config.mailbox_send_timeout,
                    "Actor mailbox full, failing delivery"
                );
                Err(GatewayError::MailboxFull)
            }
            Err(MailboxError::Closed) => Err(GatewayError::ActorDead(exit_reason(actor).await)),
        }
    }
}

/// Exit reason of an actor whose mailbox is already closed.
async fn exit_reason(actor: &ActorHandle) -> ExitReason {
    match tokio::time::timeout(EXIT_GRACE, actor.watch().exited()).await {
        Ok(exit) => exit.reason,
        Err(_) => ExitReason::Stopped,
    }
}

/// Counts an open stream connection until dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
