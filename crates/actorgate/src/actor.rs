//! Session-bound web actors.
//!
//! Each actor runs as its own task with a bounded mailbox and processes
//! envelopes strictly in arrival order. A supervisor task observes how the
//! actor ended (normal return, error, panic or external stop) and publishes
//! exactly one [`ExitReason`] to every [`Watch`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{LifecycleExit, WebMessage};
use crate::sink::{SinkError, StreamSink};

// ============================================================================
// Identity & Exit
// ============================================================================

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique actor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    fn next() -> Self {
        Self(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// How an actor terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The actor stopped itself or every handle to it was dropped.
    Normal,
    /// Stopped from outside via [`ActorHandle::stop`].
    Stopped,
    /// The actor returned an error or panicked.
    Failed(String),
}

impl ExitReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Client-facing description used when a request hits a dead actor.
    pub fn describe(&self) -> String {
        match self {
            Self::Failed(cause) => format!("actor is dead because of {cause}"),
            Self::Normal | Self::Stopped => "actor has finished".to_string(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "finished"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error returned from actor callbacks. Terminates the actor.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl ActorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("actor mailbox is full")]
    Full,

    #[error("actor has terminated")]
    Closed,
}

// ============================================================================
// WebActor
// ============================================================================

/// Application logic bound to one session.
///
/// `handle` is never called concurrently for the same actor. Returning an
/// error terminates the actor with [`ExitReason::Failed`].
#[async_trait]
pub trait WebActor: Send + 'static {
    async fn started(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    async fn handle(&mut self, msg: WebMessage, ctx: &mut ActorContext) -> Result<(), ActorError>;

    /// Runs after the message loop ends, except when the actor panicked.
    async fn stopping(&mut self, _reason: &ExitReason) {}
}

// ============================================================================
// Actor Context
// ============================================================================

/// Per-actor capabilities available inside callbacks.
pub struct ActorContext {
    id: ActorId,
    session_id: String,
    mailbox: mpsc::WeakSender<WebMessage>,
    /// Cancelled once the actor has exited; ends watch tasks.
    lifetime: CancellationToken,
    stop_requested: bool,
}

impl ActorContext {
    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop after the current message with [`ExitReason::Normal`].
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Receive `WebMessage::Exit` once `actor` terminates.
    pub fn watch_actor(&self, actor: &ActorHandle) {
        let watch = actor.watch();
        let mailbox = self.mailbox.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                exit = watch.exited() => {
                    if let Some(tx) = mailbox.upgrade() {
                        let _ = tx.send(WebMessage::Exit(exit)).await;
                    }
                }
            }
        });
    }

    /// Receive `WebMessage::StreamClosed` once the connection behind `sink`
    /// goes away or the sink is closed.
    pub fn watch_stream(&self, sink: &StreamSink) {
        let sink = sink.clone();
        let mailbox = self.mailbox.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                _ = sink.closed() => {
                    if let Some(tx) = mailbox.upgrade() {
                        let _ = tx.send(WebMessage::StreamClosed(sink.key().clone())).await;
                    }
                }
            }
        });
    }
}

// ============================================================================
// Actor Handle
// ============================================================================

/// Cheap-to-clone reference to a running actor.
#[derive(Clone)]
pub struct ActorHandle {
    id: ActorId,
    tx: mpsc::Sender<WebMessage>,
    stop: CancellationToken,
    exit: watch::Receiver<Option<ExitReason>>,
}

impl ActorHandle {
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Enqueue `msg`, waiting at most `timeout` for mailbox space.
    pub async fn send(&self, msg: WebMessage, timeout: Duration) -> Result<(), MailboxError> {
        match self.tx.send_timeout(msg, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(MailboxError::Full),
            Err(SendTimeoutError::Closed(_)) => Err(MailboxError::Closed),
        }
    }

    pub fn try_send(&self, msg: WebMessage) -> Result<(), MailboxError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => MailboxError::Full,
            TrySendError::Closed(_) => MailboxError::Closed,
        })
    }

    /// Ask the actor to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.exit.borrow().is_some() || self.tx.is_closed()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit.borrow().clone()
    }

    /// Register interest in this actor's termination.
    pub fn watch(&self) -> Watch {
        Watch {
            actor: self.id,
            rx: self.exit.clone(),
        }
    }
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl PartialEq for ActorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActorHandle {}

/// A pending exit notification for one actor.
///
/// Resolves exactly once; dropping it cancels the registration.
pub struct Watch {
    actor: ActorId,
    rx: watch::Receiver<Option<ExitReason>>,
}

impl Watch {
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub async fn exited(mut self) -> LifecycleExit {
        let reason = match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(ExitReason::Stopped),
            // Supervisor gone without publishing: runtime shutting down.
            Err(_) => ExitReason::Stopped,
        };
        LifecycleExit {
            actor: self.actor,
            reason,
        }
    }
}

// ============================================================================
// Spawning
// ============================================================================

/// Spawn `actor` for `session_id` with a mailbox of `mailbox_capacity`.
pub fn spawn_actor(
    actor: Box<dyn WebActor>,
    session_id: impl Into<String>,
    mailbox_capacity: usize,
) -> ActorHandle {
    let id = ActorId::next();
    let session_id = session_id.into();
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let (exit_tx, exit_rx) = watch::channel(None);
    let stop = CancellationToken::new();
    let lifetime = CancellationToken::new();

    let ctx = ActorContext {
        id,
        session_id: session_id.clone(),
        mailbox: tx.downgrade(),
        lifetime: lifetime.clone(),
        stop_requested: false,
    };
    let task = tokio::spawn(run(actor, rx, ctx, stop.clone()));

    // Supervisor: the only publisher of the exit reason.
    tokio::spawn(async move {
        let reason = match task.await {
            Ok(reason) => reason,
            Err(e) if e.is_panic() => ExitReason::Failed(panic_message(e.into_panic())),
            Err(_) => ExitReason::Stopped,
        };
        match &reason {
            ExitReason::Failed(cause) => {
                warn!(session_id = %session_id, actor = %id, error = %cause, "Web actor failed");
            }
            _ => debug!(session_id = %session_id, actor = %id, reason = %reason, "Web actor exited"),
        }
        lifetime.cancel();
        exit_tx.send_replace(Some(reason));
    });

    ActorHandle {
        id,
        tx,
        stop,
        exit: exit_rx,
    }
}

async fn run(
    mut actor: Box<dyn WebActor>,
    mut mailbox: mpsc::Receiver<WebMessage>,
    mut ctx: ActorContext,
    stop: CancellationToken,
) -> ExitReason {
    debug!(session_id = %ctx.session_id, actor = %ctx.id, "Web actor started");

    let reason = match actor.started(&mut ctx).await {
        Ok(()) => message_loop(actor.as_mut(), &mut mailbox, &mut ctx, &stop).await,
        Err(e) => ExitReason::Failed(e.to_string()),
    };

    // Reject further sends before running cleanup.
    mailbox.close();
    actor.stopping(&reason).await;
    reason
}

async fn message_loop(
    actor: &mut dyn WebActor,
    mailbox: &mut mpsc::Receiver<WebMessage>,
    ctx: &mut ActorContext,
    stop: &CancellationToken,
) -> ExitReason {
    loop {
        if ctx.stop_requested {
            return ExitReason::Normal;
        }

        tokio::select! {
            biased;

            _ = stop.cancelled() => return ExitReason::Stopped,

            msg = mailbox.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = actor.handle(msg, ctx).await {
                        return ExitReason::Failed(e.to_string());
                    }
                }
                None => return ExitReason::Normal,
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "actor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{Notify, mpsc::UnboundedSender};

    use super::*;
    use crate::envelope::{DataMessage, Payload, StreamKind, StreamOpened};
    use crate::sink::ConnectionKey;

    const SEND_TIMEOUT: Duration = Duration::from_millis(100);

    /// Forwards data payloads and notifications to the test.
    struct Probe {
        events: UnboundedSender<String>,
        watch_on_start: Option<ActorHandle>,
    }

    #[async_trait]
    impl WebActor for Probe {
        async fn started(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
            if let Some(other) = &self.watch_on_start {
                ctx.watch_actor(other);
            }
            Ok(())
        }

        async fn handle(&mut self, msg: WebMessage, ctx: &mut ActorContext) -> Result<(), ActorError> {
            match msg {
                WebMessage::Data(data) => match data.payload.as_text() {
                    Some("die") => return Err(ActorError::failed("die")),
                    Some("panic") => panic!("boom"),
                    Some("quit") => ctx.stop(),
                    Some(text) => {
                        let _ = self.events.send(text.to_string());
                    }
                    None => {}
                },
                WebMessage::StreamOpened(opened) => ctx.watch_stream(&opened.reply_to),
                WebMessage::StreamClosed(key) => {
                    let _ = self.events.send(format!("closed {key}"));
                }
                WebMessage::Exit(exit) => {
                    let _ = self.events.send(format!("exit {}", exit.reason));
                }
                WebMessage::Http(_) => {}
            }
            Ok(())
        }
    }

    /// Blocks forever on its first message.
    struct Stuck(Arc<Notify>);

    #[async_trait]
    impl WebActor for Stuck {
        async fn handle(&mut self, _msg: WebMessage, _ctx: &mut ActorContext) -> Result<(), ActorError> {
            self.0.notified().await;
            Ok(())
        }
    }

    fn recording() -> (ActorHandle, mpsc::UnboundedReceiver<String>) {
        let (events, rx) = mpsc::unbounded_channel();
        let actor = Probe {
            events,
            watch_on_start: None,
        };
        (spawn_actor(Box::new(actor), "sess_rec", 16), rx)
    }

    fn sink(n: u64) -> StreamSink {
        StreamSink::channel(ConnectionKey::new("sess_rec", n), StreamKind::WebSocket, 4).0
    }

    fn data(text: &str) -> WebMessage {
        WebMessage::Data(DataMessage {
            payload: Payload::from(text),
            from: sink(1),
        })
    }

    #[tokio::test]
    async fn processes_messages_in_send_order() {
        let (actor, mut events) = recording();
        for i in 0..50 {
            actor.send(data(&format!("m{i}")), SEND_TIMEOUT).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(events.recv().await.unwrap(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn handler_error_fails_actor() {
        let (actor, _events) = recording();
        let watch = actor.watch();
        actor.send(data("die"), SEND_TIMEOUT).await.unwrap();

        let exit = watch.exited().await;
        assert_eq!(exit.actor, actor.id());
        assert_eq!(exit.reason, ExitReason::Failed("die".to_string()));
        assert!(actor.is_terminated());
        assert_eq!(
            actor.send(data("late"), SEND_TIMEOUT).await,
            Err(MailboxError::Closed)
        );
    }

    #[tokio::test]
    async fn panic_is_reported_as_failure() {
        let (actor, _events) = recording();
        let watch = actor.watch();
        actor.send(data("panic"), SEND_TIMEOUT).await.unwrap();

        let exit = watch.exited().await;
        assert_eq!(exit.reason, ExitReason::Failed("boom".to_string()));
        assert_eq!(exit.reason.describe(), "actor is dead because of boom");
    }

    #[tokio::test]
    async fn self_stop_is_normal_exit() {
        let (actor, _events) = recording();
        let watch = actor.watch();
        actor.send(data("quit"), SEND_TIMEOUT).await.unwrap();
        assert_eq!(watch.exited().await.reason, ExitReason::Normal);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_notifies_each_watcher_once() {
        let (actor, _events) = recording();
        let watches: Vec<_> = (0..3).map(|_| actor.watch()).collect();

        actor.stop();
        actor.stop();

        for watch in watches {
            let exit = watch.exited().await;
            assert_eq!(exit.reason, ExitReason::Stopped);
        }
        assert_eq!(actor.exit_reason(), Some(ExitReason::Stopped));

        // Watching after the fact still resolves immediately.
        assert_eq!(actor.watch().exited().await.reason, ExitReason::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn full_mailbox_fails_after_bounded_wait() {
        let release = Arc::new(Notify::new());
        let actor = spawn_actor(Box::new(Stuck(release.clone())), "sess_stuck", 1);

        actor.send(data("a"), SEND_TIMEOUT).await.unwrap();
        actor.send(data("b"), SEND_TIMEOUT).await.unwrap();
        assert_eq!(
            actor.send(data("c"), SEND_TIMEOUT).await,
            Err(MailboxError::Full)
        );
        assert_eq!(actor.try_send(data("d")), Err(MailboxError::Full));
        actor.stop();
        release.notify_one();
    }

    #[tokio::test]
    async fn watch_actor_delivers_exit_message() {
        let (target, _target_events) = recording();
        let (events, mut rx) = mpsc::unbounded_channel();
        let watcher = spawn_actor(
            Box::new(Probe {
                events,
                watch_on_start: Some(target.clone()),
            }),
            "sess_watcher",
            16,
        );

        target.send(data("die"), SEND_TIMEOUT).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "exit failed: die");
        assert!(!watcher.is_terminated());
    }

    #[tokio::test]
    async fn watch_stream_delivers_closed_message() {
        let (actor, mut events) = recording();
        let (stream, frames) =
            StreamSink::channel(ConnectionKey::new("sess_rec", 9), StreamKind::WebSocket, 4);
        actor
            .send(
                WebMessage::StreamOpened(StreamOpened {
                    kind: StreamKind::WebSocket,
                    reply_to: stream,
                }),
                SEND_TIMEOUT,
            )
            .await
            .unwrap();

        drop(frames);
        assert_eq!(events.recv().await.unwrap(), "closed sess_rec#9");
        assert!(!actor.is_terminated());
    }
}
