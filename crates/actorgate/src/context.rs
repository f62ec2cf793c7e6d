//! Context resolution: which actor serves a request, and under which session.
//!
//! A [`Context`] is supplied by the embedding application. The gateway only
//! talks to it through this trait: path classification, session id
//! extraction, actor resolution and the policy applied when a presented
//! session is no longer known.

use std::sync::Arc;

use http::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::actor::{ActorError, ActorHandle, WebActor, spawn_actor};
use crate::headers::HeaderView;
use crate::patterns::{Route, UrlPatterns};
use crate::registry::{self, Resolved, SessionRegistry};

/// Default session cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "JSESSIONID";

/// Default actor mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

// ============================================================================
// Policy Types
// ============================================================================

/// What a presented session id means once its actor has terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPolicy {
    /// The session is gone; the client goes through [`Context::restart`].
    #[default]
    Die,
    /// A new actor is created under the same session id.
    Restart,
}

/// Decision for a request presenting an unknown session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Silently mint a new session.
    NewSession,
    /// Fail the request.
    Reject { status: StatusCode, message: String },
}

/// Where a request's session id came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIdSource {
    /// Read from the session cookie.
    Presented(String),
    /// Generated because no usable cookie was sent.
    Fresh(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to create actor: {0}")]
    ActorCreation(String),

    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
}

/// The session and actor a request is bound to.
#[derive(Debug, Clone)]
pub struct Binding {
    pub session_id: String,
    pub actor: ActorHandle,
    /// The client must be told about this session (set the cookie).
    pub new_session: bool,
}

// ============================================================================
// Context
// ============================================================================

/// Capability interface the gateway resolves requests through.
pub trait Context: Send + Sync + 'static {
    fn handles_with_http(&self, path: &str) -> bool;

    fn handles_with_websocket(&self, path: &str) -> bool;

    /// Classify a path. Ambiguous or unmatched paths are not handled.
    fn route(&self, path: &str) -> Route {
        match (self.handles_with_http(path), self.handles_with_websocket(path)) {
            (true, false) => Route::Http,
            (false, true) => Route::WebSocket,
            (true, true) => {
                warn!(path, "Path claimed by both HTTP and WebSocket routes");
                Route::NotFound
            }
            (false, false) => Route::NotFound,
        }
    }

    fn cookie_name(&self) -> &str;

    fn new_session_id(&self) -> String {
        registry::new_session_id()
    }

    /// Session id from the cookie, or a fresh one if absent or invalid.
    fn session_id(&self, headers: &HeaderView) -> SessionIdSource {
        match headers.cookie(self.cookie_name()) {
            Some(id) if registry::is_valid_session_id(id) => SessionIdSource::Presented(id.to_string()),
            _ => SessionIdSource::Fresh(self.new_session_id()),
        }
    }

    /// Live actor for `session_id`, created if absent.
    fn actor(&self, session_id: &str) -> Result<Resolved, ContextError>;

    /// Live actor for `session_id` without creating one.
    fn existing_actor(&self, session_id: &str) -> Option<ActorHandle>;

    /// Called when a presented session id is unknown under [`WatchPolicy::Die`].
    fn restart(&self, _headers: &HeaderView) -> RestartDecision {
        RestartDecision::NewSession
    }

    fn watch_policy(&self) -> WatchPolicy;
}

/// Bind a request to a session and its actor.
///
/// ```text
/// no usable cookie            -> fresh id, new actor
/// presented, actor alive      -> that actor
/// presented, unknown, RESTART -> new actor under the same id
/// presented, unknown, DIE     -> Context::restart decides
/// ```
pub fn resolve_binding(ctx: &dyn Context, headers: &HeaderView) -> Result<Binding, ContextError> {
    let session_id = match ctx.session_id(headers) {
        SessionIdSource::Fresh(id) => return bind_new(ctx, id),
        SessionIdSource::Presented(id) => id,
    };

    match ctx.watch_policy() {
        WatchPolicy::Restart => {
            let resolved = ctx.actor(&session_id)?;
            if resolved.created {
                debug!(session_id = %session_id, "Session restarted under presented id");
            }
            Ok(Binding {
                session_id,
                actor: resolved.actor,
                new_session: resolved.created,
            })
        }
        WatchPolicy::Die => match ctx.existing_actor(&session_id) {
            Some(actor) => Ok(Binding {
                session_id,
                actor,
                new_session: false,
            }),
            None => match ctx.restart(headers) {
                RestartDecision::NewSession => {
                    debug!(session_id = %session_id, "Unknown session presented, starting a new one");
                    bind_new(ctx, ctx.new_session_id())
                }
                RestartDecision::Reject { status, message } => {
                    debug!(session_id = %session_id, status = %status, "Unknown session rejected");
                    Err(ContextError::Rejected { status, message })
                }
            },
        },
    }
}

fn bind_new(ctx: &dyn Context, session_id: String) -> Result<Binding, ContextError> {
    let resolved = ctx.actor(&session_id)?;
    Ok(Binding {
        session_id,
        actor: resolved.actor,
        new_session: true,
    })
}

// ============================================================================
// Default Context
// ============================================================================

/// Builds the actor for a new session.
pub type ActorFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn WebActor>, ActorError> + Send + Sync>;

/// Pattern-routed context backed by a [`SessionRegistry`].
pub struct DefaultContext {
    patterns: UrlPatterns,
    registry: SessionRegistry,
    factory: ActorFactory,
    cookie_name: String,
    watch_policy: WatchPolicy,
    mailbox_capacity: usize,
}

impl DefaultContext {
    pub fn new(patterns: UrlPatterns, registry: SessionRegistry, factory: ActorFactory) -> Self {
        Self {
            patterns,
            registry,
            factory,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            watch_policy: WatchPolicy::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn with_watch_policy(mut self, policy: WatchPolicy) -> Self {
        self.watch_policy = policy;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl Context for DefaultContext {
    fn handles_with_http(&self, path: &str) -> bool {
        self.patterns.classify(path) == Route::Http
    }

    fn handles_with_websocket(&self, path: &str) -> bool {
        self.patterns.classify(path) == Route::WebSocket
    }

    fn route(&self, path: &str) -> Route {
        self.patterns.classify(path)
    }

    fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn actor(&self, session_id: &str) -> Result<Resolved, ContextError> {
        self.registry.resolve(session_id, |id| {
            let behavior = (self.factory)(id).map_err(|e| {
                warn!(session_id = %id, error = %e, "Failed to create web actor");
                ContextError::ActorCreation(e.to_string())
            })?;
            Ok(spawn_actor(behavior, id, self.mailbox_capacity))
        })
    }

    fn existing_actor(&self, session_id: &str) -> Option<ActorHandle> {
        self.registry.lookup(session_id)
    }

    fn watch_policy(&self) -> WatchPolicy {
        self.watch_policy
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http::{HeaderMap, HeaderValue, header};

    use super::*;
    use crate::actor::ActorContext;
    use crate::envelope::WebMessage;

    struct Idle;

    #[async_trait]
    impl WebActor for Idle {
        async fn handle(&mut self, _msg: WebMessage, _ctx: &mut ActorContext) -> Result<(), ActorError> {
            Ok(())
        }
    }

    fn idle_factory() -> ActorFactory {
        Arc::new(|_: &str| Ok(Box::new(Idle) as Box<dyn WebActor>))
    }

    fn context(policy: WatchPolicy) -> DefaultContext {
        let patterns = UrlPatterns::from_lists(&["/*"], &["/ws"]).unwrap();
        DefaultContext::new(patterns, SessionRegistry::new(), idle_factory()).with_watch_policy(policy)
    }

    fn with_cookie(value: &str) -> HeaderView {
        let mut map = HeaderMap::new();
        map.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{DEFAULT_COOKIE_NAME}={value}")).unwrap(),
        );
        HeaderView::new(map)
    }

    /// Rejects unknown sessions instead of minting new ones.
    struct Strict(DefaultContext);

    impl Context for Strict {
        fn handles_with_http(&self, path: &str) -> bool {
            self.0.handles_with_http(path)
        }
        fn handles_with_websocket(&self, path: &str) -> bool {
            self.0.handles_with_websocket(path)
        }
        fn cookie_name(&self) -> &str {
            self.0.cookie_name()
        }
        fn actor(&self, session_id: &str) -> Result<Resolved, ContextError> {
            self.0.actor(session_id)
        }
        fn existing_actor(&self, session_id: &str) -> Option<ActorHandle> {
            self.0.existing_actor(session_id)
        }
        fn restart(&self, _headers: &HeaderView) -> RestartDecision {
            RestartDecision::Reject {
                status: StatusCode::GONE,
                message: "session expired".to_string(),
            }
        }
        fn watch_policy(&self) -> WatchPolicy {
            WatchPolicy::Die
        }
    }

    #[test]
    fn routes_are_mutually_exclusive() {
        let ctx = context(WatchPolicy::Die);
        assert!(ctx.handles_with_websocket("/ws"));
        assert!(!ctx.handles_with_http("/ws"));
        assert!(ctx.handles_with_http("/"));
        assert!(!ctx.handles_with_websocket("/"));
        assert_eq!(ctx.route("/ws"), Route::WebSocket);
    }

    #[tokio::test]
    async fn missing_cookie_creates_session() {
        let ctx = context(WatchPolicy::Die);
        let binding = resolve_binding(&ctx, &HeaderView::default()).unwrap();

        assert!(binding.new_session);
        assert!(binding.session_id.starts_with(registry::SESSION_ID_PREFIX));
        assert!(ctx.registry().contains(&binding.session_id));
    }

    #[tokio::test]
    async fn known_cookie_reuses_actor() {
        let ctx = context(WatchPolicy::Die);
        let first = resolve_binding(&ctx, &HeaderView::default()).unwrap();
        let second = resolve_binding(&ctx, &with_cookie(&first.session_id)).unwrap();

        assert!(!second.new_session);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.actor, first.actor);
    }

    #[tokio::test]
    async fn invalid_cookie_is_treated_as_absent() {
        let ctx = context(WatchPolicy::Restart);
        let binding = resolve_binding(&ctx, &with_cookie("not valid!")).unwrap();
        assert!(binding.new_session);
        assert_ne!(binding.session_id, "not valid!");
    }

    #[tokio::test]
    async fn restart_policy_recreates_under_presented_id() {
        let ctx = context(WatchPolicy::Restart);
        let binding = resolve_binding(&ctx, &with_cookie("sess_gone")).unwrap();

        assert!(binding.new_session);
        assert_eq!(binding.session_id, "sess_gone");

        binding.actor.stop();
        binding.actor.watch().exited().await;

        let again = resolve_binding(&ctx, &with_cookie("sess_gone")).unwrap();
        assert_eq!(again.session_id, "sess_gone");
        assert_ne!(again.actor, binding.actor);
    }

    #[tokio::test]
    async fn die_policy_mints_new_session_for_unknown_id() {
        let ctx = context(WatchPolicy::Die);
        let binding = resolve_binding(&ctx, &with_cookie("sess_gone")).unwrap();

        assert!(binding.new_session);
        assert_ne!(binding.session_id, "sess_gone");
        assert!(!ctx.registry().contains("sess_gone"));
    }

    #[tokio::test]
    async fn restart_hook_can_reject() {
        let ctx = Strict(context(WatchPolicy::Die));
        let err = resolve_binding(&ctx, &with_cookie("sess_gone")).unwrap_err();
        match err {
            ContextError::Rejected { status, .. } => assert_eq!(status, StatusCode::GONE),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn factory_failure_registers_nothing() {
        let factory: ActorFactory =
            Arc::new(|_: &str| -> Result<Box<dyn WebActor>, ActorError> {
                Err(ActorError::failed("no actors today"))
            });
        let ctx = DefaultContext::new(UrlPatterns::new().http("/").unwrap(), SessionRegistry::new(), factory);

        let err = resolve_binding(&ctx, &HeaderView::default()).unwrap_err();
        assert!(matches!(err, ContextError::ActorCreation(msg) if msg.contains("no actors today")));
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn factory_can_inspect_the_registry() {
        let registry = SessionRegistry::new();
        let seen = registry.clone();
        let factory: ActorFactory = Arc::new(move |_: &str| {
            let _ = seen.len();
            Ok(Box::new(Idle) as Box<dyn WebActor>)
        });
        let ctx = DefaultContext::new(UrlPatterns::new().http("/").unwrap(), registry, factory);

        let task = tokio::task::spawn_blocking(move || ctx.actor("sess_nested").map(|r| r.created));
        let created = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("actor creation blocked on the registry")
            .unwrap()
            .unwrap();
        assert!(created);
    }
}
