//! Session registry: session id to owning actor.
//!
//! The registry is responsible for:
//! - Atomic create-if-absent resolution of session actors
//! - Removing entries when their actor terminates
//! - Optional idle expiry, layered on top by the server
//! - Graceful shutdown of all actors

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::actor::{ActorHandle, ActorId};

// ============================================================================
// Session Ids
// ============================================================================

/// Prefix of every generated session id.
pub const SESSION_ID_PREFIX: &str = "sess_";

/// Longest session id accepted from a client cookie.
const MAX_SESSION_ID_LEN: usize = 128;

/// Generate a fresh session id.
pub fn new_session_id() -> String {
    format!("{}{}", SESSION_ID_PREFIX, Ulid::new())
}

/// Whether a client-presented id is usable as a registry key.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

// ============================================================================
// Session Registry
// ============================================================================

struct SessionEntry {
    actor: ActorHandle,
    last_seen: Instant,
}

impl SessionEntry {
    fn new(actor: ActorHandle) -> Self {
        Self {
            actor,
            last_seen: Instant::now(),
        }
    }
}

/// Outcome of [`SessionRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub actor: ActorHandle,
    /// True when the actor was created by this call.
    pub created: bool,
}

/// Registry of live sessions.
///
/// Owned by one server instance; cheap to clone. All mutations go through
/// DashMap entry operations, so create-if-absent and remove are atomic with
/// respect to each other.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionEntry>>,
    removed: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Core API
    // ------------------------------------------------------------------------

    /// Return the live actor for `session_id`, creating it with `create` if
    /// the id is unknown or its actor has terminated.
    ///
    /// `create` runs without any registry lock held, so it may use the
    /// registry itself. Concurrent callers for the same id may each build an
    /// actor; exactly one is registered and the others are stopped before
    /// they are returned to anyone. If `create` fails nothing is registered.
    /// Must be called from within a Tokio runtime.
    pub fn resolve<F, E>(&self, session_id: &str, create: F) -> Result<Resolved, E>
    where
        F: FnOnce(&str) -> Result<ActorHandle, E>,
    {
        if let Some(actor) = self.lookup(session_id) {
            return Ok(Resolved {
                actor,
                created: false,
            });
        }

        let candidate = create(session_id)?;

        let mut replaced = None;
        let resolved = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().actor.is_terminated() => {
                let entry = occupied.get_mut();
                entry.last_seen = Instant::now();
                Resolved {
                    actor: entry.actor.clone(),
                    created: false,
                }
            }
            Entry::Occupied(mut occupied) => {
                let dead = occupied.insert(SessionEntry::new(candidate.clone()));
                replaced = Some(dead.actor.id());
                Resolved {
                    actor: candidate.clone(),
                    created: true,
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SessionEntry::new(candidate.clone()));
                Resolved {
                    actor: candidate.clone(),
                    created: true,
                }
            }
        };

        // Shard lock is released here; the watcher may remove immediately.
        if let Some(dead) = replaced {
            self.removed.fetch_add(1, Ordering::Relaxed);
            debug!(session_id, actor = %dead, "Replaced terminated session actor");
        }
        if resolved.created {
            debug!(session_id, actor = %resolved.actor.id(), "Session created");
            self.spawn_exit_watcher(session_id.to_string(), &resolved.actor);
        } else {
            debug!(session_id, spare = %candidate.id(), "Lost session creation race");
            candidate.stop();
        }
        Ok(resolved)
    }

    /// Live actor for `session_id`, if any. Refreshes the idle timer.
    pub fn lookup(&self, session_id: &str) -> Option<ActorHandle> {
        let mut entry = self.sessions.get_mut(session_id)?;
        if entry.actor.is_terminated() {
            return None;
        }
        entry.last_seen = Instant::now();
        Some(entry.actor.clone())
    }

    /// Remove every entry owned by `actor`. Idempotent.
    ///
    /// Returns whether an entry was removed by this call.
    pub fn remove(&self, actor: &ActorHandle) -> bool {
        self.remove_actor(actor.id())
    }

    /// Remove `session_id` regardless of its actor. Does not stop the actor.
    pub fn remove_if_present(&self, session_id: &str) -> Option<ActorHandle> {
        let (_, entry) = self.sessions.remove(session_id)?;
        self.removed.fetch_add(1, Ordering::Relaxed);
        debug!(session_id, actor = %entry.actor.id(), "Session removed");
        Some(entry.actor)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Total number of entries removed since the registry was created.
    pub fn removed_total(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Expiry & Shutdown
    // ------------------------------------------------------------------------

    /// Stop and remove sessions not resolved within `ttl`.
    ///
    /// Returns the number of sessions expired.
    pub fn expire_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let idle: Vec<(String, ActorId)> = self
            .sessions
            .iter()
            .filter(|e| now.duration_since(e.last_seen) >= ttl)
            .map(|e| (e.key().clone(), e.actor.id()))
            .collect();

        let mut expired = 0;
        for (session_id, actor_id) in idle {
            // Re-check under the shard lock: the session may have been touched.
            let removed = self.sessions.remove_if(&session_id, |_, e| {
                e.actor.id() == actor_id && now.duration_since(e.last_seen) >= ttl
            });
            if let Some((_, entry)) = removed {
                self.removed.fetch_add(1, Ordering::Relaxed);
                entry.actor.stop();
                debug!(session_id = %session_id, actor = %actor_id, "Session expired");
                expired += 1;
            }
        }

        if expired > 0 {
            info!(expired, remaining = self.len(), "Expired idle sessions");
        }
        expired
    }

    /// Stop every actor and wait (bounded by `grace`) for them to exit.
    pub async fn shutdown(&self, grace: Duration) {
        info!(sessions = self.len(), "Shutting down session registry");

        let actors: Vec<ActorHandle> = self.sessions.iter().map(|e| e.actor.clone()).collect();
        for actor in &actors {
            actor.stop();
        }

        let exits = futures::future::join_all(actors.iter().map(|a| a.watch().exited()));
        if tokio::time::timeout(grace, exits).await.is_err() {
            warn!("Timed out waiting for web actors to stop");
        }

        self.sessions.clear();
        info!("Session registry shutdown complete");
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn remove_actor(&self, actor_id: ActorId) -> bool {
        let owned: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.actor.id() == actor_id)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = false;
        for session_id in owned {
            if self
                .sessions
                .remove_if(&session_id, |_, e| e.actor.id() == actor_id)
                .is_some()
            {
                self.removed.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %session_id, actor = %actor_id, "Session removed");
                removed = true;
            }
        }
        removed
    }

    /// Remove the entry once its actor terminates.
    ///
    /// Matching on the actor id keeps a replacement actor registered under
    /// the same session id.
    fn spawn_exit_watcher(&self, session_id: String, actor: &ActorHandle) {
        let watch = actor.watch();
        let registry = self.clone();
        tokio::spawn(async move {
            let exit = watch.exited().await;
            if registry
                .sessions
                .remove_if(&session_id, |_, e| e.actor.id() == exit.actor)
                .is_some()
            {
                registry.removed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %session_id,
                    actor = %exit.actor,
                    reason = %exit.reason,
                    "Session removed after actor exit"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::actor::{ActorContext, ActorError, WebActor, spawn_actor};
    use crate::envelope::WebMessage;

    struct Idle;

    #[async_trait]
    impl WebActor for Idle {
        async fn handle(&mut self, _msg: WebMessage, _ctx: &mut ActorContext) -> Result<(), ActorError> {
            Ok(())
        }
    }

    fn spawn_idle(session_id: &str) -> Result<ActorHandle, ActorError> {
        Ok(spawn_actor(Box::new(Idle), session_id, 8))
    }

    async fn wait_until_removed(registry: &SessionRegistry, session_id: &str) {
        for _ in 0..200 {
            if !registry.contains(session_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {session_id} was not removed");
    }

    #[test]
    fn generated_ids_are_valid() {
        let id = new_session_id();
        assert!(id.starts_with(SESSION_ID_PREFIX));
        assert!(is_valid_session_id(&id));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("a b"));
        assert!(!is_valid_session_id(&"x".repeat(MAX_SESSION_ID_LEN + 1)));
    }

    #[tokio::test]
    async fn resolve_creates_once_then_reuses() {
        let registry = SessionRegistry::new();

        let first = registry.resolve("sess_a", spawn_idle).unwrap();
        let second = registry.resolve("sess_a", spawn_idle).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.actor, second.actor);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("sess_a"), Some(first.actor));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolve_creates_single_actor() {
        let registry = SessionRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let created = created.clone();
                tokio::spawn(async move {
                    registry
                        .resolve("sess_race", |id| {
                            created.fetch_add(1, Ordering::SeqCst);
                            spawn_idle(id)
                        })
                        .unwrap()
                        .actor
                        .id()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        assert!(created.load(Ordering::SeqCst) >= 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("sess_race").is_some_and(|a| a.id() == ids[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn factory_may_use_the_registry() {
        let registry = SessionRegistry::new();
        registry.resolve("sess_other", spawn_idle).unwrap();

        let inner = registry.clone();
        let task = tokio::task::spawn_blocking(move || {
            inner
                .resolve("sess_nested", |id| {
                    // Reads every shard, including the one for `id`.
                    assert_eq!(inner.len(), 1);
                    assert!(inner.lookup(id).is_none());
                    spawn_idle(id)
                })
                .map(|resolved| resolved.created)
        });

        let created = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("resolve blocked while the factory used the registry")
            .unwrap()
            .unwrap();
        assert!(created);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn losing_candidate_is_stopped() {
        let registry = SessionRegistry::new();
        let mut spare = None;

        let resolved = registry
            .resolve("sess_won", |id| {
                // Another caller registers first while this factory runs.
                registry.resolve(id, spawn_idle).unwrap();
                let actor = spawn_idle(id)?;
                spare = Some(actor.clone());
                Ok::<_, ActorError>(actor)
            })
            .unwrap();

        let spare = spare.unwrap();
        assert!(!resolved.created);
        assert_ne!(resolved.actor, spare);
        assert_eq!(registry.lookup("sess_won"), Some(resolved.actor));
        assert_eq!(spare.watch().exited().await.reason, crate::actor::ExitReason::Stopped);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_creation_registers_nothing() {
        let registry = SessionRegistry::new();
        let result: Result<Resolved, ActorError> =
            registry.resolve("sess_bad", |_| Err(ActorError::failed("boom")));

        assert!(result.is_err());
        assert!(!registry.contains("sess_bad"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn actor_exit_removes_entry_exactly_once() {
        let registry = SessionRegistry::new();
        let actor = registry.resolve("sess_exit", spawn_idle).unwrap().actor;

        // Stopping twice still yields a single removal.
        actor.stop();
        actor.stop();
        wait_until_removed(&registry, "sess_exit").await;

        assert!(!registry.remove(&actor));
        assert_eq!(registry.removed_total(), 1);
    }

    #[tokio::test]
    async fn explicit_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let actor = registry.resolve("sess_rm", spawn_idle).unwrap().actor;

        assert!(registry.remove(&actor));
        assert!(!registry.remove(&actor));
        assert!(registry.remove_if_present("sess_rm").is_none());

        // The actor is independent of its registry entry.
        assert!(!actor.is_terminated());
        actor.stop();
        actor.watch().exited().await;
        tokio::task::yield_now().await;
        assert_eq!(registry.removed_total(), 1);
    }

    #[tokio::test]
    async fn dead_entry_is_replaced_and_replacement_survives_old_watcher() {
        let registry = SessionRegistry::new();

        // Register an actor, remove the entry, stop the actor: its watcher
        // must not touch the replacement registered afterwards.
        let old = registry.resolve("sess_re", spawn_idle).unwrap().actor;
        registry.remove_if_present("sess_re");
        let replacement = registry.resolve("sess_re", spawn_idle).unwrap();
        assert!(replacement.created);

        old.stop();
        old.watch().exited().await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.lookup("sess_re"), Some(replacement.actor));
    }

    #[tokio::test]
    async fn replacing_dead_entry_counts_as_removal() {
        let registry = SessionRegistry::new();
        let dead = spawn_idle("sess_stale").unwrap();
        dead.stop();
        dead.watch().exited().await;
        // No exit watcher for this entry, so only resolve can clear it.
        registry
            .sessions
            .insert("sess_stale".to_string(), SessionEntry::new(dead.clone()));

        let fresh = registry.resolve("sess_stale", spawn_idle).unwrap();

        assert!(fresh.created);
        assert_ne!(fresh.actor, dead);
        assert_eq!(registry.removed_total(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn terminated_actor_is_not_returned() {
        let registry = SessionRegistry::new();
        let actor = registry.resolve("sess_dead", spawn_idle).unwrap().actor;
        actor.stop();
        actor.watch().exited().await;

        assert!(registry.lookup("sess_dead").is_none());
        let again = registry.resolve("sess_dead", spawn_idle).unwrap();
        assert!(again.created);
        assert_ne!(again.actor, actor);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_idle_stops_stale_sessions() {
        let registry = SessionRegistry::new();
        let stale = registry.resolve("sess_stale", spawn_idle).unwrap().actor;
        tokio::time::advance(Duration::from_secs(30)).await;
        registry.resolve("sess_fresh", spawn_idle).unwrap();

        assert_eq!(registry.expire_idle(Duration::from_secs(20)), 1);
        assert!(!registry.contains("sess_stale"));
        assert!(registry.contains("sess_fresh"));
        assert_eq!(stale.watch().exited().await.reason, crate::actor::ExitReason::Stopped);
    }

    #[tokio::test]
    async fn shutdown_stops_all_actors() {
        let registry = SessionRegistry::new();
        let a = registry.resolve("sess_1", spawn_idle).unwrap().actor;
        let b = registry.resolve("sess_2", spawn_idle).unwrap().actor;

        registry.shutdown(Duration::from_secs(1)).await;

        assert!(registry.is_empty());
        assert!(a.is_terminated());
        assert!(b.is_terminated());
    }
}
