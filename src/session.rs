//! Session object and Session Manager (§3, §4.4).
//!
//! A Session owns exactly one Backend Driver instance for its entire
//! lifetime. `SessionManager` indexes sessions by id, race-frees creation
//! with a single creation mutex (§4.4.1), and runs the background reaper
//! that terminates idle sessions (§4.4.2).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{DriverFactory, IsolationBackend};
use crate::error::{OrchestratorError, Result};
use crate::user::UserContext;

/// A boxed, `Send` future — the shape every [`SessionManager::run_scoped`]
/// body takes, since an async closure taking `&mut dyn IsolationBackend`
/// can't be expressed directly in stable Rust.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Mutable, mutex-guarded state of a Session.
struct SessionInner {
    driver: Box<dyn IsolationBackend>,
    active: bool,
}

/// One logical sandbox session: one owner, one exclusively-owned driver,
/// one mutex serializing every operation against it (§3).
pub struct Session {
    pub id: String,
    pub owner_id: String,
    created_at: Instant,
    /// Nanoseconds since `created_at`, updated on every operation exit.
    /// Kept outside `inner`'s mutex, mirroring `original_source`'s
    /// `session.last_accessed` field access: the reaper reads it without
    /// blocking on whatever driver call the session mutex might currently
    /// be held for.
    last_accessed_nanos: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String, owner_id: String, driver: Box<dyn IsolationBackend>) -> Self {
        Self {
            id,
            owner_id,
            created_at: Instant::now(),
            last_accessed_nanos: AtomicU64::new(0),
            inner: Mutex::new(SessionInner { driver, active: true }),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_accessed_nanos.store(elapsed, Ordering::Relaxed);
    }

    fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        let now = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let last = self.last_accessed_nanos.load(Ordering::Relaxed);
        Duration::from_nanos(now.saturating_sub(last)) > idle_timeout
    }
}

/// Indexed map of session id → Session, with race-free get-or-create, a
/// background reaper, and graceful shutdown (§4.4).
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    creation_lock: Mutex<()>,
    reaper_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    driver_factory: Arc<dyn DriverFactory>,
    idle_timeout: Duration,
    reaper_interval: Duration,
}

impl SessionManager {
    pub fn new(
        driver_factory: Arc<dyn DriverFactory>,
        idle_timeout: Duration,
        reaper_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
            reaper_handle: Mutex::new(None),
            driver_factory,
            idle_timeout,
            reaper_interval,
        })
    }

    /// Current number of registered sessions. Exposed for tests and
    /// operational introspection; not part of the core's own logic.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Race-free get-or-create (§4.4.1). Returns a Session with
    /// `active == true` at the instant of return.
    async fn get_or_create(self: &Arc<Self>, session_id: &str, owner: &UserContext) -> Result<Arc<Session>> {
        if session_id.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }
        if owner.id.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "user context is required".to_string(),
            ));
        }

        self.start_reaper_if_needed();

        // Optimistic read: avoids the creation mutex on the hot path where
        // the session already exists.
        if let Some(session) = self.sessions.read().await.get(session_id) {
            if session.owner_id != owner.id {
                warn!(session_id, owner = %owner.id, "access denied: session belongs to another user");
                return Err(OrchestratorError::AccessDenied);
            }
            session.touch();
            return Ok(Arc::clone(session));
        }

        let _creation_guard = self.creation_lock.lock().await;

        // Double-checked: someone may have created it while we waited for
        // the creation mutex.
        if let Some(session) = self.sessions.read().await.get(session_id) {
            if session.owner_id != owner.id {
                warn!(session_id, owner = %owner.id, "access denied: session belongs to another user");
                return Err(OrchestratorError::AccessDenied);
            }
            session.touch();
            return Ok(Arc::clone(session));
        }

        let mut driver = self.driver_factory.create();
        info!(session_id, owner = %owner.id, "allocating sandbox session");
        driver
            .start()
            .await
            .map_err(|err| OrchestratorError::BackendUnavailable(err.to_string()))?;

        let session = Arc::new(Session::new(session_id.to_string(), owner.id.clone(), driver));
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Session Scope (§4.5): acquire a session, re-validate its liveness
    /// under its own mutex, run `op` against its driver, update its access
    /// time, release. Retries silently (never surfaces an error) if the
    /// session was reaped between acquisition and lock — the `continue`
    /// lands back in `get_or_create`, which creates a fresh Session because
    /// the reaper already removed the old one from the map.
    pub async fn run_scoped<T>(
        self: &Arc<Self>,
        session_id: &str,
        owner: &UserContext,
        mut op: impl for<'a> FnMut(&'a mut dyn IsolationBackend) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        loop {
            let session = self.get_or_create(session_id, owner).await?;
            let mut guard = session.inner.lock().await;
            if !guard.active {
                drop(guard);
                debug!(session_id, "session reaped between acquire and lock, retrying");
                continue;
            }
            let result = op(guard.driver.as_mut()).await;
            drop(guard);
            session.touch();
            return result;
        }
    }

    fn start_reaper_if_needed(self: &Arc<Self>) {
        let Ok(mut handle) = self.reaper_handle.try_lock() else {
            // Someone else is already starting (or has started) the reaper.
            return;
        };
        let needs_start = match handle.as_ref() {
            Some(h) => h.is_finished(),
            None => true,
        };
        if !needs_start {
            return;
        }
        let manager = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            manager.reaper_loop().await;
        }));
    }

    async fn reaper_loop(self: Arc<Self>) {
        info!("session reaper started");
        let mut ticker = tokio::time::interval(self.reaper_interval.max(Duration::from_millis(1)));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            self.reap_expired().await;
        }
    }

    async fn reap_expired(&self) {
        let session_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();

        let mut expired = Vec::new();
        for id in session_ids {
            if let Some(session) = self.sessions.read().await.get(&id).cloned() {
                if session.is_idle_expired(self.idle_timeout) {
                    expired.push(id);
                }
            }
        }

        for id in expired {
            let removed = self.sessions.write().await.remove(&id);
            if let Some(session) = removed {
                debug!(session_id = %id, "reaping idle session");
                let mut guard = session.inner.lock().await;
                guard.active = false;
                guard.driver.terminate().await;
                info!(session_id = %id, "session terminated by reaper");
            }
        }
    }

    /// Cancel the reaper, await its termination, then terminate every
    /// registered session (§4.4.3). Idempotent: safe to call more than
    /// once, including concurrently with no sessions left.
    pub async fn shutdown(self: &Arc<Self>) {
        let handle = self.reaper_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!(count = sessions.len(), "shutting down session manager");

        for session in sessions {
            let mut guard = session.inner.lock().await;
            guard.active = false;
            guard.driver.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDriverFactory, MockStats};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn manager(idle: Duration, reaper: Duration) -> (Arc<SessionManager>, Arc<MockStats>) {
        let stats = Arc::new(MockStats::default());
        let factory = Arc::new(MockDriverFactory::new(
            Arc::clone(&stats),
            Duration::from_secs(60),
            HashSet::new(),
        ));
        (SessionManager::new(factory, idle, reaper), stats)
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session_twice() {
        let (manager, _stats) = manager(Duration::from_secs(300), Duration::from_secs(60));
        let owner = UserContext::new("u1");
        let first = manager.get_or_create("s1", &owner).await.unwrap();
        let second = manager.get_or_create("s1", &owner).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn empty_session_id_is_invalid_argument() {
        let (manager, _stats) = manager(Duration::from_secs(300), Duration::from_secs(60));
        let owner = UserContext::new("u1");
        let err = manager.get_or_create("", &owner).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cross_user_access_is_denied() {
        let (manager, _stats) = manager(Duration::from_secs(300), Duration::from_secs(60));
        manager.get_or_create("s1", &UserContext::new("u1")).await.unwrap();
        let err = manager
            .get_or_create("s1", &UserContext::new("u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AccessDenied));
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn reaper_terminates_idle_sessions_and_next_lookup_is_fresh() {
        let (manager, stats) = manager(Duration::from_millis(0), Duration::from_millis(20));
        let owner = UserContext::new("u1");
        let first = manager.get_or_create("s1", &owner).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(stats.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_count().await, 0);

        let second = manager.get_or_create("s1", &owner).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(stats.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (manager, stats) = manager(Duration::from_secs(300), Duration::from_secs(60));
        manager.get_or_create("s1", &UserContext::new("u1")).await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(stats.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn thundering_herd_on_reaped_session_creates_exactly_one_replacement() {
        let (manager, stats) = manager(Duration::from_millis(50), Duration::from_millis(20));
        let owner = UserContext::new("u1");
        manager.get_or_create("s1", &owner).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.session_count().await, 0);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .run_scoped("s1", &owner, |driver| {
                        Box::pin(async move { driver.execute("print(1)", crate::backend::Language::Python).await })
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(manager.session_count().await, 1);
        // One original start + exactly one replacement.
        assert_eq!(stats.starts.load(Ordering::SeqCst), 2);
    }
}
