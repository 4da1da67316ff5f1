//! One session per execution scope.
//!
//! A scope is a request or task entered with [`ScopedSessionManager::scope`],
//! or a thread entered with [`ScopedSessionManager::enter_thread_scope`]. Within
//! a scope every call to [`ScopedSessionManager::current`] returns the same
//! session; when the scope ends the session is closed and forgotten.

use crate::error::{DbError, DbResult};
use crate::session::routing::{Session, SessionFactory};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Identity of an execution scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Task(u64),
    Thread(u64),
    Custom(String),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(id) => write!(f, "task-{}", id),
            Self::Thread(id) => write!(f, "thread-{}", id),
            Self::Custom(key) => f.write_str(key),
        }
    }
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_SCOPE.fetch_add(1, Ordering::Relaxed)
}

tokio::task_local! {
    static TASK_SCOPE: ScopeKey;
}

thread_local! {
    static THREAD_SCOPE: RefCell<Option<ScopeKey>> = const { RefCell::new(None) };
}

/// The innermost active scope: the task scope, else the thread scope.
pub fn current_scope() -> Option<ScopeKey> {
    TASK_SCOPE
        .try_with(Clone::clone)
        .ok()
        .or_else(|| THREAD_SCOPE.with(|s| s.borrow().clone()))
}

/// Session shared by everything running in one scope.
pub type ScopedSession = Arc<tokio::sync::Mutex<Session>>;

type ScopeFn = Arc<dyn Fn() -> Option<ScopeKey> + Send + Sync>;

/// Maps the current scope to exactly one live session.
#[derive(Clone)]
pub struct ScopedSessionManager {
    factory: SessionFactory,
    sessions: Arc<Mutex<HashMap<ScopeKey, ScopedSession>>>,
    scope_fn: ScopeFn,
}

impl fmt::Debug for ScopedSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSessionManager")
            .field("factory", &self.factory)
            .field("active_scopes", &self.active_scopes())
            .finish()
    }
}

impl ScopedSessionManager {
    pub fn new(factory: SessionFactory) -> Self {
        Self::with_scope_fn(factory, current_scope)
    }

    /// Use `scope_fn` to identify the current scope instead of the default.
    pub fn with_scope_fn(
        factory: SessionFactory,
        scope_fn: impl Fn() -> Option<ScopeKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            scope_fn: Arc::new(scope_fn),
        }
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<ScopeKey, ScopedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current scope's session, created on first use.
    ///
    /// Fails with `NoActiveScope` outside any scope rather than creating a
    /// session nobody would tear down.
    pub fn current(&self) -> DbResult<ScopedSession> {
        let key = (self.scope_fn)().ok_or(DbError::NoActiveScope)?;
        let mut sessions = self.sessions();
        let session = sessions.entry(key).or_insert_with_key(|key| {
            debug!(scope = %key, "Creating scoped session");
            Arc::new(tokio::sync::Mutex::new(self.factory.create()))
        });
        Ok(session.clone())
    }

    pub fn has_session(&self) -> bool {
        (self.scope_fn)().is_some_and(|key| self.sessions().contains_key(&key))
    }

    pub fn active_scopes(&self) -> usize {
        self.sessions().len()
    }

    /// Close and forget the current scope's session. No session is a no-op.
    pub async fn remove(&self) -> DbResult<()> {
        match (self.scope_fn)() {
            Some(key) => self.remove_key(&key).await,
            None => Ok(()),
        }
    }

    async fn remove_key(&self, key: &ScopeKey) -> DbResult<()> {
        let session = self.sessions().remove(key);
        let Some(session) = session else {
            return Ok(());
        };
        debug!(scope = %key, "Removing scoped session");
        let mut session = session.lock().await;
        session.close().await
    }

    /// Run `fut` in a fresh task scope, removing its session afterwards.
    ///
    /// The session is also removed when the future is dropped early.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        let key = ScopeKey::Task(next_id());
        let mut guard = ScopeGuard {
            manager: self.clone(),
            key: Some(key.clone()),
        };
        let output = TASK_SCOPE.scope(key.clone(), fut).await;
        guard.key = None;
        if let Err(e) = self.remove_key(&key).await {
            warn!(scope = %key, error = %e, "Failed to close scoped session");
        }
        output
    }

    /// Enter a thread scope on the current thread.
    ///
    /// Scopes nest: leaving restores the enclosing thread scope.
    pub fn enter_thread_scope(&self) -> ThreadScope {
        let key = ScopeKey::Thread(next_id());
        let previous = THREAD_SCOPE.with(|s| s.replace(Some(key.clone())));
        ThreadScope {
            manager: self.clone(),
            key: Some(key),
            previous,
        }
    }

    /// Forget `key`'s session without awaiting; its close runs in the background.
    fn abandon(&self, key: &ScopeKey) {
        let Some(session) = self.sessions().remove(key) else {
            return;
        };
        warn!(scope = %key, "Scope torn down by drop");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let key = key.clone();
            handle.spawn(async move {
                if let Err(e) = session.lock().await.close().await {
                    warn!(scope = %key, error = %e, "Failed to close abandoned session");
                }
            });
        }
    }
}

struct ScopeGuard {
    manager: ScopedSessionManager,
    key: Option<ScopeKey>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.manager.abandon(&key);
        }
    }
}

/// Guard for a thread scope. Prefer [`ThreadScope::close`], which awaits the
/// session close; dropping the guard closes it in the background.
pub struct ThreadScope {
    manager: ScopedSessionManager,
    key: Option<ScopeKey>,
    previous: Option<ScopeKey>,
}

impl ThreadScope {
    pub fn key(&self) -> Option<&ScopeKey> {
        self.key.as_ref()
    }

    pub async fn close(mut self) -> DbResult<()> {
        let previous = self.previous.take();
        THREAD_SCOPE.with(|s| s.replace(previous));
        match self.key.take() {
            Some(key) => self.manager.remove_key(&key).await,
            None => Ok(()),
        }
    }
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let previous = self.previous.take();
            THREAD_SCOPE.with(|s| s.replace(previous));
            self.manager.abandon(&key);
        }
    }
}
