//! Temporary execution-option overrides on one pinned connection.

use crate::db::bind::Bind;
use crate::db::connection::{ManagedConnection, SharedConnection};
use crate::db::pool::{Engine, ExecutionOptions};
use crate::error::{DbError, DbResult};
use crate::session::routing::{Session, SessionFactory};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

enum State {
    NotEntered,
    Entered {
        engine: Engine,
        conn: SharedConnection,
        session: Session,
    },
    Exited,
}

/// A scope running on the bind's engine with `options` layered on top.
///
/// Entering derives an engine sharing the bind's pool, checks out one
/// connection with the overrides applied and pins a session to it. Exiting
/// commits or rolls back that session, closes it, returns the connection with
/// the overrides undone and releases the derived engine. The bind's own pool
/// stays open throughout.
pub struct BindContext {
    bind: Bind,
    options: ExecutionOptions,
    state: State,
}

impl BindContext {
    pub(crate) fn new(bind: Bind, options: ExecutionOptions) -> DbResult<Self> {
        bind.engine()?;
        Ok(Self {
            bind,
            options,
            state: State::NotEntered,
        })
    }

    pub fn bind(&self) -> &Bind {
        &self.bind
    }

    pub fn options(&self) -> ExecutionOptions {
        self.options
    }

    pub fn is_entered(&self) -> bool {
        matches!(self.state, State::Entered { .. })
    }

    pub fn is_exited(&self) -> bool {
        matches!(self.state, State::Exited)
    }

    /// The derived engine, while entered.
    pub fn engine(&self) -> Option<&Engine> {
        match &self.state {
            State::Entered { engine, .. } => Some(engine),
            _ => None,
        }
    }

    pub async fn enter(&mut self) -> DbResult<&mut Session> {
        match self.state {
            State::NotEntered => {}
            State::Entered { .. } => {
                return Err(DbError::invalid_request("Bind context is already entered"));
            }
            State::Exited => {
                return Err(DbError::invalid_request("Bind context has already exited"));
            }
        }

        let engine = self.bind.engine()?.execution_options(self.options);
        let conn = self
            .bind
            .retry_policy()
            .run("connection checkout", || ManagedConnection::checkout(&engine))
            .await?;
        let conn: SharedConnection = Arc::new(tokio::sync::Mutex::new(conn));
        let session = SessionFactory::pinned(
            self.bind.clone(),
            conn.clone(),
            self.bind.config().session.clone(),
        )
        .create();

        let name = self.bind.name();
        debug!(bind = %name, options = ?self.options, "Entered bind context");
        self.bind
            .signals()
            .emit(|o| o.bind_context_entered(name, &self.options, &engine));
        self.state = State::Entered {
            engine,
            conn,
            session,
        };
        self.session()
    }

    /// The pinned session, while entered.
    pub fn session(&mut self) -> DbResult<&mut Session> {
        match &mut self.state {
            State::Entered { session, .. } => Ok(session),
            _ => Err(DbError::invalid_request("Bind context is not entered")),
        }
    }

    /// Leave the context, rolling back when `failed`.
    ///
    /// Every step runs even if an earlier one failed: the session ends, then
    /// the connection is closed, then the derived engine is released. All
    /// failures are reported together.
    pub async fn exit(&mut self, failed: bool) -> DbResult<()> {
        let (engine, conn, mut session) = match std::mem::replace(&mut self.state, State::Exited) {
            State::Entered {
                engine,
                conn,
                session,
            } => (engine, conn, session),
            other => {
                self.state = other;
                return Err(DbError::invalid_request("Bind context is not entered"));
            }
        };

        let mut errors = Vec::new();
        let ended = if failed {
            session.rollback().await
        } else {
            session.commit().await
        };
        errors.extend(ended.err());
        errors.extend(session.close().await.err());
        drop(session);

        match Arc::try_unwrap(conn) {
            Ok(conn) => errors.extend(conn.into_inner().close().await.err()),
            Err(_) => errors.push(DbError::invalid_request(
                "Bind context connection is still used by another session",
            )),
        }
        engine.dispose().await;

        let name = self.bind.name();
        debug!(bind = %name, failed, "Exited bind context");
        self.bind
            .signals()
            .emit(|o| o.bind_context_exited(name, &self.options, failed || !errors.is_empty()));
        DbError::cleanup(None, errors)
    }

    /// Enter, run `f` with the pinned session, then exit.
    pub async fn run<T, F>(mut self, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, DbResult<T>>,
    {
        let session = self.enter().await?;
        match f(session).await {
            Ok(value) => {
                self.exit(false).await?;
                Ok(value)
            }
            Err(e) => {
                let errors = self.exit(true).await.err().into_iter().collect();
                Err(DbError::with_cleanup(e, errors))
            }
        }
    }
}

impl Drop for BindContext {
    fn drop(&mut self) {
        // The connection detaches itself when dropped mid-transaction or
        // still carrying overrides
        if self.is_entered() {
            warn!(bind = %self.bind.name(), "Bind context dropped without exit");
        }
    }
}
