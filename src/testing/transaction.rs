//! Rollback-only transactions for test isolation.

use crate::config::JoinTransactionMode;
use crate::db::bind::Bind;
use crate::db::connection::SharedConnection;
use crate::error::{DbError, DbResult};
use crate::session::{ScopedSessionManager, Session, SessionFactory};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// One connection with an outer transaction that is always rolled back.
///
/// Sessions from [`TestTransaction::session`] run on that connection. In
/// savepoint mode their commits only release savepoints; otherwise they join
/// the outer transaction, commit is a no-op and rollback restarts the outer
/// transaction. Sessions never end it for good, so nothing written inside
/// survives [`TestTransaction::close`].
pub struct TestTransaction {
    bind: Bind,
    conn: Option<SharedConnection>,
    savepoint: Option<String>,
}

impl fmt::Debug for TestTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestTransaction")
            .field("bind", &self.bind.name())
            .field("savepoint", &self.savepoint)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl TestTransaction {
    /// Check out a connection from `bind`, begin a transaction and, with
    /// `savepoint`, a savepoint inside it.
    pub async fn begin(bind: &Bind, savepoint: bool) -> DbResult<Self> {
        let mut conn = bind.connect().await?;
        let opened = match conn.begin(None).await {
            Ok(()) if savepoint => conn.savepoint().await.map(Some),
            Ok(()) => Ok(None),
            Err(e) => Err(e),
        };
        let savepoint = match opened {
            Ok(savepoint) => savepoint,
            Err(e) => {
                let errors = conn.close().await.err().into_iter().collect();
                return Err(DbError::with_cleanup(e, errors));
            }
        };
        debug!(bind = %bind.name(), ?savepoint, "Test transaction started");
        Ok(Self {
            bind: bind.clone(),
            conn: Some(Arc::new(tokio::sync::Mutex::new(conn))),
            savepoint,
        })
    }

    pub fn bind(&self) -> &Bind {
        &self.bind
    }

    pub fn is_savepoint(&self) -> bool {
        self.savepoint.is_some()
    }

    fn connection(&self) -> DbResult<SharedConnection> {
        self.conn
            .clone()
            .ok_or_else(|| DbError::invalid_request("Test transaction is closed"))
    }

    /// Factory for sessions running inside this transaction.
    pub fn session_factory(&self) -> DbResult<SessionFactory> {
        let mut options = self.bind.config().session.clone();
        if self.savepoint.is_some() {
            options.join_transaction_mode = JoinTransactionMode::CreateSavepoint;
        }
        Ok(SessionFactory::joined(self.bind.clone(), self.connection()?, options))
    }

    pub fn session(&self) -> DbResult<Session> {
        Ok(self.session_factory()?.create())
    }

    /// Scoped sessions running inside this transaction.
    pub fn scoped_session(&self) -> DbResult<ScopedSessionManager> {
        Ok(ScopedSessionManager::new(self.session_factory()?))
    }

    async fn teardown(&mut self) -> Vec<DbError> {
        let mut errors = Vec::new();
        let Some(shared) = self.conn.take() else {
            return errors;
        };
        match Arc::try_unwrap(shared) {
            Ok(conn) => {
                let mut conn = conn.into_inner();
                errors.extend(conn.rollback().await.err());
                errors.extend(conn.close().await.err());
            }
            Err(shared) => {
                // Sessions still hold the connection; it returns to the pool
                // once the last of them is dropped
                warn!(bind = %self.bind.name(), "Test transaction closed while sessions are alive");
                errors.extend(shared.lock().await.rollback().await.err());
            }
        }
        debug!(bind = %self.bind.name(), "Test transaction rolled back");
        errors
    }

    /// Roll back everything and release the connection.
    ///
    /// `original` is the error that ended the test body, if any. It is
    /// returned with any rollback or close failures attached.
    pub async fn close(mut self, original: Option<DbError>) -> DbResult<()> {
        let errors = self.teardown().await;
        DbError::cleanup(original, errors)
    }

    /// Begin, run `f` with a session inside the transaction, then close.
    pub async fn run<T, F>(bind: &Bind, savepoint: bool, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, DbResult<T>>,
    {
        let mut txn = Self::begin(bind, savepoint).await?;
        let mut session = match txn.session() {
            Ok(session) => session,
            Err(e) => return Err(DbError::with_cleanup(e, txn.teardown().await)),
        };
        let result = f(&mut session).await;
        drop(session);
        match result {
            Ok(value) => {
                txn.close(None).await?;
                Ok(value)
            }
            Err(e) => Err(DbError::with_cleanup(e, txn.teardown().await)),
        }
    }
}

impl Drop for TestTransaction {
    fn drop(&mut self) {
        // The connection detaches itself because its transaction is open
        if self.conn.is_some() {
            warn!(bind = %self.bind.name(), "Test transaction dropped without close");
        }
    }
}
