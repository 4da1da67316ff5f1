//! A checked-out connection with tracked transaction state.

use crate::db::pool::{DbConnection, Engine};
use crate::error::{DbError, DbResult};
use crate::models::dialect::{DatabaseType, IsolationLevel};
use crate::models::query::{ExecResult, Row, Statement};
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection shared between a pinning scope and the sessions bound to it.
pub type SharedConnection = Arc<tokio::sync::Mutex<ManagedConnection>>;

/// One pooled connection plus the transaction and savepoint stack opened on it.
///
/// Dropping a connection that still has an open transaction, or that carries
/// connection-level overrides, detaches it from the pool instead of returning
/// it. The server then rolls back the transaction when the socket closes.
#[derive(Debug)]
pub struct ManagedConnection {
    engine: Engine,
    conn: Option<DbConnection>,
    in_transaction: bool,
    savepoints: Vec<String>,
    counter: u32,
    overridden: bool,
}

impl ManagedConnection {
    /// Check out a connection from `engine` and apply its execution options.
    pub async fn checkout(engine: &Engine) -> DbResult<Self> {
        let conn = engine.acquire().await?;
        let mut managed = Self {
            engine: engine.clone(),
            conn: Some(conn),
            in_transaction: false,
            savepoints: Vec::new(),
            counter: 0,
            overridden: false,
        };
        let overrides = engine.override_statements()?;
        if !overrides.is_empty() {
            managed.overridden = true;
            for sql in &overrides {
                managed.conn_mut()?.execute_raw(sql).await?;
            }
            debug!(bind = %engine.bind_name(), ?overrides, "Applied connection overrides");
        }
        Ok(managed)
    }

    fn conn_mut(&mut self) -> DbResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("Connection already released"))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn bind_name(&self) -> &str {
        self.engine.bind_name()
    }

    pub fn db_type(&self) -> DatabaseType {
        self.engine.db_type()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn in_savepoint(&self) -> bool {
        !self.savepoints.is_empty()
    }

    /// Whether `name` is still open. Releasing or rolling back to a
    /// savepoint also ends every savepoint opened after it.
    pub fn has_savepoint(&self, name: &str) -> bool {
        self.savepoints.iter().any(|s| s == name)
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    pub async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        if self.in_transaction {
            return Err(DbError::invalid_request(format!(
                "A transaction is already open on bind '{}'",
                self.bind_name()
            )));
        }
        let statements = IsolationLevel::begin_statements(isolation, self.db_type())?;
        for sql in &statements {
            self.conn_mut()?.execute_raw(sql).await?;
        }
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            return Err(DbError::invalid_request(format!(
                "No transaction is open on bind '{}'",
                self.bind_name()
            )));
        }
        self.conn_mut()?.execute_raw("COMMIT").await?;
        self.in_transaction = false;
        self.savepoints.clear();
        Ok(())
    }

    /// Roll back the open transaction, if any.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn_mut()?.execute_raw("ROLLBACK").await?;
        self.in_transaction = false;
        self.savepoints.clear();
        Ok(())
    }

    /// Open a savepoint inside the current transaction and return its name.
    pub async fn savepoint(&mut self) -> DbResult<String> {
        if !self.in_transaction {
            return Err(DbError::invalid_request(
                "A savepoint requires an open transaction",
            ));
        }
        self.counter += 1;
        let name = format!("sp_{}", self.counter);
        self.conn_mut()?
            .execute_raw(&format!("SAVEPOINT {}", name))
            .await?;
        self.savepoints.push(name.clone());
        Ok(name)
    }

    fn savepoint_position(&self, name: &str) -> DbResult<usize> {
        self.savepoints
            .iter()
            .rposition(|s| s == name)
            .ok_or_else(|| DbError::invalid_request(format!("Savepoint '{}' is not active", name)))
    }

    /// Release `name` and every savepoint opened after it.
    pub async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        let position = self.savepoint_position(name)?;
        self.conn_mut()?
            .execute_raw(&format!("RELEASE SAVEPOINT {}", name))
            .await?;
        self.savepoints.truncate(position);
        Ok(())
    }

    /// Undo everything since `name` was opened. The savepoint is ended.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        let position = self.savepoint_position(name)?;
        self.conn_mut()?
            .execute_raw(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await?;
        self.savepoints.truncate(position);
        Ok(())
    }

    pub async fn execute(&mut self, stmt: &Statement) -> DbResult<ExecResult> {
        let engine = self.engine.clone();
        engine.execute(self.conn_mut()?, stmt).await
    }

    pub async fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        let engine = self.engine.clone();
        engine.fetch_all(self.conn_mut()?, stmt).await
    }

    /// Roll back, undo overrides and hand the connection back to the pool.
    pub async fn close(mut self) -> DbResult<()> {
        self.rollback().await?;
        if self.overridden {
            for sql in self.engine.reset_statements()? {
                self.conn_mut()?.execute_raw(&sql).await?;
            }
            self.overridden = false;
        }
        // Clean connections go back to the pool on drop
        Ok(())
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_transaction || self.overridden {
            warn!(
                bind = %self.engine.bind_name(),
                in_transaction = self.in_transaction,
                overridden = self.overridden,
                "Connection dropped while dirty; detaching it from the pool"
            );
            conn.discard();
        } else if tokio::runtime::Handle::try_current().is_err() {
            // Returning to the pool spawns a task
            conn.discard();
        }
    }
}
