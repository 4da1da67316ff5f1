//! The routing session: a unit of work that picks a bind per statement.
//!
//! Bind resolution order, first match wins:
//!
//! 1. a bind passed explicitly to the call (`execute_on`, `fetch_on`)
//! 2. the bind forced with [`Session::using_bind`]
//! 3. the bind key of the statement's table
//! 4. the session's own bind, then the registry's default bind
//!
//! Every bind touched gets its own connection and transaction. They are
//! committed or rolled back together, without two-phase commit.

use crate::config::{JoinTransactionMode, SessionOptions};
use crate::db::bind::Bind;
use crate::db::connection::{ManagedConnection, SharedConnection};
use crate::db::registry::BindRegistry;
use crate::error::{DbError, DbResult};
use crate::models::builder::{Compile, Select};
use crate::models::query::{ExecResult, QueryParam, Row, Statement};
use crate::models::table::{Entity, Table};
use crate::session::pagination::{PageRequest, Pagination};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use tokio::sync::MutexGuard;
use tracing::{debug, warn};

/// A connection every session of a factory runs its bind's statements on.
#[derive(Clone)]
struct Pinned {
    bind: Bind,
    conn: SharedConnection,
    /// Sessions may begin and end the connection's outer transaction
    owns_outer: bool,
}

/// Produces sessions that share a registry, a default bind and options.
#[derive(Clone)]
pub struct SessionFactory {
    registry: Option<BindRegistry>,
    base: Option<Bind>,
    options: SessionOptions,
    pinned: Option<Pinned>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("bind", &self.base.as_ref().map(Bind::name))
            .field("pinned", &self.pinned.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl SessionFactory {
    pub(crate) fn new(
        registry: Option<BindRegistry>,
        base: Option<Bind>,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry,
            base,
            options,
            pinned: None,
        }
    }

    /// Sessions that run every statement for `bind` on one shared connection.
    pub(crate) fn pinned(bind: Bind, conn: SharedConnection, options: SessionOptions) -> Self {
        Self::pin(bind, conn, options, true)
    }

    /// Like [`SessionFactory::pinned`], for a connection whose outer
    /// transaction belongs to someone else.
    ///
    /// Sessions never end that transaction. Once it is gone they refuse to
    /// start another one.
    pub(crate) fn joined(bind: Bind, conn: SharedConnection, options: SessionOptions) -> Self {
        Self::pin(bind, conn, options, false)
    }

    fn pin(bind: Bind, conn: SharedConnection, options: SessionOptions, owns_outer: bool) -> Self {
        Self {
            registry: bind.registry(),
            base: Some(bind.clone()),
            options,
            pinned: Some(Pinned {
                bind,
                conn,
                owns_outer,
            }),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Session options this crate does not interpret, kept from configuration.
    pub fn extra(&self) -> &BTreeMap<String, JsonValue> {
        &self.options.extra
    }

    pub fn bind(&self) -> Option<&Bind> {
        self.base.as_ref()
    }

    pub fn create(&self) -> Session {
        Session {
            registry: self.registry.clone(),
            base: self.base.clone(),
            forced: None,
            options: self.options.clone(),
            pinned: self.pinned.clone(),
            units: Vec::new(),
            begun: false,
            info: self.options.info.clone(),
        }
    }
}

/// How a unit's transaction sits on its connection.
#[derive(Debug)]
enum UnitTxn {
    /// The session began the connection's transaction
    Outer,
    Savepoint(String),
    /// Joined a transaction someone else began
    Joined,
}

enum UnitConnection {
    Owned(ManagedConnection),
    Shared(SharedConnection),
}

enum ConnGuard<'a> {
    Owned(&'a mut ManagedConnection),
    Shared(MutexGuard<'a, ManagedConnection>),
}

impl Deref for ConnGuard<'_> {
    type Target = ManagedConnection;

    fn deref(&self) -> &ManagedConnection {
        match self {
            Self::Owned(c) => &**c,
            Self::Shared(c) => &**c,
        }
    }
}

impl DerefMut for ConnGuard<'_> {
    fn deref_mut(&mut self) -> &mut ManagedConnection {
        match self {
            Self::Owned(c) => &mut **c,
            Self::Shared(c) => &mut **c,
        }
    }
}

/// The connection and transaction a session holds for one bind.
struct Unit {
    bind: Bind,
    conn: UnitConnection,
    txn: UnitTxn,
    owns_outer: bool,
}

impl Unit {
    async fn lock(&mut self) -> ConnGuard<'_> {
        match &mut self.conn {
            UnitConnection::Owned(c) => ConnGuard::Owned(c),
            UnitConnection::Shared(c) => ConnGuard::Shared(c.lock().await),
        }
    }

    async fn finish(self, commit: bool) -> DbResult<()> {
        debug!(bind = %self.bind.name(), commit, txn = ?self.txn, "Ending session transaction");
        match self.conn {
            UnitConnection::Owned(mut conn) => {
                let ended = if commit {
                    conn.commit().await
                } else {
                    conn.rollback().await
                };
                let closed = conn.close().await;
                match ended {
                    Ok(()) => closed,
                    Err(e) => Err(DbError::with_cleanup(e, closed.err().into_iter().collect())),
                }
            }
            UnitConnection::Shared(shared) => {
                let mut conn = shared.lock().await;
                match (self.txn, commit) {
                    (UnitTxn::Outer, true) => conn.commit().await,
                    (UnitTxn::Outer, false) => conn.rollback().await,
                    (UnitTxn::Savepoint(name), commit) if !conn.has_savepoint(&name) => {
                        // Ended together with a savepoint opened before it
                        if !commit {
                            warn!(
                                bind = %self.bind.name(),
                                savepoint = %name,
                                "Savepoint already ended; its work stays in the outer transaction"
                            );
                        }
                        Ok(())
                    }
                    (UnitTxn::Savepoint(name), true) => conn.release_savepoint(&name).await,
                    (UnitTxn::Savepoint(name), false) => conn.rollback_to_savepoint(&name).await,
                    (UnitTxn::Joined, true) => Ok(()),
                    (UnitTxn::Joined, false) if self.owns_outer => conn.rollback().await,
                    (UnitTxn::Joined, false) => {
                        // The owner still expects an open transaction
                        conn.rollback().await?;
                        conn.begin(None).await
                    }
                }
            }
        }
    }
}

/// Unit of work routing each statement to the right bind.
///
/// A session is used by one task at a time. Dropping a session with open
/// transactions detaches their connections, which rolls them back.
pub struct Session {
    registry: Option<BindRegistry>,
    base: Option<Bind>,
    forced: Option<Bind>,
    options: SessionOptions,
    pinned: Option<Pinned>,
    units: Vec<Unit>,
    begun: bool,
    info: BTreeMap<String, JsonValue>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("bind", &self.base.as_ref().map(Bind::name))
            .field("forced", &self.forced.as_ref().map(Bind::name))
            .field("pinned", &self.pinned.as_ref().map(|p| p.bind.name()))
            .field("active_binds", &self.active_binds())
            .finish()
    }
}

impl Session {
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Free-form data attached to this session.
    pub fn info(&self) -> &BTreeMap<String, JsonValue> {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut BTreeMap<String, JsonValue> {
        &mut self.info
    }

    pub fn registry(&self) -> Option<&BindRegistry> {
        self.registry.as_ref()
    }

    /// Names of the binds with an open transaction in this session.
    pub fn active_binds(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.bind.name()).collect()
    }

    pub fn in_transaction(&self) -> bool {
        self.begun || !self.units.is_empty()
    }

    fn lookup(&self, name: &str) -> DbResult<Bind> {
        if let Some(registry) = &self.registry {
            return registry.get_bind(name);
        }
        match &self.base {
            Some(bind) if bind.name() == name => Ok(bind.clone()),
            _ => Err(DbError::bind_not_found(name, self.base.iter().map(Bind::name))),
        }
    }

    /// Resolve the bind for a statement on `table` (see the module docs).
    pub fn get_bind(&self, table: Option<&Table>) -> DbResult<Bind> {
        if let Some(bind) = &self.forced {
            return Ok(bind.clone());
        }
        if let Some(key) = table.and_then(|t| t.bind_key.as_deref()) {
            return self.lookup(key);
        }
        if let Some(bind) = &self.base {
            return Ok(bind.clone());
        }
        match &self.registry {
            Some(registry) => registry.default_bind(),
            None => Err(DbError::invalid_request("Session has no bind to route to")),
        }
    }

    pub fn get_bind_for<E: Entity>(&self) -> DbResult<Bind> {
        self.get_bind(Some(&E::table()))
    }

    /// A new session routing everything to `name`, ignoring table bind keys.
    ///
    /// The original session is left untouched.
    pub fn using_bind(&self, name: &str) -> DbResult<Session> {
        let bind = self.lookup(name)?;
        Ok(Session {
            registry: self.registry.clone(),
            base: self.base.clone(),
            forced: Some(bind),
            options: self.options.clone(),
            pinned: self.pinned.clone(),
            units: Vec::new(),
            begun: false,
            info: self.info.clone(),
        })
    }

    /// Start a transaction explicitly. Required when `autobegin` is off.
    pub fn begin(&mut self) -> DbResult<()> {
        if self.in_transaction() {
            return Err(DbError::invalid_request(
                "A transaction is already begun on this session",
            ));
        }
        self.begun = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.end(true).await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.end(false).await
    }

    /// Roll back anything pending and release every connection.
    ///
    /// The session stays usable; the next statement starts afresh.
    pub async fn close(&mut self) -> DbResult<()> {
        self.end(false).await
    }

    async fn end(&mut self, commit: bool) -> DbResult<()> {
        let units = std::mem::take(&mut self.units);
        self.begun = false;
        let mut first: Option<DbError> = None;
        let mut errors = Vec::new();
        for unit in units {
            // After one failed commit the remaining binds are rolled back
            let commit_unit = commit && first.is_none();
            if let Err(e) = unit.finish(commit_unit).await {
                match first {
                    None => first = Some(e),
                    Some(_) => errors.push(e),
                }
            }
        }
        match first {
            None => Ok(()),
            Some(e) => Err(DbError::with_cleanup(e, errors)),
        }
    }

    /// Run `f` in a transaction: commit on success, roll back on error.
    pub async fn run_transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, DbResult<T>>,
    {
        match f(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let errors = self.rollback().await.err().into_iter().collect();
                Err(DbError::with_cleanup(e, errors))
            }
        }
    }

    async fn unit_index(&mut self, bind: &Bind) -> DbResult<usize> {
        if let Some(index) = self.units.iter().position(|u| u.bind.ptr_eq(bind)) {
            return Ok(index);
        }
        if !self.options.autobegin && !self.begun {
            return Err(DbError::invalid_request(
                "Session has no transaction and autobegin is disabled; call begin() first",
            ));
        }
        let unit = self.open_unit(bind).await?;
        self.units.push(unit);
        Ok(self.units.len() - 1)
    }

    async fn open_unit(&self, bind: &Bind) -> DbResult<Unit> {
        let isolation = self.options.isolation_level;
        if let Some(pinned) = &self.pinned {
            if pinned.bind.ptr_eq(bind) {
                let mut conn = pinned.conn.lock().await;
                let txn = if !conn.in_transaction() {
                    if !pinned.owns_outer {
                        return Err(DbError::invalid_request(format!(
                            "The transaction this session joined on bind '{}' has ended",
                            bind.name()
                        )));
                    }
                    conn.begin(isolation).await?;
                    UnitTxn::Outer
                } else {
                    match self.options.join_transaction_mode {
                        JoinTransactionMode::CreateSavepoint => {
                            UnitTxn::Savepoint(conn.savepoint().await?)
                        }
                        JoinTransactionMode::ConservativeSavepoint if conn.in_savepoint() => {
                            UnitTxn::Savepoint(conn.savepoint().await?)
                        }
                        JoinTransactionMode::ConservativeSavepoint => UnitTxn::Joined,
                    }
                };
                return Ok(Unit {
                    bind: bind.clone(),
                    conn: UnitConnection::Shared(pinned.conn.clone()),
                    txn,
                    owns_outer: pinned.owns_outer,
                });
            }
        }

        let mut conn = bind.connect().await?;
        if let Err(e) = conn.begin(isolation).await {
            let errors = conn.close().await.err().into_iter().collect();
            return Err(DbError::with_cleanup(e, errors));
        }
        Ok(Unit {
            bind: bind.clone(),
            conn: UnitConnection::Owned(conn),
            txn: UnitTxn::Outer,
            owns_outer: true,
        })
    }

    async fn run_execute(&mut self, bind: &Bind, stmt: &Statement) -> DbResult<ExecResult> {
        let index = self.unit_index(bind).await?;
        let mut conn = self.units[index].lock().await;
        conn.execute(stmt).await
    }

    async fn run_fetch(&mut self, bind: &Bind, stmt: &Statement) -> DbResult<Vec<Row>> {
        let index = self.unit_index(bind).await?;
        let mut conn = self.units[index].lock().await;
        conn.fetch_all(stmt).await
    }

    /// Execute a statement on the bind its table routes to.
    pub async fn execute(&mut self, stmt: impl Into<Statement>) -> DbResult<ExecResult> {
        let stmt = stmt.into();
        let bind = self.get_bind(stmt.table.as_deref())?;
        self.run_execute(&bind, &stmt).await
    }

    /// Execute on an explicitly chosen bind, bypassing routing.
    pub async fn execute_on(
        &mut self,
        bind: &Bind,
        stmt: impl Into<Statement>,
    ) -> DbResult<ExecResult> {
        self.run_execute(bind, &stmt.into()).await
    }

    pub async fn fetch_all(&mut self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        let stmt = stmt.into();
        let bind = self.get_bind(stmt.table.as_deref())?;
        self.run_fetch(&bind, &stmt).await
    }

    pub async fn fetch_on(
        &mut self,
        bind: &Bind,
        stmt: impl Into<Statement>,
    ) -> DbResult<Vec<Row>> {
        self.run_fetch(bind, &stmt.into()).await
    }

    /// Compile a builder for its bind's dialect and execute it.
    pub async fn execute_built<C: Compile>(&mut self, builder: &C) -> DbResult<ExecResult> {
        let bind = self.get_bind(Some(builder.table()))?;
        let stmt = builder.compile(bind.db_type());
        self.run_execute(&bind, &stmt).await
    }

    /// Compile a builder and return its rows (e.g. an insert with RETURNING).
    pub async fn fetch_built<C: Compile>(&mut self, builder: &C) -> DbResult<Vec<Row>> {
        let bind = self.get_bind(Some(builder.table()))?;
        let stmt = builder.compile(bind.db_type());
        self.run_fetch(&bind, &stmt).await
    }

    /// Run a select after the engine's interceptors have rewritten it.
    pub async fn select(&mut self, select: &Select) -> DbResult<Vec<Row>> {
        let bind = self.get_bind(Some(select.table()))?;
        let index = self.unit_index(&bind).await?;
        let mut conn = self.units[index].lock().await;
        let mut select = select.clone();
        conn.engine().interceptors().before_select(&mut select);
        let stmt = select.compile(conn.db_type());
        conn.fetch_all(&stmt).await
    }

    /// Rows of `select` decoded as `T`.
    pub async fn select_as<T: DeserializeOwned>(&mut self, select: &Select) -> DbResult<Vec<T>> {
        self.select(select).await?.into_iter().map(decode_row).collect()
    }

    /// Number of rows `select` matches, ignoring its limit and offset.
    pub async fn count(&mut self, select: &Select) -> DbResult<u64> {
        let bind = self.get_bind(Some(select.table()))?;
        let index = self.unit_index(&bind).await?;
        let mut conn = self.units[index].lock().await;
        let mut select = select.clone();
        conn.engine().interceptors().before_select(&mut select);
        let stmt = select.count_statement(conn.db_type());
        let rows = conn.fetch_all(&stmt).await?;
        rows.first()
            .and_then(|row| row.values().next())
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| DbError::internal("Count query returned no value"))
    }

    /// Run a query and decode each row as `T`.
    ///
    /// Single-column rows decode from the column value, so
    /// `scalars::<i64>("SELECT COUNT(*) FROM t")` works.
    pub async fn scalars<T: DeserializeOwned>(
        &mut self,
        stmt: impl Into<Statement>,
    ) -> DbResult<ScalarResult<T>> {
        let rows = self.fetch_all(stmt).await?;
        ScalarResult::from_rows(rows)
    }

    /// Load an entity by primary key.
    pub async fn get<E: Entity>(&mut self, id: impl Into<QueryParam>) -> DbResult<Option<E>> {
        self.get_with(id, &LookupOptions::default()).await
    }

    pub async fn get_with<E: Entity>(
        &mut self,
        id: impl Into<QueryParam>,
        options: &LookupOptions,
    ) -> DbResult<Option<E>> {
        let table = E::table();
        let pk = table
            .primary_key()
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                DbError::invalid_input(format!("Table '{}' has no primary key", table.name))
            })?;
        let select = Select::from(table)
            .filter_eq(pk, id)
            .for_update(options.for_update)
            .include_inactive(options.include_inactive)
            .limit(1);
        self.select(&select)
            .await?
            .into_iter()
            .next()
            .map(decode_row)
            .transpose()
    }

    /// Load an entity by primary key; a missing row is a not-found error.
    pub async fn get_or_404<E: Entity>(
        &mut self,
        id: impl Into<QueryParam>,
        options: &LookupOptions,
    ) -> DbResult<E> {
        self.get_with(id, options)
            .await?
            .ok_or_else(|| DbError::not_found(options.description.clone()))
    }

    /// First row of `select`; no row is a not-found error.
    pub async fn first_or_404<T: DeserializeOwned>(
        &mut self,
        select: &Select,
        description: Option<&str>,
    ) -> DbResult<T> {
        let rows = self.select(&select.clone().limit(1)).await?;
        rows.into_iter()
            .next()
            .map(decode_row)
            .transpose()?
            .ok_or_else(|| DbError::not_found(description))
    }

    /// The only row of `select`; no row or several rows are both not-found.
    pub async fn one_or_404<T: DeserializeOwned>(
        &mut self,
        select: &Select,
        description: Option<&str>,
    ) -> DbResult<T> {
        let rows = self.select(&select.clone().limit(2)).await?;
        match ScalarResult::from_rows(rows).and_then(ScalarResult::one) {
            Err(DbError::NoResultFound | DbError::MultipleResultsFound { .. }) => {
                Err(DbError::not_found(description))
            }
            other => other,
        }
    }

    /// One page of `select` plus the total count.
    pub async fn paginate<T: DeserializeOwned>(
        &mut self,
        select: &Select,
        request: &PageRequest,
    ) -> DbResult<Pagination<T>> {
        let params = request.resolve()?;
        let rows = match params.offset() {
            Some(offset) => {
                let window = select.clone().limit(params.per_page).offset(offset);
                self.select(&window).await?
            }
            None => Vec::new(),
        };
        if rows.is_empty() && params.page != 1 && params.error_out {
            return Err(DbError::not_found(Some(format!("Page {} is empty", params.page))));
        }
        let total = if params.count {
            Some(self.count(select).await?)
        } else {
            None
        };
        let items = rows.into_iter().map(decode_row).collect::<DbResult<Vec<T>>>()?;
        Ok(Pagination::new(params.page, params.per_page, total, items))
    }
}

/// Options for primary key lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupOptions {
    pub for_update: bool,
    pub include_inactive: bool,
    /// Message carried by the not-found error
    pub description: Option<String>,
}

impl LookupOptions {
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Decode a row as `T`, trying a lone column's value before the whole row.
pub(crate) fn decode_row<T: DeserializeOwned>(row: Row) -> DbResult<T> {
    if row.len() == 1 {
        if let Some(value) = row.values().next() {
            if let Ok(decoded) = T::deserialize(value) {
                return Ok(decoded);
            }
        }
    }
    Ok(serde_json::from_value(JsonValue::Object(row))?)
}

/// Decoded rows of a query, with cardinality checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarResult<T>(Vec<T>);

impl<T: DeserializeOwned> ScalarResult<T> {
    fn from_rows(rows: Vec<Row>) -> DbResult<Self> {
        rows.into_iter()
            .map(decode_row)
            .collect::<DbResult<Vec<T>>>()
            .map(Self)
    }
}

impl<T> ScalarResult<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all(self) -> Vec<T> {
        self.0
    }

    pub fn first(self) -> Option<T> {
        self.0.into_iter().next()
    }

    /// Exactly one row, else `NoResultFound` or `MultipleResultsFound`.
    pub fn one(self) -> DbResult<T> {
        match self.one_or_none()? {
            Some(value) => Ok(value),
            None => Err(DbError::NoResultFound),
        }
    }

    pub fn one_or_none(self) -> DbResult<Option<T>> {
        let count = self.0.len();
        if count > 1 {
            return Err(DbError::MultipleResultsFound { count });
        }
        Ok(self.0.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BindConfig};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pair {
        a: i64,
        b: String,
    }

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_decode_row() {
        let single: i64 = decode_row(row(json!({"COUNT(*)": 3}))).unwrap();
        assert_eq!(single, 3);
        let pair: Pair = decode_row(row(json!({"a": 1, "b": "x"}))).unwrap();
        assert_eq!(pair, Pair { a: 1, b: "x".into() });
    }

    #[test]
    fn test_scalar_cardinality() {
        let none = ScalarResult::<i64>(vec![]);
        assert!(matches!(none.clone().one(), Err(DbError::NoResultFound)));
        assert_eq!(none.one_or_none().unwrap(), None);

        let many = ScalarResult(vec![1, 2]);
        assert!(matches!(
            many.clone().one_or_none(),
            Err(DbError::MultipleResultsFound { count: 2 })
        ));
        assert_eq!(many.first(), Some(1));
    }

    #[tokio::test]
    async fn test_autobegin_disabled_requires_begin() {
        let mut config = BindConfig::new("sqlite::memory:");
        config.session.autobegin = false;
        let registry = BindRegistry::from_config(AppConfig::empty().bind("default", config))
            .await
            .unwrap();
        let mut session = registry.session().unwrap();

        let err = session.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRequest { .. }));

        session.begin().unwrap();
        assert!(session.begin().is_err());
        session.execute("SELECT 1").await.unwrap();
        session.commit().await.unwrap();
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_using_bind_leaves_original_untouched() {
        let config = AppConfig::default()
            .bind("replica", BindConfig::new("sqlite::memory:").read_only(true));
        let registry = BindRegistry::from_config(config).await.unwrap();
        let session = registry.session().unwrap();
        let events = Table::new("events");

        let replica = session.using_bind("replica").unwrap();
        assert_eq!(replica.get_bind(Some(&events)).unwrap().name(), "replica");
        assert_eq!(session.get_bind(Some(&events)).unwrap().name(), "default");
        assert!(matches!(
            session.using_bind("missing"),
            Err(DbError::BindNotFound { .. })
        ));
    }
}
