//! Synchronous facade over the async API.
//!
//! Each type here wraps its async counterpart and drives it on a
//! current-thread runtime owned by the [`BlockingRegistry`]. Use it from plain
//! threads only; calling into it from inside an async runtime is an
//! `InvalidRequest` error.

use crate::config::AppConfig;
use crate::db::bind::Bind;
use crate::db::registry::{BindRegistry, BindSelection, RegistryBuilder, SchemaReport};
use crate::error::{DbError, DbResult};
use crate::models::builder::Select;
use crate::models::query::{ExecResult, QueryParam, Row, Statement};
use crate::models::table::{Entity, Table};
use crate::session::{PageRequest, Pagination, ScalarResult, Session};
use crate::testing::TestTransaction;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;

#[derive(Clone)]
struct Executor(Arc<Runtime>);

impl Executor {
    fn new() -> DbResult<Self> {
        ensure_outside_runtime()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to start runtime: {}", e)))?;
        Ok(Self(Arc::new(runtime)))
    }

    fn block_on<F: Future>(&self, fut: F) -> DbResult<F::Output> {
        ensure_outside_runtime()?;
        Ok(self.0.block_on(fut))
    }

    fn run<T>(&self, fut: impl Future<Output = DbResult<T>>) -> DbResult<T> {
        self.block_on(fut)?
    }
}

fn ensure_outside_runtime() -> DbResult<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(DbError::invalid_request(
            "The blocking API cannot be used from inside an async runtime",
        ));
    }
    Ok(())
}

/// Blocking handle on a [`BindRegistry`].
pub struct BlockingRegistry {
    registry: BindRegistry,
    executor: Executor,
}

impl fmt::Debug for BlockingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingRegistry")
            .field("registry", &self.registry)
            .finish()
    }
}

impl BlockingRegistry {
    pub fn from_config(config: AppConfig) -> DbResult<Self> {
        Self::build(BindRegistry::builder(config))
    }

    pub fn build(builder: RegistryBuilder) -> DbResult<Self> {
        let executor = Executor::new()?;
        let registry = executor.run(builder.build())?;
        Ok(Self { registry, executor })
    }

    /// The async registry underneath.
    pub fn registry(&self) -> &BindRegistry {
        &self.registry
    }

    pub fn get_bind(&self, name: &str) -> DbResult<BlockingBind> {
        Ok(BlockingBind {
            bind: self.registry.get_bind(name)?,
            executor: self.executor.clone(),
        })
    }

    pub fn default_bind(&self) -> DbResult<BlockingBind> {
        Ok(BlockingBind {
            bind: self.registry.default_bind()?,
            executor: self.executor.clone(),
        })
    }

    pub fn session(&self) -> DbResult<BlockingSession> {
        Ok(BlockingSession::new(self.registry.session()?, self.executor.clone()))
    }

    pub fn create_all(&self, binds: impl Into<BindSelection>) -> DbResult<SchemaReport> {
        self.executor.run(self.registry.create_all(binds))
    }

    pub fn drop_all(&self, binds: impl Into<BindSelection>) -> DbResult<SchemaReport> {
        self.executor.run(self.registry.drop_all(binds))
    }

    pub fn reflect(&self, binds: impl Into<BindSelection>) -> DbResult<SchemaReport> {
        self.executor.run(self.registry.reflect(binds))
    }

    pub fn load_fixtures(&self, names: &[String]) -> DbResult<usize> {
        self.executor.run(self.registry.load_fixtures(names))
    }

    pub fn dispose_all(&self) -> DbResult<()> {
        self.executor.block_on(self.registry.dispose_all())
    }
}

impl Drop for BlockingRegistry {
    fn drop(&mut self) {
        let _ = self.dispose_all();
    }
}

/// Blocking handle on one [`Bind`].
#[derive(Clone)]
pub struct BlockingBind {
    bind: Bind,
    executor: Executor,
}

impl fmt::Debug for BlockingBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockingBind").field(&self.bind).finish()
    }
}

impl BlockingBind {
    pub fn name(&self) -> &str {
        self.bind.name()
    }

    pub fn bind(&self) -> &Bind {
        &self.bind
    }

    pub fn session(&self) -> DbResult<BlockingSession> {
        Ok(BlockingSession::new(self.bind.session()?, self.executor.clone()))
    }

    pub fn create_all(&self) -> DbResult<usize> {
        self.executor.run(self.bind.create_all())
    }

    pub fn drop_all(&self) -> DbResult<usize> {
        self.executor.run(self.bind.drop_all())
    }

    pub fn reflect(&self) -> DbResult<Vec<Arc<Table>>> {
        self.executor.run(self.bind.reflect())
    }

    pub fn test_transaction(&self, savepoint: bool) -> DbResult<BlockingTestTransaction> {
        let inner = self.executor.run(self.bind.test_transaction(savepoint))?;
        Ok(BlockingTestTransaction {
            inner: Some(inner),
            executor: self.executor.clone(),
        })
    }

    /// Run `f` in a session transaction: commit on success, roll back on error.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut BlockingSession) -> DbResult<T>,
    ) -> DbResult<T> {
        let mut session = self.session()?;
        let result = session.transaction(f);
        let closed = session.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    pub fn dispose(&self) -> DbResult<()> {
        self.executor.block_on(self.bind.dispose())
    }
}

/// Blocking [`Session`].
pub struct BlockingSession {
    session: Session,
    executor: Executor,
}

impl fmt::Debug for BlockingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockingSession").field(&self.session).finish()
    }
}

impl BlockingSession {
    fn new(session: Session, executor: Executor) -> Self {
        Self { session, executor }
    }

    pub fn inner(&self) -> &Session {
        &self.session
    }

    pub fn using_bind(&self, name: &str) -> DbResult<BlockingSession> {
        Ok(Self::new(self.session.using_bind(name)?, self.executor.clone()))
    }

    pub fn get_bind(&self, table: Option<&Table>) -> DbResult<Bind> {
        self.session.get_bind(table)
    }

    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    pub fn begin(&mut self) -> DbResult<()> {
        self.session.begin()
    }

    pub fn commit(&mut self) -> DbResult<()> {
        self.executor.run(self.session.commit())
    }

    pub fn rollback(&mut self) -> DbResult<()> {
        self.executor.run(self.session.rollback())
    }

    pub fn close(&mut self) -> DbResult<()> {
        self.executor.run(self.session.close())
    }

    /// Run `f`, then commit on success or roll back on error.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> DbResult<T>) -> DbResult<T> {
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                let errors = self.rollback().err().into_iter().collect();
                Err(DbError::with_cleanup(e, errors))
            }
        }
    }

    pub fn execute(&mut self, stmt: impl Into<Statement>) -> DbResult<ExecResult> {
        self.executor.run(self.session.execute(stmt))
    }

    pub fn execute_on(&mut self, bind: &Bind, stmt: impl Into<Statement>) -> DbResult<ExecResult> {
        self.executor.run(self.session.execute_on(bind, stmt))
    }

    pub fn fetch_all(&mut self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        self.executor.run(self.session.fetch_all(stmt))
    }

    pub fn scalars<T: DeserializeOwned>(
        &mut self,
        stmt: impl Into<Statement>,
    ) -> DbResult<ScalarResult<T>> {
        self.executor.run(self.session.scalars(stmt))
    }

    pub fn select(&mut self, select: &Select) -> DbResult<Vec<Row>> {
        self.executor.run(self.session.select(select))
    }

    pub fn select_as<T: DeserializeOwned>(&mut self, select: &Select) -> DbResult<Vec<T>> {
        self.executor.run(self.session.select_as(select))
    }

    pub fn count(&mut self, select: &Select) -> DbResult<u64> {
        self.executor.run(self.session.count(select))
    }

    pub fn get<E: Entity>(&mut self, id: impl Into<QueryParam>) -> DbResult<Option<E>> {
        self.executor.run(self.session.get::<E>(id))
    }

    pub fn paginate<T: DeserializeOwned>(
        &mut self,
        select: &Select,
        request: &PageRequest,
    ) -> DbResult<Pagination<T>> {
        self.executor.run(self.session.paginate(select, request))
    }
}

/// Blocking [`TestTransaction`]. Rolled back on [`close`](Self::close) or drop.
pub struct BlockingTestTransaction {
    inner: Option<TestTransaction>,
    executor: Executor,
}

impl fmt::Debug for BlockingTestTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockingTestTransaction").field(&self.inner).finish()
    }
}

impl BlockingTestTransaction {
    fn inner(&self) -> DbResult<&TestTransaction> {
        self.inner
            .as_ref()
            .ok_or_else(|| DbError::invalid_request("Test transaction is closed"))
    }

    pub fn session(&self) -> DbResult<BlockingSession> {
        Ok(BlockingSession::new(self.inner()?.session()?, self.executor.clone()))
    }

    pub fn close(mut self, original: Option<DbError>) -> DbResult<()> {
        match self.inner.take() {
            Some(inner) => self.executor.run(inner.close(original)),
            None => original.map_or(Ok(()), Err),
        }
    }
}

impl Drop for BlockingTestTransaction {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = self.executor.run(inner.close(None));
        }
    }
}
