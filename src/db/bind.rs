//! A named database target: one engine plus the session factory bound to it.

use crate::config::{BindConfig, DEFAULT_BIND};
use crate::db::connection::ManagedConnection;
use crate::db::interceptor::{ConnectStatements, InterceptorChain, StatementLogger};
use crate::db::pool::{Engine, ExecutionOptions, create_engine};
use crate::db::registry::{BindRegistry, RegistryInner};
use crate::db::schema;
use crate::error::{DbError, DbResult};
use crate::models::dialect::{DatabaseType, Dialect};
use crate::models::table::{Metadata, Table};
use crate::retry::RetryPolicy;
use crate::session::{BindContext, Session, SessionFactory};
use crate::signals::Signals;
use crate::testing::TestTransaction;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use tracing::{debug, info};

/// Shared collaborators handed to a bind at construction.
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub metadata: Arc<Metadata>,
    /// Registry-wide interceptors; the bind appends its own
    pub interceptors: InterceptorChain,
    pub signals: Signals,
    pub retry: RetryPolicy,
}

struct BindInner {
    name: String,
    config: BindConfig,
    dialect: Dialect,
    options: BindOptions,
    engine: RwLock<Option<Engine>>,
    init: tokio::sync::Mutex<()>,
    reflected: RwLock<Vec<Arc<Table>>>,
    registry: OnceLock<Weak<RegistryInner>>,
}

/// One addressable database target.
///
/// Cloning is cheap and clones compare equal: they are the same bind.
#[derive(Clone)]
pub struct Bind {
    inner: Arc<BindInner>,
}

impl fmt::Debug for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bind")
            .field("name", &self.inner.name)
            .field("url", &self.inner.config.engine.masked_url())
            .field("read_only", &self.inner.config.read_only)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl PartialEq for Bind {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Bind {}

impl Bind {
    /// Validate `config` and create an uninitialized bind.
    pub fn new(name: impl Into<String>, config: BindConfig) -> DbResult<Self> {
        Self::with_options(name, config, BindOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        config: BindConfig,
        options: BindOptions,
    ) -> DbResult<Self> {
        let name = name.into();
        let dialect = config.validate(&name)?;
        Ok(Self::from_validated(name, config, dialect, options))
    }

    pub(crate) fn from_validated(
        name: String,
        config: BindConfig,
        dialect: Dialect,
        options: BindOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BindInner {
                name,
                config,
                dialect,
                options,
                engine: RwLock::new(None),
                init: tokio::sync::Mutex::new(()),
                reflected: RwLock::new(Vec::new()),
                registry: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn attach(&self, registry: Weak<RegistryInner>) {
        let _ = self.inner.registry.set(registry);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BindConfig {
        &self.inner.config
    }

    pub fn dialect(&self) -> &Dialect {
        &self.inner.dialect
    }

    pub fn db_type(&self) -> DatabaseType {
        self.inner.dialect.backend
    }

    /// Derived from the URL's declared driver, never stored separately.
    pub fn is_async(&self) -> bool {
        self.inner.dialect.is_async()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }

    pub fn is_default(&self) -> bool {
        self.inner.name == DEFAULT_BIND
    }

    pub fn ptr_eq(&self, other: &Bind) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registry this bind belongs to, if it is still alive.
    pub fn registry(&self) -> Option<BindRegistry> {
        self.inner
            .registry
            .get()
            .and_then(Weak::upgrade)
            .map(BindRegistry::from_inner)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.options.retry
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.inner.options.signals
    }

    /// Declared tables stored by this bind.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.inner.options.metadata.tables_for_bind(&self.inner.name)
    }

    /// Tables found by the last [`Bind::reflect`].
    pub fn reflected_tables(&self) -> Vec<Arc<Table>> {
        self.inner
            .reflected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn engine_chain(&self) -> InterceptorChain {
        let engine = &self.inner.config.engine;
        let mut chain = self.inner.options.interceptors.clone();
        if !engine.connect_statements.is_empty() {
            chain.push(Arc::new(ConnectStatements(engine.connect_statements.clone())));
        }
        if engine.echo {
            chain.push(Arc::new(StatementLogger));
        }
        chain
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// (Re)create the engine and session factory.
    ///
    /// An existing engine is disposed first, closing its pooled connections.
    pub async fn initialize(&self) -> DbResult<()> {
        let _guard = self.inner.init.lock().await;
        let name = self.name();
        let config = &self.inner.config;

        let previous = self
            .inner
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            debug!(bind = %name, "Disposing previous engine");
            previous.dispose().await;
        }

        self.signals().emit(|o| o.before_engine_created(name, config));
        let engine = create_engine(name, config, &self.inner.dialect, self.engine_chain())?;
        self.signals()
            .emit(|o| o.after_engine_created(name, config, &engine));

        self.signals()
            .emit(|o| o.before_session_factory_created(name, &config.session));
        *self
            .inner
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(engine);
        self.signals()
            .emit(|o| o.after_session_factory_created(name, &config.session));

        info!(
            bind = %name,
            is_async = self.is_async(),
            read_only = self.is_read_only(),
            "Bind initialized"
        );
        Ok(())
    }

    pub fn engine(&self) -> DbResult<Engine> {
        self.inner
            .engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DbError::not_initialized(self.name()))
    }

    /// Check out one connection, retrying transient failures.
    pub async fn connect(&self) -> DbResult<ManagedConnection> {
        let engine = self.engine()?;
        self.inner
            .options
            .retry
            .run("connection checkout", || ManagedConnection::checkout(&engine))
            .await
    }

    /// Factory for sessions defaulting to this bind.
    pub fn session_factory(&self) -> DbResult<SessionFactory> {
        self.engine()?;
        Ok(SessionFactory::new(
            self.registry(),
            Some(self.clone()),
            self.inner.config.session.clone(),
        ))
    }

    pub fn session(&self) -> DbResult<Session> {
        Ok(self.session_factory()?.create())
    }

    pub async fn create_all(&self) -> DbResult<usize> {
        let mut conn = self.connect().await?;
        let created = schema::create_all(&mut conn, &self.tables()).await?;
        conn.close().await?;
        Ok(created)
    }

    pub async fn drop_all(&self) -> DbResult<usize> {
        let mut conn = self.connect().await?;
        let dropped = schema::drop_all(&mut conn, &self.tables()).await?;
        conn.close().await?;
        Ok(dropped)
    }

    /// Load the database's tables; they are kept on the bind.
    pub async fn reflect(&self) -> DbResult<Vec<Arc<Table>>> {
        let mut conn = self.connect().await?;
        let tables: Vec<Arc<Table>> = schema::reflect(&mut conn)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        conn.close().await?;
        *self
            .inner
            .reflected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tables.clone();
        Ok(tables)
    }

    /// Scope using this bind's engine with `options` layered on top.
    pub fn context(&self, options: ExecutionOptions) -> DbResult<BindContext> {
        BindContext::new(self.clone(), options)
    }

    /// Open a rollback-only transaction for test isolation.
    pub async fn test_transaction(&self, savepoint: bool) -> DbResult<TestTransaction> {
        TestTransaction::begin(self, savepoint).await
    }

    /// Run `f` in a session transaction: commit on success, roll back on error.
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, DbResult<T>>,
    {
        let mut session = self.session()?;
        session.run_transaction(f).await
    }

    /// Close the engine's pool. The bind must be initialized again before use.
    pub async fn dispose(&self) {
        let engine = self
            .inner
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            engine.dispose().await;
        }
    }
}
