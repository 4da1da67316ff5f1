//! The set of binds of one application.
//!
//! A registry is built once from an [`AppConfig`] and is read-only afterwards.
//! It is passed explicitly to whatever needs bind resolution; there is no
//! process-wide lookup.

use crate::config::{ALL_BINDS, AppConfig, DEFAULT_BIND, Fixture};
use crate::db::bind::{Bind, BindOptions};
use crate::db::interceptor::{
    Interceptor, InterceptorChain, ProcessGuard, QueryInfo, QueryRecorder, SoftDeleteFilter,
};
use crate::error::{DbError, DbResult};
use crate::models::builder::Insert;
use crate::models::table::{Entity, Metadata, Table};
use crate::retry::RetryPolicy;
use crate::session::{ScopedSessionManager, Session, SessionFactory};
use crate::signals::{BindObserver, Signals};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

pub(crate) struct RegistryInner {
    binds: BTreeMap<String, Bind>,
    metadata: Arc<Metadata>,
    fixtures: BTreeMap<String, Vec<Fixture>>,
    recorder: Option<Arc<QueryRecorder>>,
    signals: Signals,
}

/// Builder validating the whole configuration before any engine exists.
pub struct RegistryBuilder {
    config: AppConfig,
    tables: Vec<Table>,
    interceptors: InterceptorChain,
    signals: Signals,
    retry: RetryPolicy,
    process_guard: bool,
}

impl RegistryBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            tables: Vec::new(),
            interceptors: InterceptorChain::new(),
            signals: Signals::new(),
            retry: RetryPolicy::default(),
            process_guard: true,
        }
    }

    /// Declare a table in code, in addition to the configured ones.
    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn entity<E: Entity>(self) -> Self {
        let table = E::table().as_ref().clone();
        self.table(table)
    }

    /// Interceptor installed on every bind, after the built-in ones.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn BindObserver>) -> Self {
        self.signals.push(observer);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Install the fork-safety checkout guard (default: on).
    pub fn process_guard(mut self, enabled: bool) -> Self {
        self.process_guard = enabled;
        self
    }

    /// Validate everything, then create and initialize every bind.
    ///
    /// If any bind fails to initialize, the binds already initialized are
    /// disposed before the error is returned.
    pub async fn build(self) -> DbResult<BindRegistry> {
        let Self {
            config,
            tables,
            interceptors,
            signals,
            retry,
            process_guard,
        } = self;
        let mut dialects = config.validate(&tables)?;

        let mut metadata = Metadata::new();
        for table in config.tables.into_iter().chain(tables) {
            metadata.add(table);
        }
        let metadata = Arc::new(metadata);

        let mut chain = InterceptorChain::new();
        if process_guard {
            chain.push(Arc::new(ProcessGuard::new()));
        }
        chain.push(Arc::new(SoftDeleteFilter));
        let mut chain = chain.extended(&interceptors);
        let recorder = config.record_queries.then(|| Arc::new(QueryRecorder::new()));
        if let Some(recorder) = &recorder {
            chain.push(recorder.clone());
        }

        let options = BindOptions {
            metadata: metadata.clone(),
            interceptors: chain,
            signals: signals.clone(),
            retry,
        };
        let mut binds = BTreeMap::new();
        for (name, bind_config) in config.binds {
            let dialect = dialects
                .remove(&name)
                .ok_or_else(|| DbError::internal(format!("Bind '{}' was not validated", name)))?;
            let bind = Bind::from_validated(name.clone(), bind_config, dialect, options.clone());
            binds.insert(name, bind);
        }

        let inner = Arc::new_cyclic(|registry| {
            for bind in binds.values() {
                bind.attach(registry.clone());
            }
            RegistryInner {
                binds,
                metadata,
                fixtures: config.fixtures,
                recorder,
                signals,
            }
        });
        let registry = BindRegistry { inner };

        let mut initialized: Vec<&Bind> = Vec::new();
        for bind in registry.inner.binds.values() {
            if let Err(e) = bind.initialize().await {
                error!(bind = %bind.name(), error = %e, "Bind initialization failed");
                for done in initialized {
                    done.dispose().await;
                }
                return Err(e);
            }
            initialized.push(bind);
        }

        info!(
            binds = ?registry.bind_names(),
            tables = registry.inner.metadata.tables().len(),
            "Bind registry ready"
        );
        Ok(registry)
    }
}

/// Which binds a schema operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindSelection {
    All,
    One(String),
    Many(Vec<String>),
}

impl From<&str> for BindSelection {
    fn from(name: &str) -> Self {
        if name == ALL_BINDS {
            Self::All
        } else {
            Self::One(name.to_string())
        }
    }
}

impl From<String> for BindSelection {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<Vec<String>> for BindSelection {
    fn from(names: Vec<String>) -> Self {
        Self::Many(names)
    }
}

impl From<&[&str]> for BindSelection {
    fn from(names: &[&str]) -> Self {
        Self::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaOperation {
    Create,
    Drop,
    Reflect,
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Drop => "drop",
            Self::Reflect => "reflect",
        })
    }
}

/// Per-bind outcome of a schema operation. Binds are independent: a failure
/// on one does not undo what succeeded on another.
#[derive(Debug)]
pub struct SchemaReport {
    pub operation: SchemaOperation,
    /// Bind name and number of tables affected
    pub results: Vec<(String, DbResult<usize>)>,
}

impl SchemaReport {
    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &DbError)> {
        self.results
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Turn any failure into an error naming every failed bind.
    pub fn ensure_success(self) -> DbResult<Self> {
        let failures = self.failures();
        if failures.is_empty() {
            return Ok(self);
        }
        let names: Vec<&str> = failures.iter().map(|(name, _)| *name).collect();
        let detail: Vec<String> = failures
            .iter()
            .map(|(name, e)| format!("{}: {}", name, e))
            .collect();
        Err(DbError::schema(
            format!("{} failed ({})", self.operation, detail.join("; ")),
            names.join(", "),
        ))
    }
}

/// Named binds plus the shared table metadata.
///
/// Cloning is cheap; every clone refers to the same binds.
#[derive(Clone)]
pub struct BindRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for BindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindRegistry")
            .field("binds", &self.bind_names())
            .field("tables", &self.inner.metadata.tables().len())
            .finish()
    }
}

impl BindRegistry {
    pub fn builder(config: AppConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    /// Build with default interceptors and no observers.
    pub async fn from_config(config: AppConfig) -> DbResult<Self> {
        RegistryBuilder::new(config).build().await
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Look up a bind by name. Unknown names are an error, never the default.
    pub fn get_bind(&self, name: &str) -> DbResult<Bind> {
        self.inner
            .binds
            .get(name)
            .cloned()
            .ok_or_else(|| {
                DbError::bind_not_found(name, self.inner.binds.keys().map(String::as_str))
            })
    }

    pub fn default_bind(&self) -> DbResult<Bind> {
        self.get_bind(DEFAULT_BIND)
    }

    /// Bind a table is stored on: its bind key, else the default bind.
    pub fn bind_for_table(&self, table: &Table) -> DbResult<Bind> {
        self.get_bind(table.effective_bind())
    }

    pub fn bind_names(&self) -> Vec<&str> {
        self.inner.binds.keys().map(String::as_str).collect()
    }

    pub fn binds(&self) -> impl Iterator<Item = &Bind> {
        self.inner.binds.values()
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.inner.metadata
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.inner.metadata.get(name)
    }

    pub fn fixture_sets(&self) -> Vec<&str> {
        self.inner.fixtures.keys().map(String::as_str).collect()
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.inner.signals
    }

    /// Routing session factory using the default bind's session options.
    pub fn session_factory(&self) -> DbResult<SessionFactory> {
        let options = self.default_bind()?.config().session.clone();
        Ok(SessionFactory::new(Some(self.clone()), None, options))
    }

    pub fn session(&self) -> DbResult<Session> {
        Ok(self.session_factory()?.create())
    }

    pub fn scoped_session(&self) -> DbResult<ScopedSessionManager> {
        Ok(ScopedSessionManager::new(self.session_factory()?))
    }

    fn resolve(&self, selection: BindSelection) -> DbResult<Vec<Bind>> {
        match selection {
            BindSelection::All => Ok(self.inner.binds.values().cloned().collect()),
            BindSelection::One(name) => Ok(vec![self.get_bind(&name)?]),
            BindSelection::Many(names) => names.iter().map(|n| self.get_bind(n)).collect(),
        }
    }

    async fn run_schema(
        &self,
        operation: SchemaOperation,
        selection: BindSelection,
    ) -> DbResult<SchemaReport> {
        let binds = self.resolve(selection)?;
        let mut report = SchemaReport {
            operation,
            results: Vec::with_capacity(binds.len()),
        };
        for bind in binds {
            let result = match operation {
                SchemaOperation::Create => bind.create_all().await,
                SchemaOperation::Drop => bind.drop_all().await,
                SchemaOperation::Reflect => bind.reflect().await.map(|tables| tables.len()),
            };
            if let Err(e) = &result {
                warn!(bind = %bind.name(), %operation, error = %e, "Schema operation failed");
            }
            report.results.push((bind.name().to_string(), result));
        }
        Ok(report)
    }

    /// Create tables on the selected binds (`"__all__"` for every bind).
    pub async fn create_all(&self, binds: impl Into<BindSelection>) -> DbResult<SchemaReport> {
        self.run_schema(SchemaOperation::Create, binds.into()).await
    }

    pub async fn drop_all(&self, binds: impl Into<BindSelection>) -> DbResult<SchemaReport> {
        self.run_schema(SchemaOperation::Drop, binds.into()).await
    }

    pub async fn reflect(&self, binds: impl Into<BindSelection>) -> DbResult<SchemaReport> {
        self.run_schema(SchemaOperation::Reflect, binds.into()).await
    }

    /// Statements recorded so far; empty unless `record_queries` is set.
    pub fn recorded_queries(&self) -> Vec<QueryInfo> {
        self.inner
            .recorder
            .as_ref()
            .map(|r| r.queries())
            .unwrap_or_default()
    }

    pub fn clear_recorded_queries(&self) {
        if let Some(recorder) = &self.inner.recorder {
            recorder.clear();
        }
    }

    /// Insert the named fixture sets, or every set when `names` is empty.
    ///
    /// Rows are routed by their table's bind key. Every bind touched gets its
    /// own transaction and all of them are committed together at the end.
    pub async fn load_fixtures(&self, names: &[String]) -> DbResult<usize> {
        let sets: Vec<String> = if names.is_empty() {
            self.inner.fixtures.keys().cloned().collect()
        } else {
            names.to_vec()
        };
        let mut fixtures: Vec<&Fixture> = Vec::new();
        for set in &sets {
            let entries = self
                .inner
                .fixtures
                .get(set)
                .ok_or_else(|| DbError::invalid_input(format!("Unknown fixture set '{}'", set)))?;
            fixtures.extend(entries);
        }

        let mut session = self.session()?;
        let result = insert_fixtures(&mut session, &self.inner.metadata, &fixtures).await;
        let rows = match result {
            Ok(rows) => {
                session.commit().await?;
                rows
            }
            Err(e) => {
                let errors = session.close().await.err().into_iter().collect();
                return Err(DbError::with_cleanup(e, errors));
            }
        };

        info!(sets = ?sets, rows, "Fixtures loaded");
        self.inner.signals.emit(|o| o.fixtures_loaded(&sets, rows));
        Ok(rows)
    }

    /// Close the pools of every bind.
    pub async fn dispose_all(&self) {
        for bind in self.inner.binds.values() {
            bind.dispose().await;
        }
    }
}

async fn insert_fixtures(
    session: &mut Session,
    metadata: &Metadata,
    fixtures: &[&Fixture],
) -> DbResult<usize> {
    let mut rows = 0;
    for fixture in fixtures {
        let table = metadata.get(&fixture.table).ok_or_else(|| {
            DbError::configuration(format!("Fixture table '{}' is not declared", fixture.table))
        })?;
        for row in &fixture.rows {
            session.execute_built(&Insert::into(table.clone()).row(row)).await?;
            rows += 1;
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindConfig;
    use crate::models::table::{Column, ColumnType};
    use tempfile::NamedTempFile;

    fn url(file: &NamedTempFile) -> String {
        format!("sqlite:{}", file.path().display())
    }

    #[tokio::test]
    async fn test_get_bind_is_stable_and_strict() {
        let registry = BindRegistry::from_config(AppConfig::default()).await.unwrap();
        let a = registry.get_bind("default").unwrap();
        let b = registry.get_bind("default").unwrap();
        assert!(a.ptr_eq(&b));
        assert!(a.registry().is_some());

        let err = registry.get_bind("nonexistent").unwrap_err();
        assert!(matches!(err, DbError::BindNotFound { .. }));
        assert!(err.to_string().contains("default"));
    }

    #[tokio::test]
    async fn test_invalid_config_creates_no_engine() {
        let config = AppConfig::default()
            .bind("analytics", BindConfig::new("sqlite::memory:"))
            .bind("broken", BindConfig::new("oracle://host/db"));
        let err = BindRegistry::from_config(config).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_bind_selection() {
        assert_eq!(BindSelection::from("__all__"), BindSelection::All);
        assert_eq!(BindSelection::from("default"), BindSelection::One("default".into()));

        let registry = BindRegistry::from_config(AppConfig::default()).await.unwrap();
        let err = registry.create_all("missing").await.unwrap_err();
        assert!(matches!(err, DbError::BindNotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_fixtures_routes_by_bind_key() {
        let main = NamedTempFile::new().unwrap();
        let audit = NamedTempFile::new().unwrap();
        let mut config = AppConfig::empty()
            .bind("default", BindConfig::new(url(&main)))
            .bind("audit", BindConfig::new(url(&audit)))
            .table(
                Table::new("users")
                    .column(Column::id())
                    .column(Column::new("name", ColumnType::String)),
            )
            .table(
                Table::new("events")
                    .bind_key("audit")
                    .column(Column::id())
                    .column(Column::new("kind", ColumnType::String)),
            );
        let json = r#"{"seed": [
            {"table": "users", "rows": [{"name": "ann"}, {"name": "bob"}]},
            {"table": "events", "rows": [{"kind": "signup"}]}
        ]}"#;
        config.fixtures = serde_json::from_str(json).unwrap();

        let registry = BindRegistry::from_config(config).await.unwrap();
        assert!(registry.create_all("__all__").await.unwrap().is_success());
        assert_eq!(registry.load_fixtures(&[]).await.unwrap(), 3);

        let events = registry.get_bind("audit").unwrap();
        let mut session = events.session().unwrap();
        let count: i64 = session
            .scalars("SELECT COUNT(*) FROM events")
            .await
            .unwrap()
            .one()
            .unwrap();
        assert_eq!(count, 1);
        session.close().await.unwrap();

        let err = registry.load_fixtures(&["missing".to_string()]).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }
}
