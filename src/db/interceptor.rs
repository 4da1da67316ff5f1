//! Engine middleware.
//!
//! Every behaviour that runs on connect, on checkout, before a select or after a
//! statement is an explicit [`Interceptor`] in an ordered [`InterceptorChain`].
//! Engine construction walks the chain and wires it into the pool hooks.

use crate::models::builder::Select;
use crate::models::dialect::DatabaseType;
use crate::models::query::QueryParam;
use crate::models::table::ACTIVE_COLUMN;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A pooled connection about to be handed out.
#[derive(Debug, Clone)]
pub struct CheckoutInfo {
    pub bind: String,
    /// Time since the connection was opened
    pub age: Duration,
    pub idle_for: Duration,
}

/// A statement that has finished executing.
#[derive(Debug, Clone)]
pub struct ExecutedStatement<'a> {
    pub bind: &'a str,
    pub sql: &'a str,
    pub params: &'a [QueryParam],
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub rows: u64,
}

/// Hooks run by an engine. Every hook defaults to doing nothing.
pub trait Interceptor: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Statements run on every newly opened connection.
    fn connect_statements(&self, _db: DatabaseType) -> Vec<String> {
        Vec::new()
    }

    /// Return `false` to discard the connection instead of using it.
    fn on_checkout(&self, _info: &CheckoutInfo) -> bool {
        true
    }

    fn before_select(&self, _select: &mut Select) {}

    fn after_execute(&self, _stmt: &ExecutedStatement<'_>) {}
}

/// Ordered list of interceptors.
#[derive(Debug, Clone, Default)]
pub struct InterceptorChain(Vec<Arc<dyn Interceptor>>);

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.0.push(interceptor);
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.push(interceptor);
        self
    }

    /// Chain followed by the interceptors of `other`.
    pub fn extended(&self, other: &InterceptorChain) -> Self {
        Self(self.0.iter().chain(other.0.iter()).cloned().collect())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|i| i.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn connect_statements(&self, db: DatabaseType) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|i| i.connect_statements(db))
            .collect()
    }

    /// True when every interceptor accepts the connection.
    pub fn on_checkout(&self, info: &CheckoutInfo) -> bool {
        self.0.iter().all(|i| i.on_checkout(info))
    }

    pub fn before_select(&self, select: &mut Select) {
        for interceptor in &self.0 {
            interceptor.before_select(select);
        }
    }

    pub fn after_execute(&self, stmt: &ExecutedStatement<'_>) {
        for interceptor in &self.0 {
            interceptor.after_execute(stmt);
        }
    }
}

type PidFn = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Discards pooled connections opened by another process.
///
/// A connection socket inherited across a fork must never be shared by both
/// processes. The guard remembers which process it belongs to; when the
/// current process changes it adopts the new one and rejects every connection
/// opened before the adoption.
pub struct ProcessGuard {
    pid: PidFn,
    owner: Mutex<(u32, Instant)>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self::with_pid_source(Arc::new(std::process::id))
    }

    /// Guard reading the process id from `pid` instead of the OS.
    pub fn with_pid_source(pid: PidFn) -> Self {
        let current = pid();
        Self {
            pid,
            owner: Mutex::new((current, Instant::now())),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcessGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGuard").finish_non_exhaustive()
    }
}

impl Interceptor for ProcessGuard {
    fn name(&self) -> &str {
        "process_guard"
    }

    fn on_checkout(&self, info: &CheckoutInfo) -> bool {
        let current = (self.pid)();
        let mut owner = match self.owner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if owner.0 != current {
            warn!(
                bind = %info.bind,
                previous_pid = owner.0,
                pid = current,
                "Process changed; discarding inherited pooled connections"
            );
            *owner = (current, Instant::now());
        }
        let accepted = info.age <= owner.1.elapsed();
        if !accepted {
            warn!(
                bind = %info.bind,
                pid = current,
                "Discarding connection opened by another process"
            );
        }
        accepted
    }
}

/// Hides soft-deleted rows from selects on soft-delete tables.
#[derive(Debug, Default)]
pub struct SoftDeleteFilter;

impl Interceptor for SoftDeleteFilter {
    fn name(&self) -> &str {
        "soft_delete"
    }

    fn before_select(&self, select: &mut Select) {
        use crate::models::builder::Compile;
        if select.table().soft_delete && !select.includes_inactive() {
            select.push_filter_eq(ACTIVE_COLUMN, true);
        }
    }
}

/// A recorded statement execution.
#[derive(Debug, Clone, Serialize)]
pub struct QueryInfo {
    pub statement: String,
    pub parameters: Vec<QueryParam>,
    pub bind: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
}

/// Records every executed statement.
#[derive(Debug, Default)]
pub struct QueryRecorder {
    queries: Mutex<Vec<QueryInfo>>,
}

impl QueryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queries(&self) -> Vec<QueryInfo> {
        match self.queries.lock() {
            Ok(q) => q.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        match self.queries.lock() {
            Ok(mut q) => q.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl Interceptor for QueryRecorder {
    fn name(&self) -> &str {
        "query_recorder"
    }

    fn after_execute(&self, stmt: &ExecutedStatement<'_>) {
        let info = QueryInfo {
            statement: stmt.sql.to_string(),
            parameters: stmt.params.to_vec(),
            bind: stmt.bind.to_string(),
            start_time: stmt.start_time,
            end_time: stmt.end_time,
            duration: stmt.duration,
        };
        match self.queries.lock() {
            Ok(mut q) => q.push(info),
            Err(poisoned) => poisoned.into_inner().push(info),
        }
    }
}

/// Logs every statement at info level (`echo`).
#[derive(Debug, Default)]
pub struct StatementLogger;

impl Interceptor for StatementLogger {
    fn name(&self) -> &str {
        "echo"
    }

    fn after_execute(&self, stmt: &ExecutedStatement<'_>) {
        info!(
            bind = %stmt.bind,
            sql = %stmt.sql,
            params = stmt.params.len(),
            rows = stmt.rows,
            elapsed_ms = stmt.duration.as_millis() as u64,
            "Executed statement"
        );
    }
}

/// Runs fixed statements on every new connection.
#[derive(Debug, Clone)]
pub struct ConnectStatements(pub Vec<String>);

impl Interceptor for ConnectStatements {
    fn name(&self) -> &str {
        "connect_statements"
    }

    fn connect_statements(&self, _db: DatabaseType) -> Vec<String> {
        self.0.clone()
    }
}
