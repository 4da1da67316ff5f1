//! Dialect detection and per-dialect SQL rendering.
//!
//! A connection URL scheme has the shape `backend[+driver]`. The backend picks
//! the sqlx driver; the driver suffix declares whether the URL is meant for the
//! async or the blocking (sync) facade.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::str::FromStr;

/// Driver suffix that declares a synchronous URL.
pub const BLOCKING_DRIVER: &str = "blocking";

const ASYNC_DRIVERS: &[&str] = &["async", "sqlx"];

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Includes MariaDB
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Parse the backend part of a URL scheme.
    pub fn from_backend(backend: &str) -> Option<Self> {
        match backend.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// URL scheme understood by sqlx for this backend.
    fn sqlx_scheme(&self, original: &str) -> &'static str {
        match self {
            Self::Postgres if original.eq_ignore_ascii_case("postgresql") => "postgresql",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Postgres | Self::SQLite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Rewrite `?` placeholders into the dialect's native style.
    ///
    /// PostgreSQL uses `$1, $2, ...`; placeholders inside quoted text are left alone.
    pub fn render_placeholders<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        if *self != Self::Postgres || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }

        let mut out = String::with_capacity(sql.len() + 8);
        let mut index = 0;
        let mut quote: Option<char> = None;
        for ch in sql.chars() {
            match (quote, ch) {
                (None, '\'' | '"') => {
                    quote = Some(ch);
                    out.push(ch);
                }
                (Some(q), c) if c == q => {
                    quote = None;
                    out.push(ch);
                }
                (None, '?') => {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                }
                _ => out.push(ch),
            }
        }
        Cow::Owned(out)
    }

    /// Statement that opens a transaction.
    pub fn begin_sql(&self) -> &'static str {
        match self {
            Self::MySql => "START TRANSACTION",
            Self::Postgres | Self::SQLite => "BEGIN",
        }
    }

    /// Query returning the server version as a single text column.
    pub fn version_sql(&self) -> &'static str {
        match self {
            Self::SQLite => "SELECT sqlite_version()",
            Self::MySql | Self::Postgres => "SELECT version()",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Backend plus declared driver, derived from a connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub backend: DatabaseType,
    pub driver: Option<String>,
}

impl Dialect {
    /// Parse the dialect from a connection URL.
    pub fn from_url(url: &str) -> DbResult<Self> {
        let (scheme, _) = split_scheme(url)?;
        let (backend, driver) = match scheme.split_once('+') {
            Some((backend, driver)) => (backend, Some(driver.to_ascii_lowercase())),
            None => (scheme, None),
        };

        let backend = DatabaseType::from_backend(backend).ok_or_else(|| {
            DbError::configuration(format!(
                "Unknown database backend '{}'. Supported: postgres, mysql, sqlite",
                backend
            ))
        })?;

        if let Some(driver) = driver.as_deref() {
            if driver != BLOCKING_DRIVER && !ASYNC_DRIVERS.contains(&driver) {
                return Err(DbError::configuration(format!(
                    "Unknown driver '{}' for {}. Use '+async' or '+{}'",
                    driver, backend, BLOCKING_DRIVER
                )));
            }
        }

        Ok(Self { backend, driver })
    }

    /// Whether the URL declares an async-capable driver.
    ///
    /// Derived from the URL rather than stored, so it can never disagree with
    /// the driver actually used.
    pub fn is_async(&self) -> bool {
        self.driver.as_deref() != Some(BLOCKING_DRIVER)
    }

    /// Strip the driver suffix so sqlx can parse the URL.
    pub fn normalize_url(&self, url: &str) -> DbResult<String> {
        let (scheme, rest) = split_scheme(url)?;
        let backend = scheme.split('+').next().unwrap_or(scheme);
        Ok(format!("{}:{}", self.backend.sqlx_scheme(backend), rest))
    }
}

fn split_scheme(url: &str) -> DbResult<(&str, &str)> {
    url.split_once(':')
        .filter(|(scheme, _)| !scheme.is_empty())
        .ok_or_else(|| {
            DbError::configuration(format!(
                "Connection URL '{}' has no scheme (expected e.g. sqlite:app.db)",
                url
            ))
        })
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[serde(rename = "READ UNCOMMITTED", alias = "read_uncommitted")]
    ReadUncommitted,
    #[serde(rename = "READ COMMITTED", alias = "read_committed")]
    ReadCommitted,
    #[serde(rename = "REPEATABLE READ", alias = "repeatable_read")]
    RepeatableRead,
    #[serde(rename = "SERIALIZABLE", alias = "serializable")]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    fn unsupported(&self, db: DatabaseType, hint: &str) -> DbError {
        DbError::invalid_input(format!(
            "Isolation level {} is not supported by {}{}",
            self.as_sql(),
            db,
            hint
        ))
    }

    /// Statements that make this level the connection's default.
    pub fn connection_statements(&self, db: DatabaseType) -> DbResult<Vec<String>> {
        match db {
            DatabaseType::Postgres => Ok(vec![format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                self.as_sql()
            )]),
            DatabaseType::MySql => Ok(vec![format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                self.as_sql()
            )]),
            DatabaseType::SQLite => match self {
                Self::ReadUncommitted => Ok(vec!["PRAGMA read_uncommitted = 1".to_string()]),
                Self::Serializable => Ok(vec!["PRAGMA read_uncommitted = 0".to_string()]),
                _ => Err(self.unsupported(db, " (use SERIALIZABLE or READ UNCOMMITTED)")),
            },
        }
    }

    /// Statements that restore the server default isolation on a connection.
    pub fn reset_statements(db: DatabaseType) -> Vec<String> {
        match db {
            DatabaseType::Postgres => vec!["RESET default_transaction_isolation".to_string()],
            DatabaseType::MySql => vec![
                "SET SESSION transaction_isolation = @@GLOBAL.transaction_isolation".to_string(),
            ],
            DatabaseType::SQLite => vec!["PRAGMA read_uncommitted = 0".to_string()],
        }
    }

    /// Statements that open a transaction, optionally at a specific level.
    pub fn begin_statements(level: Option<Self>, db: DatabaseType) -> DbResult<Vec<String>> {
        let Some(level) = level else {
            return Ok(vec![db.begin_sql().to_string()]);
        };
        match db {
            DatabaseType::Postgres => Ok(vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]),
            DatabaseType::MySql => Ok(vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
                db.begin_sql().to_string(),
            ]),
            DatabaseType::SQLite => match level {
                Self::Serializable => Ok(vec![db.begin_sql().to_string()]),
                _ => Err(level.unsupported(
                    db,
                    " per transaction (set it on the engine or a bind context instead)",
                )),
            },
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(DbError::invalid_input(format!(
                "Unknown isolation level '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        let d = Dialect::from_url("postgres://localhost/db").unwrap();
        assert_eq!(d.backend, DatabaseType::Postgres);
        assert!(d.is_async());

        let d = Dialect::from_url("postgresql+async://localhost/db").unwrap();
        assert_eq!(d.backend, DatabaseType::Postgres);
        assert!(d.is_async());

        let d = Dialect::from_url("sqlite+blocking:app.db").unwrap();
        assert_eq!(d.backend, DatabaseType::SQLite);
        assert!(!d.is_async());

        let d = Dialect::from_url("mariadb://localhost/db").unwrap();
        assert_eq!(d.backend, DatabaseType::MySql);
    }

    #[test]
    fn test_dialect_rejects_unknown_backend_and_driver() {
        assert!(matches!(
            Dialect::from_url("oracle://localhost"),
            Err(DbError::Configuration { .. })
        ));
        assert!(matches!(
            Dialect::from_url("sqlite+pysqlite:app.db"),
            Err(DbError::Configuration { .. })
        ));
        assert!(Dialect::from_url("no-scheme").is_err());
    }

    #[test]
    fn test_normalize_url_strips_driver() {
        let d = Dialect::from_url("sqlite+blocking:app.db").unwrap();
        assert_eq!(d.normalize_url("sqlite+blocking:app.db").unwrap(), "sqlite:app.db");

        let d = Dialect::from_url("mariadb://u:p@h/db").unwrap();
        assert_eq!(d.normalize_url("mariadb://u:p@h/db").unwrap(), "mysql://u:p@h/db");

        let d = Dialect::from_url("postgresql+async://h/db").unwrap();
        assert_eq!(
            d.normalize_url("postgresql+async://h/db").unwrap(),
            "postgresql://h/db"
        );
    }

    #[test]
    fn test_render_placeholders_postgres() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = '?' AND c = ?";
        assert_eq!(
            DatabaseType::Postgres.render_placeholders(sql),
            "SELECT * FROM t WHERE a = $1 AND b = '?' AND c = $2"
        );
        assert_eq!(DatabaseType::SQLite.render_placeholders(sql), sql);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(DatabaseType::MySql.quote_ident("user"), "`user`");
        assert_eq!(DatabaseType::Postgres.quote_ident("user"), "\"user\"");
        assert_eq!(DatabaseType::SQLite.quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "read_committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "SERIALIZABLE".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("SNAPSHOT".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_statements_sqlite() {
        let stmts = IsolationLevel::ReadUncommitted
            .connection_statements(DatabaseType::SQLite)
            .unwrap();
        assert_eq!(stmts, vec!["PRAGMA read_uncommitted = 1"]);
        assert!(
            IsolationLevel::ReadCommitted
                .connection_statements(DatabaseType::SQLite)
                .is_err()
        );
        assert!(
            IsolationLevel::begin_statements(
                Some(IsolationLevel::ReadUncommitted),
                DatabaseType::SQLite
            )
            .is_err()
        );
    }

    #[test]
    fn test_begin_statements() {
        assert_eq!(
            IsolationLevel::begin_statements(None, DatabaseType::MySql).unwrap(),
            vec!["START TRANSACTION"]
        );
        assert_eq!(
            IsolationLevel::begin_statements(
                Some(IsolationLevel::Serializable),
                DatabaseType::Postgres
            )
            .unwrap(),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE"]
        );
    }

    #[test]
    fn test_isolation_level_serde_names() {
        let level: IsolationLevel = serde_json::from_str("\"REPEATABLE READ\"").unwrap();
        assert_eq!(level, IsolationLevel::RepeatableRead);
        let level: IsolationLevel = serde_json::from_str("\"serializable\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }
}
