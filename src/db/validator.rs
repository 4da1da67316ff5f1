//! Read-only enforcement for binds configured with `read_only`.
//!
//! Statements are parsed with [sqlparser](https://docs.rs/sqlparser/) so that no
//! write can slip past the guard through formatting tricks or comments.

use crate::error::{DbError, DbResult};
use crate::models::dialect::DatabaseType;
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Kind of SQL statement, as far as read-only binds care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, SHOW, EXPLAIN of a read
    Read,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    Write,
    /// CREATE, ALTER, DROP, TRUNCATE
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// GRANT, SET, PRAGMA, VACUUM, CALL ...
    Administrative,
    Unknown,
}

fn parser_dialect(db: DatabaseType) -> Box<dyn Dialect> {
    match db {
        DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySql => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Reject any statement that is not a plain read.
///
/// Transaction control is rejected too: sessions issue it themselves and user
/// SQL must go through `begin`/`commit`/`rollback`.
pub fn validate_readonly(sql: &str, db: DatabaseType, bind: &str) -> DbResult<()> {
    let statements = Parser::parse_sql(parser_dialect(db).as_ref(), sql).map_err(|e| {
        DbError::invalid_input(format!(
            "Failed to parse SQL for read-only bind '{}': {}",
            bind, e
        ))
    })?;
    if statements.is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }

    for stmt in &statements {
        let (kind, operation) = classify_statement(stmt);
        if kind != StatementKind::Read {
            let reason = match kind {
                StatementKind::Transaction => format!(
                    "bind '{}' is read-only; use the session's begin/commit/rollback",
                    bind
                ),
                _ => format!("bind '{}' is read-only", bind),
            };
            return Err(DbError::permission(operation, reason));
        }
    }
    Ok(())
}

/// Classify a parsed statement.
pub fn classify_statement(stmt: &Statement) -> (StatementKind, &'static str) {
    match stmt {
        Statement::Query(_) => (StatementKind::Read, "SELECT"),
        Statement::ShowTables { .. } => (StatementKind::Read, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (StatementKind::Read, "SHOW COLUMNS"),
        Statement::ShowCreate { .. } => (StatementKind::Read, "SHOW CREATE"),
        Statement::ShowVariable { .. } => (StatementKind::Read, "SHOW VARIABLE"),
        Statement::ShowVariables { .. } => (StatementKind::Read, "SHOW VARIABLES"),
        Statement::ExplainTable { .. } => (StatementKind::Read, "EXPLAIN TABLE"),
        Statement::Explain { statement, .. } => match classify_statement(statement) {
            (StatementKind::Read, _) => (StatementKind::Read, "EXPLAIN"),
            inner => inner,
        },

        Statement::Insert(_) => (StatementKind::Write, "INSERT"),
        Statement::Update { .. } => (StatementKind::Write, "UPDATE"),
        Statement::Delete(_) => (StatementKind::Write, "DELETE"),
        Statement::Merge { .. } => (StatementKind::Write, "MERGE"),
        Statement::Copy { .. } => (StatementKind::Write, "COPY"),

        Statement::CreateTable { .. } => (StatementKind::Ddl, "CREATE TABLE"),
        Statement::CreateView { .. } => (StatementKind::Ddl, "CREATE VIEW"),
        Statement::CreateIndex(_) => (StatementKind::Ddl, "CREATE INDEX"),
        Statement::CreateSchema { .. } => (StatementKind::Ddl, "CREATE SCHEMA"),
        Statement::CreateDatabase { .. } => (StatementKind::Ddl, "CREATE DATABASE"),
        Statement::CreateTrigger { .. } => (StatementKind::Ddl, "CREATE TRIGGER"),
        Statement::CreateVirtualTable { .. } => (StatementKind::Ddl, "CREATE VIRTUAL TABLE"),
        Statement::AlterTable { .. } => (StatementKind::Ddl, "ALTER TABLE"),
        Statement::AlterView { .. } => (StatementKind::Ddl, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (StatementKind::Ddl, "ALTER INDEX"),
        Statement::Drop { .. } => (StatementKind::Ddl, "DROP"),
        Statement::DropTrigger { .. } => (StatementKind::Ddl, "DROP TRIGGER"),
        Statement::Truncate { .. } => (StatementKind::Ddl, "TRUNCATE"),

        Statement::StartTransaction { .. } => (StatementKind::Transaction, "BEGIN"),
        Statement::Commit { .. } => (StatementKind::Transaction, "COMMIT"),
        Statement::Rollback { .. } => (StatementKind::Transaction, "ROLLBACK"),
        Statement::Savepoint { .. } => (StatementKind::Transaction, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (StatementKind::Transaction, "RELEASE SAVEPOINT"),

        Statement::Call { .. } => (StatementKind::Administrative, "CALL"),
        Statement::Execute { .. } => (StatementKind::Administrative, "EXECUTE"),
        Statement::Grant { .. } => (StatementKind::Administrative, "GRANT"),
        Statement::Revoke { .. } => (StatementKind::Administrative, "REVOKE"),
        Statement::Set(_) => (StatementKind::Administrative, "SET"),
        Statement::Use(_) => (StatementKind::Administrative, "USE"),
        Statement::Vacuum { .. } => (StatementKind::Administrative, "VACUUM"),
        Statement::Analyze { .. } => (StatementKind::Administrative, "ANALYZE"),
        Statement::LockTables { .. } => (StatementKind::Administrative, "LOCK"),
        Statement::Pragma { .. } => (StatementKind::Administrative, "PRAGMA"),
        Statement::AttachDatabase { .. } => (StatementKind::Administrative, "ATTACH"),

        _ => (StatementKind::Unknown, "UNKNOWN"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: DatabaseType = DatabaseType::Postgres;

    #[test]
    fn test_select_allowed() {
        assert!(validate_readonly("SELECT * FROM users WHERE id = $1", DB, "replica").is_ok());
        let sqlite = "SELECT * FROM \"users\" WHERE \"id\" = ?";
        assert!(validate_readonly(sqlite, DatabaseType::SQLite, "replica").is_ok());
        assert!(validate_readonly("SELECT a FROM t1 UNION ALL SELECT b FROM t2", DB, "r").is_ok());
    }

    #[test]
    fn test_writes_rejected_with_bind_name() {
        let err = validate_readonly("INSERT INTO users VALUES (1)", DB, "replica").unwrap_err();
        match err {
            DbError::Permission { operation, reason } => {
                assert_eq!(operation, "INSERT");
                assert!(reason.contains("'replica'"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(validate_readonly("UPDATE users SET name = 'x'", DB, "r").is_err());
        assert!(validate_readonly("DROP TABLE users", DB, "r").is_err());
    }

    #[test]
    fn test_hidden_write_rejected() {
        assert!(validate_readonly("SELECT 1; DELETE FROM users", DB, "r").is_err());
        assert!(validate_readonly("INSERT INTO archive SELECT * FROM users", DB, "r").is_err());
        assert!(validate_readonly("EXPLAIN DELETE FROM users", DB, "r").is_err());
    }

    #[test]
    fn test_transaction_control_rejected() {
        let err = validate_readonly("COMMIT", DB, "r").unwrap_err();
        assert!(err.to_string().contains("begin/commit/rollback"));
    }

    #[test]
    fn test_unparseable_is_invalid_input() {
        let err = validate_readonly("SELEC nonsense", DB, "r").unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }
}
