//! Schema maintenance: create, drop and reflect the tables of one bind.
//!
//! Each operation runs inside a single transaction on one connection. MySQL
//! commits DDL implicitly, so there a failure part-way leaves earlier tables
//! in place.

use crate::config::DEFAULT_BIND;
use crate::db::connection::ManagedConnection;
use crate::db::types::column_type_from_sql;
use crate::error::{DbError, DbResult};
use crate::models::dialect::DatabaseType;
use crate::models::query::{Row, Statement};
use crate::models::table::{Column, Table};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

/// SQL queries used for reflection, organized by database type.
mod queries {
    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT t.table_name::text AS table_name
            FROM information_schema.tables t
            WHERE t.table_schema = current_schema()
            AND t.table_type = 'BASE TABLE'
            ORDER BY t.table_name
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            c.column_name::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            c.is_nullable::text AS is_nullable,
            c.column_default::text AS column_default,
            CASE WHEN pk.column_name IS NOT NULL THEN true ELSE false END AS is_primary_key
        FROM information_schema.columns c
        JOIN pg_class t ON t.relname = c.table_name
        JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
        LEFT JOIN (
            SELECT kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_name = ?
            AND tc.table_schema = current_schema()
            AND tc.constraint_type = 'PRIMARY KEY'
        ) pk ON c.column_name = pk.column_name
        WHERE c.table_name = ? AND c.table_schema = current_schema()
        ORDER BY c.ordinal_position
        "#;
    }

    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT CONVERT(TABLE_NAME USING utf8mb4) AS table_name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8mb4) AS column_name,
            CONVERT(COLUMN_TYPE USING utf8mb4) AS column_type,
            CONVERT(IS_NULLABLE USING utf8mb4) AS is_nullable,
            CONVERT(COLUMN_DEFAULT USING utf8mb4) AS column_default,
            CONVERT(COLUMN_KEY USING utf8mb4) = 'PRI' AS is_primary_key,
            CONVERT(EXTRA USING utf8mb4) AS extra
        FROM information_schema.columns
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE()
        ORDER BY ORDINAL_POSITION
        "#;
    }

    pub mod sqlite {
        pub const LIST_TABLES: &str = r#"
            SELECT name AS table_name FROM sqlite_master
            WHERE type = 'table'
            AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;

        // Table-valued pragma so read-only binds accept it as a query
        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT name AS column_name, type AS column_type, "notnull" AS not_null,
                dflt_value AS column_default, pk AS is_primary_key
            FROM pragma_table_info(?)
            "#;
    }
}

/// Commit on success; roll back and keep the original error on failure.
async fn finish<T>(conn: &mut ManagedConnection, result: DbResult<T>) -> DbResult<T> {
    match result {
        Ok(value) => {
            conn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            let errors = conn.rollback().await.err().into_iter().collect();
            Err(DbError::with_cleanup(e, errors))
        }
    }
}

/// Create every table in `tables` that does not exist yet.
pub async fn create_all(conn: &mut ManagedConnection, tables: &[Arc<Table>]) -> DbResult<usize> {
    let db = conn.db_type();
    let bind = conn.bind_name().to_string();
    conn.begin(None).await?;
    let result = run_ddl(conn, tables.iter().map(|t| (t, t.create_sql(db)))).await;
    let created = finish(conn, result).await?;
    info!(bind = %bind, tables = created, "Schema created");
    Ok(created)
}

async fn run_ddl<'t>(
    conn: &mut ManagedConnection,
    statements: impl Iterator<Item = (&'t Arc<Table>, String)>,
) -> DbResult<usize> {
    let mut count = 0;
    for (table, sql) in statements {
        debug!(bind = %conn.bind_name(), table = %table.name, sql = %sql, "Running DDL");
        conn.execute(&Statement::new(sql))
            .await
            .map_err(|e| schema_error(e, &table.name))?;
        count += 1;
    }
    Ok(count)
}

/// Drop every table in `tables`, in reverse declaration order.
pub async fn drop_all(conn: &mut ManagedConnection, tables: &[Arc<Table>]) -> DbResult<usize> {
    let db = conn.db_type();
    let bind = conn.bind_name().to_string();
    conn.begin(None).await?;
    let result = run_ddl(conn, tables.iter().rev().map(|t| (t, t.drop_sql(db)))).await;
    let dropped = finish(conn, result).await?;
    info!(bind = %bind, tables = dropped, "Schema dropped");
    Ok(dropped)
}

/// Load the definitions of every base table present in the database.
///
/// Reflected tables carry the bind's name as their bind key (none for the
/// default bind) so they route back to where they were found.
pub async fn reflect(conn: &mut ManagedConnection) -> DbResult<Vec<Table>> {
    let db = conn.db_type();
    let bind = conn.bind_name().to_string();
    let (list_sql, columns_sql) = match db {
        DatabaseType::Postgres => (
            queries::postgres::LIST_TABLES,
            queries::postgres::DESCRIBE_COLUMNS,
        ),
        DatabaseType::MySql => (queries::mysql::LIST_TABLES, queries::mysql::DESCRIBE_COLUMNS),
        DatabaseType::SQLite => (queries::sqlite::LIST_TABLES, queries::sqlite::DESCRIBE_COLUMNS),
    };

    conn.begin(None).await?;
    let result = reflect_tables(conn, &bind, list_sql, columns_sql).await;
    let tables = finish(conn, result).await?;

    info!(bind = %bind, tables = tables.len(), "Schema reflected");
    Ok(tables)
}

async fn reflect_tables(
    conn: &mut ManagedConnection,
    bind: &str,
    list_sql: &str,
    columns_sql: &str,
) -> DbResult<Vec<Table>> {
    let db = conn.db_type();
    let names: Vec<String> = conn
        .fetch_all(&Statement::new(list_sql))
        .await?
        .iter()
        .filter_map(|row| text(row, "table_name"))
        .collect();

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let mut stmt = Statement::new(columns_sql).bind(name.as_str());
        if db == DatabaseType::Postgres {
            stmt = stmt.bind(name.as_str());
        }
        let rows = conn.fetch_all(&stmt).await?;
        let mut table = Table::new(&name);
        if bind != DEFAULT_BIND {
            table = table.bind_key(bind);
        }
        for row in &rows {
            table = table.column(reflect_column(row, db));
        }
        table.soft_delete = table.column_named(crate::models::table::ACTIVE_COLUMN).is_some();
        tables.push(table);
    }
    Ok(tables)
}

fn schema_error(err: DbError, table: &str) -> DbError {
    match err {
        DbError::Database { message, .. } => DbError::schema(message, table),
        other => other,
    }
}

fn text(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn flag(row: &Row, key: &str) -> bool {
    match row.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(JsonValue::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn reflect_column(row: &Row, db: DatabaseType) -> Column {
    let name = text(row, "column_name").unwrap_or_default();
    let sql_type = text(row, "column_type").unwrap_or_default();
    let nullable = match db {
        DatabaseType::SQLite => !flag(row, "not_null"),
        DatabaseType::Postgres | DatabaseType::MySql => {
            text(row, "is_nullable").is_some_and(|v| v.eq_ignore_ascii_case("YES"))
        }
    };
    let default = text(row, "column_default");
    let primary_key = flag(row, "is_primary_key");
    let autoincrement = match db {
        DatabaseType::MySql => text(row, "extra").is_some_and(|e| e.contains("auto_increment")),
        DatabaseType::Postgres => default.as_deref().is_some_and(|d| d.starts_with("nextval(")),
        DatabaseType::SQLite => primary_key && sql_type.eq_ignore_ascii_case("INTEGER"),
    };

    Column {
        name,
        ty: column_type_from_sql(&sql_type),
        primary_key,
        autoincrement,
        nullable: nullable && !primary_key,
        unique: false,
        default,
    }
}
