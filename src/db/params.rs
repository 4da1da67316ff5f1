//! Parameter binding for database-specific query objects.

use crate::models::query::{QueryParam, Statement};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// Build a MySQL query with every statement parameter bound.
pub(crate) fn mysql_query(stmt: &Statement) -> Query<'_, MySql, MySqlArguments> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), |query, param| match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
            QueryParam::Json(v) => query.bind(Json(v)),
        })
}

/// Build a PostgreSQL query with every statement parameter bound.
pub(crate) fn postgres_query(stmt: &Statement) -> Query<'_, Postgres, PgArguments> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), |query, param| match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
            QueryParam::Json(v) => query.bind(Json(v)),
        })
}

/// Build a SQLite query with every statement parameter bound.
pub(crate) fn sqlite_query(stmt: &Statement) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), |query, param| match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
            // SQLite has no native JSON type, store as text
            QueryParam::Json(v) => query.bind(v.to_string()),
        })
}
