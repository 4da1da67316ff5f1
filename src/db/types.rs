//! Row decoding and column type mapping.
//!
//! Decoding is two-phase: [`categorize_type`] classifies a driver type name,
//! then a per-dialect decoder extracts the value as JSON. Reflection uses
//! [`column_type_from_sql`] to map introspected type names back to [`ColumnType`].

use crate::models::dialect::DatabaseType;
use crate::models::query::Row as JsonRow;
use crate::models::table::ColumnType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Timestamp,
    TimestampTz,
    Date,
    Uuid,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity is a float
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    match lower.as_str() {
        "timestamptz" => TypeCategory::TimestampTz,
        // MySQL TIMESTAMP is stored in UTC
        "timestamp" if db == DatabaseType::MySql => TypeCategory::TimestampTz,
        "timestamp" | "datetime" => TypeCategory::Timestamp,
        "date" => TypeCategory::Date,
        _ => TypeCategory::Text,
    }
}

/// Map an introspected column type to the closest portable [`ColumnType`].
pub fn column_type_from_sql(type_name: &str) -> ColumnType {
    let lower = type_name.to_lowercase();
    let base = lower.split('(').next().unwrap_or_default().trim();
    match base {
        "int" | "int4" | "integer" | "smallint" | "int2" | "tinyint" | "mediumint" | "serial" => {
            ColumnType::Integer
        }
        "bigint" | "int8" | "bigserial" => ColumnType::BigInt,
        "real" | "float" | "float4" | "float8" | "double" | "double precision" | "numeric"
        | "decimal" => ColumnType::Float,
        "varchar" | "character varying" | "char" | "character" | "bpchar" => ColumnType::String,
        "bool" | "boolean" => ColumnType::Boolean,
        "timestamp" | "timestamptz" | "datetime" | "date" | "timestamp without time zone"
        | "timestamp with time zone" => ColumnType::Timestamp,
        "json" | "jsonb" => ColumnType::Json,
        "blob" | "bytea" | "binary" | "varbinary" | "longblob" => ColumnType::Binary,
        _ => ColumnType::Text,
    }
}

/// Raw DECIMAL/NUMERIC value, kept as the database's exact text.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Read a nullable column, treating decode mismatches as absent.
fn get<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn float(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn text(v: Option<String>) -> JsonValue {
    v.map(JsonValue::String).unwrap_or(JsonValue::Null)
}

fn binary(v: Option<Vec<u8>>) -> JsonValue {
    v.map(|bytes| JsonValue::String(STANDARD.encode(bytes)))
        .unwrap_or(JsonValue::Null)
}

/// Converts a driver row into a JSON row.
pub trait RowToJson {
    fn to_json_row(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::MySql);
                (col.name().to_string(), mysql::decode(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::Postgres);
                (col.name().to_string(), postgres::decode(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::SQLite);
                (col.name().to_string(), sqlite::decode(self, idx, category))
            })
            .collect()
    }
}

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

    pub fn decode(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => text(v.map(|d| d.0)),
                Err(e) => {
                    tracing::error!(column = idx, error = %e, "Failed to decode DECIMAL");
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => get::<_, i64>(row, idx)
                .map(Into::into)
                .or_else(|| get::<_, u64>(row, idx).map(Into::into))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Boolean => get::<_, bool>(row, idx)
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => get::<_, f64>(row, idx)
                .or_else(|| get::<_, f32>(row, idx).map(f64::from))
                .map(float)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => binary(get(row, idx)),
            TypeCategory::Json => get::<_, JsonValue>(row, idx).unwrap_or(JsonValue::Null),
            TypeCategory::TimestampTz => {
                text(get::<_, DateTime<Utc>>(row, idx).map(|v| v.to_rfc3339()))
            }
            TypeCategory::Timestamp => {
                text(get::<_, NaiveDateTime>(row, idx).map(|v| v.to_string()))
            }
            TypeCategory::Date => text(get::<_, NaiveDate>(row, idx).map(|v| v.to_string())),
            TypeCategory::Text | TypeCategory::Uuid => text(get(row, idx)),
        }
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

    pub fn decode(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => text(v.map(|d| d.0)),
                Err(e) => {
                    tracing::error!(column = idx, error = %e, "Failed to decode NUMERIC");
                    JsonValue::Null
                }
            },
            // Each integer width only decodes from its own column type
            TypeCategory::Integer => get::<_, i64>(row, idx)
                .or_else(|| get::<_, i32>(row, idx).map(i64::from))
                .or_else(|| get::<_, i16>(row, idx).map(i64::from))
                .map(Into::into)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Boolean => get::<_, bool>(row, idx)
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => get::<_, f64>(row, idx)
                .or_else(|| get::<_, f32>(row, idx).map(f64::from))
                .map(float)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => binary(get(row, idx)),
            TypeCategory::Json => get::<_, JsonValue>(row, idx).unwrap_or(JsonValue::Null),
            TypeCategory::TimestampTz => {
                text(get::<_, DateTime<Utc>>(row, idx).map(|v| v.to_rfc3339()))
            }
            TypeCategory::Timestamp => {
                text(get::<_, NaiveDateTime>(row, idx).map(|v| v.to_string()))
            }
            TypeCategory::Date => text(get::<_, NaiveDate>(row, idx).map(|v| v.to_string())),
            TypeCategory::Uuid => {
                text(get::<_, sqlx::types::Uuid>(row, idx).map(|v| v.to_string()))
            }
            TypeCategory::Text => text(get(row, idx)),
        }
    }
}

mod sqlite {
    use super::*;

    /// SQLite values are dynamically typed; fall back through the storage classes.
    pub fn decode(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => get::<_, i64>(row, idx)
                .map(Into::into)
                .unwrap_or_else(|| any(row, idx)),
            TypeCategory::Boolean => get::<_, bool>(row, idx)
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float | TypeCategory::Decimal => get::<_, f64>(row, idx)
                .map(float)
                .unwrap_or_else(|| any(row, idx)),
            TypeCategory::Binary => binary(get(row, idx)),
            _ => any(row, idx),
        }
    }

    fn any(row: &SqliteRow, idx: usize) -> JsonValue {
        if let Some(v) = get::<_, String>(row, idx) {
            return JsonValue::String(v);
        }
        if let Some(v) = get::<_, i64>(row, idx) {
            return v.into();
        }
        if let Some(v) = get::<_, f64>(row, idx) {
            return float(v);
        }
        binary(get(row, idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT", DatabaseType::MySql), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT", DatabaseType::Postgres), TypeCategory::Integer);
        assert_eq!(categorize_type("INT8", DatabaseType::Postgres), TypeCategory::Integer);
        assert_eq!(categorize_type("TINYINT", DatabaseType::MySql), TypeCategory::Integer);
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(categorize_type("DECIMAL", DatabaseType::MySql), TypeCategory::Decimal);
        assert_eq!(categorize_type("NUMERIC", DatabaseType::Postgres), TypeCategory::Decimal);
        assert_eq!(categorize_type("NUMERIC", DatabaseType::SQLite), TypeCategory::Float);
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::Postgres),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DatabaseType::MySql),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::MySql),
            TypeCategory::Timestamp
        );
        assert_eq!(categorize_type("DATE", DatabaseType::Postgres), TypeCategory::Date);
        assert_eq!(categorize_type("VARCHAR", DatabaseType::Postgres), TypeCategory::Text);
    }

    #[test]
    fn test_column_type_from_sql() {
        assert_eq!(column_type_from_sql("INTEGER"), ColumnType::Integer);
        assert_eq!(column_type_from_sql("int8"), ColumnType::BigInt);
        assert_eq!(column_type_from_sql("VARCHAR(255)"), ColumnType::String);
        assert_eq!(column_type_from_sql("character varying"), ColumnType::String);
        assert_eq!(column_type_from_sql("jsonb"), ColumnType::Json);
        assert_eq!(column_type_from_sql("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(column_type_from_sql("bytea"), ColumnType::Binary);
        assert_eq!(column_type_from_sql("something_else"), ColumnType::Text);
    }

    #[test]
    fn test_binary_is_base64() {
        assert_eq!(
            binary(Some(b"hello world".to_vec())),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(binary(None), JsonValue::Null);
    }
}
