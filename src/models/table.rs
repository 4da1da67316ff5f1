//! Table declarations and the metadata collection they live in.
//!
//! A table may carry a `bind_key` naming the bind that stores it. Tables without
//! one belong to the default bind.

use crate::config::DEFAULT_BIND;
use crate::models::dialect::DatabaseType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name of the column added by [`Table::soft_delete`].
pub const ACTIVE_COLUMN: &str = "is_active";

/// Portable column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInt,
    Float,
    /// VARCHAR(255)
    String,
    Text,
    Boolean,
    Timestamp,
    Json,
    Binary,
}

impl ColumnType {
    pub fn sql_type(&self, db: DatabaseType) -> &'static str {
        use DatabaseType::*;
        match (self, db) {
            (Self::Integer, _) => "INTEGER",
            (Self::BigInt, SQLite) => "INTEGER",
            (Self::BigInt, _) => "BIGINT",
            (Self::Float, Postgres) => "DOUBLE PRECISION",
            (Self::Float, MySql) => "DOUBLE",
            (Self::Float, SQLite) => "REAL",
            (Self::String, _) => "VARCHAR(255)",
            (Self::Text, _) => "TEXT",
            (Self::Boolean, _) => "BOOLEAN",
            (Self::Timestamp, MySql) => "DATETIME",
            (Self::Timestamp, _) => "TIMESTAMP",
            (Self::Json, Postgres) => "JSONB",
            (Self::Json, MySql) => "JSON",
            (Self::Json, SQLite) => "TEXT",
            (Self::Binary, Postgres) => "BYTEA",
            (Self::Binary, _) => "BLOB",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A column declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub autoincrement: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    /// Raw SQL default expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            primary_key: false,
            autoincrement: false,
            nullable: true,
            unique: false,
            default: None,
        }
    }

    /// Auto-incrementing integer primary key named `id`.
    pub fn id() -> Self {
        Self {
            primary_key: true,
            autoincrement: true,
            nullable: false,
            ..Self::new("id", ColumnType::Integer)
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    fn definition(&self, db: DatabaseType, inline_pk: bool) -> String {
        let name = db.quote_ident(&self.name);
        if self.autoincrement && inline_pk {
            let serial = match (db, self.ty) {
                (DatabaseType::SQLite, _) => "INTEGER PRIMARY KEY",
                (DatabaseType::Postgres, ColumnType::BigInt) => "BIGSERIAL PRIMARY KEY",
                (DatabaseType::Postgres, _) => "SERIAL PRIMARY KEY",
                (DatabaseType::MySql, ColumnType::BigInt) => "BIGINT AUTO_INCREMENT PRIMARY KEY",
                (DatabaseType::MySql, _) => "INTEGER AUTO_INCREMENT PRIMARY KEY",
            };
            return format!("{} {}", name, serial);
        }

        let mut def = format!("{} {}", name, self.ty.sql_type(db));
        if inline_pk {
            def.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if self.unique && !inline_pk {
            def.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }
}

/// A table declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Bind storing this table; `None` means the default bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_key: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Rows carry an `is_active` flag and are hidden from queries once deactivated.
    #[serde(default)]
    pub soft_delete: bool,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_key: None,
            columns: Vec::new(),
            soft_delete: false,
        }
    }

    pub fn bind_key(mut self, key: impl Into<String>) -> Self {
        self.bind_key = Some(key.into());
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Add the `is_active` flag used by soft deletion.
    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self.normalize()
    }

    /// Add `created_at` and `updated_at`, both defaulting to the current time.
    pub fn timestamps(self) -> Self {
        self.column(
            Column::new("created_at", ColumnType::Timestamp)
                .not_null()
                .default_sql("CURRENT_TIMESTAMP"),
        )
        .column(
            Column::new("updated_at", ColumnType::Timestamp)
                .not_null()
                .default_sql("CURRENT_TIMESTAMP"),
        )
    }

    /// Fill in columns implied by flags (tables loaded from configuration).
    pub fn normalize(mut self) -> Self {
        if self.soft_delete && self.column_named(ACTIVE_COLUMN).is_none() {
            self.columns.push(
                Column::new(ACTIVE_COLUMN, ColumnType::Boolean)
                    .not_null()
                    .default_sql("TRUE"),
            );
        }
        self
    }

    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// First primary key column.
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Bind this table is routed to.
    pub fn effective_bind(&self) -> &str {
        self.bind_key.as_deref().unwrap_or(DEFAULT_BIND)
    }

    pub fn create_sql(&self, db: DatabaseType) -> String {
        let pks: Vec<&Column> = self.columns.iter().filter(|c| c.primary_key).collect();
        let inline = pks.len() == 1;

        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.definition(db, inline && c.primary_key))
            .collect();
        if pks.len() > 1 {
            let names: Vec<String> = pks.iter().map(|c| db.quote_ident(&c.name)).collect();
            defs.push(format!("PRIMARY KEY ({})", names.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            db.quote_ident(&self.name),
            defs.join(", ")
        )
    }

    pub fn drop_sql(&self, db: DatabaseType) -> String {
        format!("DROP TABLE IF EXISTS {}", db.quote_ident(&self.name))
    }
}

/// The set of declared tables, shared by every bind of a registry.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    tables: Vec<Arc<Table>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, replacing any earlier table of the same name.
    pub fn add(&mut self, table: Table) -> Arc<Table> {
        let table = Arc::new(table.normalize());
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table.clone(),
            None => self.tables.push(table.clone()),
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.iter().find(|t| t.name == name).cloned()
    }

    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    /// Tables stored by `bind`, in declaration order.
    pub fn tables_for_bind(&self, bind: &str) -> Vec<Arc<Table>> {
        self.tables
            .iter()
            .filter(|t| t.effective_bind() == bind)
            .cloned()
            .collect()
    }
}

/// A row type mapped onto a declared table.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn table() -> Arc<Table>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Table {
        Table::new("users")
            .column(Column::id())
            .column(Column::new("name", ColumnType::String).not_null())
            .column(Column::new("email", ColumnType::String).unique())
    }

    #[test]
    fn test_create_sql_sqlite() {
        assert_eq!(
            users().create_sql(DatabaseType::SQLite),
            "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" INTEGER PRIMARY KEY, \
             \"name\" VARCHAR(255) NOT NULL, \"email\" VARCHAR(255) UNIQUE)"
        );
    }

    #[test]
    fn test_create_sql_serial_keys() {
        let pg = users().create_sql(DatabaseType::Postgres);
        assert!(pg.contains("\"id\" SERIAL PRIMARY KEY"));
        let mysql = users().create_sql(DatabaseType::MySql);
        assert!(mysql.contains("`id` INTEGER AUTO_INCREMENT PRIMARY KEY"));
    }

    #[test]
    fn test_composite_primary_key() {
        let table = Table::new("memberships")
            .column(Column::new("user_id", ColumnType::Integer).primary_key())
            .column(Column::new("group_id", ColumnType::Integer).primary_key());
        let sql = table.create_sql(DatabaseType::SQLite);
        assert!(sql.ends_with("PRIMARY KEY (\"user_id\", \"group_id\"))"));
    }

    #[test]
    fn test_soft_delete_adds_flag_once() {
        let table = users().soft_delete().normalize();
        let flags = table.columns.iter().filter(|c| c.name == ACTIVE_COLUMN).count();
        assert_eq!(flags, 1);
        assert!(table.create_sql(DatabaseType::SQLite).contains("DEFAULT TRUE"));
    }

    #[test]
    fn test_tables_for_bind() {
        let mut metadata = Metadata::new();
        metadata.add(users());
        metadata.add(Table::new("events").bind_key("analytics"));

        let default: Vec<String> = metadata
            .tables_for_bind(DEFAULT_BIND)
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(default, vec!["users"]);
        assert_eq!(metadata.tables_for_bind("analytics").len(), 1);
        assert!(metadata.tables_for_bind("other").is_empty());
    }

    #[test]
    fn test_table_from_json() {
        let table: Table = serde_json::from_str(
            r#"{"name": "posts", "bind_key": "blog", "soft_delete": true,
                "columns": [{"name": "id", "type": "integer", "primary_key": true, "autoincrement": true}]}"#,
        )
        .unwrap();
        let table = table.normalize();
        assert_eq!(table.bind_key.as_deref(), Some("blog"));
        assert!(table.column_named(ACTIVE_COLUMN).is_some());
        assert_eq!(table.primary_key().map(|c| c.name.as_str()), Some("id"));
    }
}
