//! Dialect-independent statement builders.
//!
//! Builders keep their table so a session can route them, and are compiled to
//! SQL only once the target bind (and therefore the dialect) is known.

use crate::models::dialect::DatabaseType;
use crate::models::query::{QueryParam, Row, Statement};
use crate::models::table::Table;
use std::sync::Arc;

/// Something that compiles to a [`Statement`] for a given backend.
pub trait Compile {
    fn table(&self) -> &Arc<Table>;
    fn compile(&self, db: DatabaseType) -> Statement;
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Eq(String, QueryParam),
    Raw(String, Vec<QueryParam>),
}

/// WHERE clause shared by select, update and delete.
#[derive(Debug, Clone, Default, PartialEq)]
struct Filters(Vec<Filter>);

impl Filters {
    fn render(&self, db: DatabaseType, sql: &mut String, params: &mut Vec<QueryParam>) {
        if self.0.is_empty() {
            return;
        }
        let clauses: Vec<String> = self
            .0
            .iter()
            .map(|f| match f {
                Filter::Eq(col, QueryParam::Null) => format!("{} IS NULL", db.quote_ident(col)),
                Filter::Eq(col, value) => {
                    params.push(value.clone());
                    format!("{} = ?", db.quote_ident(col))
                }
                Filter::Raw(expr, values) => {
                    params.extend(values.iter().cloned());
                    format!("({})", expr)
                }
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
}

fn finish(db: DatabaseType, table: &Arc<Table>, sql: String, params: Vec<QueryParam>) -> Statement {
    Statement {
        sql: db.render_placeholders(&sql).into_owned(),
        params,
        table: Some(table.clone()),
    }
}

/// SELECT builder.
#[derive(Debug, Clone)]
pub struct Select {
    table: Arc<Table>,
    columns: Vec<String>,
    filters: Filters,
    order_by: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
    for_update: bool,
    include_inactive: bool,
}

impl Select {
    pub fn from(table: Arc<Table>) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Filters::default(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            for_update: false,
            include_inactive: false,
        }
    }

    /// Restrict the selected columns (default: all).
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.push_filter_eq(column, value);
        self
    }

    /// Raw boolean expression with `?` placeholders.
    pub fn filter_raw(mut self, expr: impl Into<String>, params: Vec<QueryParam>) -> Self {
        self.filters.0.push(Filter::Raw(expr.into(), params));
        self
    }

    pub fn push_filter_eq(&mut self, column: impl Into<String>, value: impl Into<QueryParam>) {
        self.filters.0.push(Filter::Eq(column.into(), value.into()));
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push((column.into(), false));
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push((column.into(), true));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Lock selected rows. Ignored on SQLite, which locks the whole database.
    pub fn for_update(mut self, for_update: bool) -> Self {
        self.for_update = for_update;
        self
    }

    /// Include soft-deleted rows.
    pub fn include_inactive(mut self, include: bool) -> Self {
        self.include_inactive = include;
        self
    }

    pub fn includes_inactive(&self) -> bool {
        self.include_inactive
    }

    /// Row count of this select, ignoring order, limit and offset.
    pub fn count_statement(&self, db: DatabaseType) -> Statement {
        let mut sql = format!("SELECT COUNT(*) FROM {}", db.quote_ident(&self.table.name));
        let mut params = Vec::new();
        self.filters.render(db, &mut sql, &mut params);
        finish(db, &self.table, sql, params)
    }
}

impl Compile for Select {
    fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn compile(&self, db: DatabaseType) -> Statement {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| db.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", columns, db.quote_ident(&self.table.name));
        let mut params = Vec::new();
        self.filters.render(db, &mut sql, &mut params);

        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|(col, desc)| {
                    format!("{}{}", db.quote_ident(col), if *desc { " DESC" } else { "" })
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {}", limit)),
            // OFFSET requires a LIMIT on SQLite and MySQL
            (None, Some(_)) => match db {
                DatabaseType::SQLite => sql.push_str(" LIMIT -1"),
                DatabaseType::MySql => sql.push_str(" LIMIT 18446744073709551615"),
                DatabaseType::Postgres => {}
            },
            (None, None) => {}
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        if self.for_update && db != DatabaseType::SQLite {
            sql.push_str(" FOR UPDATE");
        }

        finish(db, &self.table, sql, params)
    }
}

/// INSERT builder for a single row.
#[derive(Debug, Clone)]
pub struct Insert {
    table: Arc<Table>,
    values: Vec<(String, QueryParam)>,
    returning: bool,
}

impl Insert {
    pub fn into(table: Arc<Table>) -> Self {
        Self {
            table,
            values: Vec::new(),
            returning: false,
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// Take every column of a row.
    pub fn row(mut self, row: &Row) -> Self {
        self.values
            .extend(row.iter().map(|(k, v)| (k.clone(), QueryParam::from_json(v))));
        self
    }

    /// Return the inserted row (PostgreSQL and SQLite).
    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }
}

impl Compile for Insert {
    fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn compile(&self, db: DatabaseType) -> Statement {
        let table = db.quote_ident(&self.table.name);
        let mut sql = if self.values.is_empty() {
            match db {
                DatabaseType::MySql => format!("INSERT INTO {} () VALUES ()", table),
                DatabaseType::Postgres | DatabaseType::SQLite => {
                    format!("INSERT INTO {} DEFAULT VALUES", table)
                }
            }
        } else {
            let columns: Vec<String> = self.values.iter().map(|(c, _)| db.quote_ident(c)).collect();
            let marks = vec!["?"; self.values.len()].join(", ");
            format!("INSERT INTO {} ({}) VALUES ({})", table, columns.join(", "), marks)
        };
        if self.returning && db != DatabaseType::MySql {
            sql.push_str(" RETURNING *");
        }
        let params = self.values.iter().map(|(_, v)| v.clone()).collect();
        finish(db, &self.table, sql, params)
    }
}

/// UPDATE builder.
#[derive(Debug, Clone)]
pub struct Update {
    table: Arc<Table>,
    set: Vec<(String, QueryParam)>,
    filters: Filters,
}

impl Update {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            set: Vec::new(),
            filters: Filters::default(),
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.set.push((column.into(), value.into()));
        self
    }

    pub fn set_row(mut self, row: &Row) -> Self {
        self.set
            .extend(row.iter().map(|(k, v)| (k.clone(), QueryParam::from_json(v))));
        self
    }

    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.filters.0.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn filter_raw(mut self, expr: impl Into<String>, params: Vec<QueryParam>) -> Self {
        self.filters.0.push(Filter::Raw(expr.into(), params));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Compile for Update {
    fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn compile(&self, db: DatabaseType) -> Statement {
        let assignments: Vec<String> = self
            .set
            .iter()
            .map(|(c, _)| format!("{} = ?", db.quote_ident(c)))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            db.quote_ident(&self.table.name),
            assignments.join(", ")
        );
        let mut params: Vec<QueryParam> = self.set.iter().map(|(_, v)| v.clone()).collect();
        self.filters.render(db, &mut sql, &mut params);
        finish(db, &self.table, sql, params)
    }
}

/// DELETE builder.
#[derive(Debug, Clone)]
pub struct Delete {
    table: Arc<Table>,
    filters: Filters,
}

impl Delete {
    pub fn from(table: Arc<Table>) -> Self {
        Self {
            table,
            filters: Filters::default(),
        }
    }

    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.filters.0.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn filter_raw(mut self, expr: impl Into<String>, params: Vec<QueryParam>) -> Self {
        self.filters.0.push(Filter::Raw(expr.into(), params));
        self
    }
}

impl Compile for Delete {
    fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn compile(&self, db: DatabaseType) -> Statement {
        let mut sql = format!("DELETE FROM {}", db.quote_ident(&self.table.name));
        let mut params = Vec::new();
        self.filters.render(db, &mut sql, &mut params);
        finish(db, &self.table, sql, params)
    }
}
