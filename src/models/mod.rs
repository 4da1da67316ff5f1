//! Dialects, statements and table declarations.

pub mod builder;
pub mod dialect;
pub mod query;
pub mod table;

pub use builder::{Compile, Delete, Insert, Select, Update};
pub use dialect::{DatabaseType, Dialect, IsolationLevel};
pub use query::{ExecResult, QueryParam, Row, Statement};
pub use table::{ACTIVE_COLUMN, Column, ColumnType, Entity, Metadata, Table};
