//! Multi-bind database access on top of sqlx.
//!
//! A [`BindRegistry`] owns one [`Bind`] per configured database. Sessions route
//! each statement to the bind its table belongs to, scoped sessions give every
//! request or task its own session, and [`TestTransaction`] wraps a test in a
//! transaction that is always rolled back.

pub mod blocking;
pub mod config;
pub mod db;
pub mod error;
pub mod framework;
pub mod models;
pub mod repository;
pub mod retry;
pub mod session;
pub mod signals;
pub mod testing;

pub use config::{AppConfig, BindConfig, JoinTransactionMode, SessionOptions};
pub use db::{Bind, BindRegistry, BindSelection};
pub use error::{DbError, DbResult};
pub use models::{Entity, Row, Select, Statement, Table};
pub use repository::Repository;
pub use retry::RetryPolicy;
pub use session::{
    BindContext, LookupOptions, PageRequest, Pagination, Session, SessionFactory,
    ScopedSessionManager,
};
pub use signals::BindObserver;
pub use testing::TestTransaction;
