//! Sessions: routing, scoping, overrides and pagination.

pub mod context;
pub mod pagination;
pub mod routing;
pub mod scoped;

pub use context::BindContext;
pub use pagination::{PageParams, PageRequest, Pagination};
pub use routing::{LookupOptions, ScalarResult, Session, SessionFactory};
pub use scoped::{ScopeKey, ScopedSession, ScopedSessionManager, ThreadScope, current_scope};
