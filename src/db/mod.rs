//! Binds, engines and the connections they hand out.
//!
//! - Engines and per-database pool dispatch
//! - Managed connections with transaction and override tracking
//! - Interceptors applied at checkout and around statement execution
//! - Schema creation and reflection
//! - Row decoding and parameter binding
//! - The bind registry

pub mod bind;
pub mod connection;
pub mod interceptor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod types;
pub mod validator;

pub use bind::{Bind, BindOptions};
pub use connection::{ManagedConnection, SharedConnection};
pub use interceptor::{
    Interceptor, InterceptorChain, ProcessGuard, QueryInfo, QueryRecorder, SoftDeleteFilter,
    StatementLogger,
};
pub use pool::{DbPool, Engine, ExecutionOptions};
pub use registry::{BindRegistry, BindSelection, RegistryBuilder, SchemaOperation, SchemaReport};
