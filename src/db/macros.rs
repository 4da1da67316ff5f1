//! Dispatch macro over the per-database enums.

/// Generate match arms for the per-database variants of an enum in
/// [`crate::db::pool`] (`DbPool`, `DbConnection`).
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbConnection, self, {
///     MySql(c) => run(c).await,
///     Postgres(c) => run(c).await,
///     SQLite(c) => run(c).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($enum:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$enum::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
