//! Database dispatch macros for reducing code duplication.
//!
//! Pools are an enum with one variant per backend. The macro expands the same
//! body once per variant so the body can use the backend's concrete pool type.

/// Match on a `DbPool` and run the body with the concrete pool bound.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.close().await,
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
