//! The two seams between the coordinator and the outside world.
//!
//! [`PhysicalConnection`] is one real database connection with JDBC-like
//! autocommit semantics. [`ConnectionSource`] hands such connections out and
//! takes them back; [`ConnectionManager`](super::ConnectionManager) is the
//! sqlx-backed implementation.

use crate::error::DbResult;
use crate::models::{ConnectionIdentity, Credentials, DatabaseType, QueryParam, Row};
use async_trait::async_trait;

/// A physical database connection.
///
/// With autocommit on, every statement commits on its own. With autocommit
/// off, statements accumulate until [`commit`](Self::commit) or
/// [`rollback`](Self::rollback). Turning autocommit back on commits pending
/// work.
#[async_trait]
pub trait PhysicalConnection: Send + 'static {
    fn database_type(&self) -> DatabaseType;

    fn auto_commit(&self) -> bool;

    async fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;
}

/// Pool-like provider of physical connections.
///
/// Implementations must be safe to share between tasks; the pool is the only
/// state shared across execution contexts.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: PhysicalConnection;

    /// Fill in the default data source and credentials for a request.
    async fn resolve_identity(
        &self,
        data_source: Option<&str>,
        credentials: Option<Credentials>,
    ) -> DbResult<ConnectionIdentity>;

    /// Borrow a connection, waiting or growing per the pool's policy.
    async fn borrow(&self, identity: &ConnectionIdentity) -> DbResult<Self::Connection>;

    /// Return a connection previously obtained from [`borrow`](Self::borrow).
    async fn give_back(&self, connection: Self::Connection);
}
