//! Transaction-aware wrapper around a physical connection.
//!
//! A [`ConnectionLease`] is what application code holds. Lifecycle calls that
//! would interfere with an enclosing transaction (commit, rollback, forcing
//! autocommit on, closing) are rejected while the lease is enlisted; the
//! coordinator owns those boundaries. Work operations mark the lease used so
//! the coordinator can skip flushing connections nobody touched.

use crate::db::physical::PhysicalConnection;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionIdentity, DatabaseType, QueryParam, Row};
use async_trait::async_trait;
use tracing::debug;

/// Object-safe view of a lease, handed to schema units.
#[async_trait]
pub trait SqlExecutor: Send {
    fn database_type(&self) -> DatabaseType;

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;
}

/// Outcome of [`ConnectionLease::execute_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub chunks: usize,
    pub rows_affected: u64,
}

pub struct ConnectionLease<C> {
    id: String,
    identity: ConnectionIdentity,
    connection: C,
    used_since_last_flush: bool,
    active_checkout_count: u32,
    enlisted: bool,
    /// Statements per chunk in [`execute_batch`](Self::execute_batch).
    batch_size: usize,
}

impl<C> std::fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("used_since_last_flush", &self.used_since_last_flush)
            .field("active_checkout_count", &self.active_checkout_count)
            .field("enlisted", &self.enlisted)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl<C> ConnectionLease<C> {
    /// Wrap a freshly borrowed connection. The checkout count starts at zero;
    /// the coordinator calls [`acquire`](Self::acquire) for the first caller.
    pub(crate) fn new(identity: ConnectionIdentity, connection: C, batch_size: usize) -> Self {
        Self {
            id: generate_lease_id(),
            identity,
            connection,
            used_since_last_flush: false,
            active_checkout_count: 0,
            enlisted: false,
            batch_size: batch_size.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn is_used(&self) -> bool {
        self.used_since_last_flush
    }

    pub fn is_enlisted(&self) -> bool {
        self.enlisted
    }

    pub fn active_checkout_count(&self) -> u32 {
        self.active_checkout_count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn acquire(&mut self) {
        self.active_checkout_count += 1;
    }

    pub(crate) fn release(&mut self) -> DbResult<()> {
        if self.active_checkout_count == 0 {
            return Err(DbError::illegal_state(format!(
                "Connection {} released more times than it was acquired",
                self.id
            )));
        }
        self.active_checkout_count -= 1;
        Ok(())
    }

    pub(crate) fn mark_used(&mut self, used: bool) {
        self.used_since_last_flush = used;
    }

    pub(crate) fn into_connection(self) -> C {
        self.connection
    }

    fn ensure_checked_out(&self) -> DbResult<()> {
        if self.active_checkout_count == 0 {
            return Err(DbError::illegal_state(format!(
                "Connection {} used after it was returned to the pool",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_not_enlisted(&self, operation: &str) -> DbResult<()> {
        if self.enlisted {
            return Err(DbError::illegal_state(format!(
                "Connection in transaction cannot be {} directly, use the transaction instead",
                operation
            )));
        }
        Ok(())
    }

    /// Always fails: leases go back to the pool through the coordinator.
    pub fn close(&mut self) -> DbResult<()> {
        Err(DbError::illegal_state(format!(
            "Connection {} cannot be closed directly, release it instead",
            self.id
        )))
    }
}

impl<C: PhysicalConnection> ConnectionLease<C> {
    pub fn auto_commit(&self) -> bool {
        self.connection.auto_commit()
    }

    pub fn database_type(&self) -> DatabaseType {
        self.connection.database_type()
    }

    /// Put the lease under (or take it out of) a transaction's control.
    ///
    /// Enlisting switches autocommit off; leaving the transaction keeps the
    /// connection's autocommit state as it is.
    pub(crate) async fn enlist(&mut self, in_transaction: bool) -> DbResult<()> {
        if in_transaction && self.connection.auto_commit() {
            self.connection.set_auto_commit(false).await?;
        }
        self.enlisted = in_transaction;
        Ok(())
    }

    /// Bring autocommit in line with a new request on a non-enlisted lease.
    pub(crate) async fn reset_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        if self.enlisted || self.connection.auto_commit() == auto_commit {
            return Ok(());
        }
        self.connection.set_auto_commit(auto_commit).await
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.ensure_checked_out()?;
        self.mark_used(true);
        self.connection.execute(sql, params).await
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.ensure_checked_out()?;
        self.mark_used(true);
        self.connection.fetch_all(sql, params).await
    }

    /// Execute `sql` once per parameter set, in chunks of the configured
    /// batch size.
    ///
    /// Returns the number of chunks sent and the total number of affected rows.
    pub async fn execute_batch(
        &mut self,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> DbResult<BatchResult> {
        self.ensure_checked_out()?;
        self.mark_used(true);
        let mut result = BatchResult::default();
        for (chunk_index, chunk) in param_sets.chunks(self.batch_size).enumerate() {
            for params in chunk {
                result.rows_affected += self.connection.execute(sql, params).await?;
            }
            result.chunks += 1;
            debug!(
                lease_id = %self.id,
                chunk = chunk_index,
                statements = chunk.len(),
                "Executed batch chunk"
            );
        }
        Ok(result)
    }

    pub async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.execute(&format!("SAVEPOINT {}", name), &[]).await?;
        Ok(())
    }

    pub async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await?;
        Ok(())
    }

    pub async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.execute(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await?;
        Ok(())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_not_enlisted("committed")?;
        self.connection.commit().await?;
        self.mark_used(false);
        Ok(())
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_not_enlisted("rolled back")?;
        self.connection.rollback().await?;
        self.mark_used(false);
        Ok(())
    }

    pub async fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        if auto_commit {
            self.ensure_not_enlisted("switched to autocommit")?;
        }
        self.connection.set_auto_commit(auto_commit).await
    }
}

#[async_trait]
impl<C: PhysicalConnection> SqlExecutor for ConnectionLease<C> {
    fn database_type(&self) -> DatabaseType {
        self.connection.database_type()
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        ConnectionLease::execute(self, sql, params).await
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        ConnectionLease::fetch_all(self, sql, params).await
    }
}

/// Generate a unique lease ID.
fn generate_lease_id() -> String {
    format!("lease_{}", uuid::Uuid::new_v4().simple())
}
