//! Single-connection-per-context transaction coordination.
//!
//! Every execution context (one task, one [`TransactionContext`]) owns at
//! most one [`ConnectionLease`] and at most one transaction. Code can request
//! a connection before or after `begin`, release it before or after `commit`,
//! and the coordinator keeps the two lifecycles consistent:
//!
//! - a lease requested inside a transaction is enlisted on creation;
//! - a lease requested before `begin` is enlisted by `begin`;
//! - a lease released inside a transaction stays checked out of the pool
//!   until the transaction ends, then goes back (deferred return);
//! - commit and rollback only touch the physical connection if it did work
//!   since it was enlisted.
//!
//! The context is never shared between tasks. A task spawned from another one
//! starts with no lease and no transaction and opens its own [`Session`].

use crate::config::TransactionOptions;
use crate::db::lease::ConnectionLease;
use crate::db::physical::ConnectionSource;
use crate::error::{DbError, DbResult};
use crate::models::Credentials;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Status of the transaction bound to a context.
///
/// `Committed` and `RolledBack` are kept until the next `begin`; they mean the
/// same as `NoTransaction` for deciding whether a transaction is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    NoTransaction,
    Active,
    MarkedRollback,
    Committed,
    RolledBack,
    Committing,
    RollingBack,
    Unknown,
}

impl TransactionStatus {
    /// `Active` or `MarkedRollback`: commit and rollback are allowed.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoTransaction => "no transaction",
            Self::Active => "active",
            Self::MarkedRollback => "marked rollback",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Committing => "committing",
            Self::RollingBack => "rolling back",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Snapshot of the current transaction, for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub lease_id: Option<String>,
}

/// Per-context coordinator state.
pub struct TransactionContext<C> {
    status: TransactionStatus,
    transaction_id: Option<String>,
    started_at: Option<(Instant, DateTime<Utc>)>,
    lease: Option<ConnectionLease<C>>,
}

impl<C> Default for TransactionContext<C> {
    fn default() -> Self {
        Self {
            status: TransactionStatus::NoTransaction,
            transaction_id: None,
            started_at: None,
            lease: None,
        }
    }
}

impl<C> std::fmt::Debug for TransactionContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("status", &self.status)
            .field("transaction_id", &self.transaction_id)
            .field("lease", &self.lease)
            .finish()
    }
}

impl<C> TransactionContext<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    pub fn lease(&self) -> Option<&ConnectionLease<C>> {
        self.lease.as_ref()
    }

    /// The issued lease, if `lease_id` names it.
    pub fn lease_mut(&mut self, lease_id: &str) -> DbResult<&mut ConnectionLease<C>> {
        match self.lease.as_mut() {
            Some(lease) if lease.id() == lease_id => Ok(lease),
            Some(_) => Err(DbError::illegal_state(format!(
                "Connection {} was not issued by this context",
                lease_id
            ))),
            None => Err(DbError::illegal_state(format!(
                "Connection {} is not issued, it was already returned to the pool",
                lease_id
            ))),
        }
    }
}

/// Which way a transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Rollback,
}

impl Outcome {
    fn in_flight(&self) -> TransactionStatus {
        match self {
            Self::Commit => TransactionStatus::Committing,
            Self::Rollback => TransactionStatus::RollingBack,
        }
    }
}

/// Implements begin/commit/rollback and lease issue/return on top of a
/// [`ConnectionSource`].
pub struct TransactionCoordinator<S: ConnectionSource> {
    source: Arc<S>,
    options: TransactionOptions,
}

impl<S: ConnectionSource> TransactionCoordinator<S> {
    pub fn new(source: Arc<S>, options: TransactionOptions) -> Self {
        Self { source, options }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Open a session: a fresh context bound to this coordinator.
    pub fn session(self: &Arc<Self>) -> Session<S> {
        Session::new(Arc::clone(self))
    }

    pub fn status(&self, ctx: &TransactionContext<S::Connection>) -> TransactionStatus {
        ctx.status
    }

    pub fn transaction_info(
        &self,
        ctx: &TransactionContext<S::Connection>,
    ) -> Option<TransactionInfo> {
        let transaction_id = ctx.transaction_id.clone()?;
        let (instant, started_at) = ctx.started_at?;
        Some(TransactionInfo {
            transaction_id,
            status: ctx.status,
            started_at,
            duration_secs: instant.elapsed().as_secs(),
            lease_id: ctx.lease.as_ref().map(|l| l.id().to_string()),
        })
    }

    /// Start a transaction on this context.
    pub async fn begin(&self, ctx: &mut TransactionContext<S::Connection>) -> DbResult<()> {
        if ctx.status.is_in_progress() {
            return Err(DbError::illegal_state(format!(
                "Transaction {} is already in progress ({}), nested transactions are not supported",
                ctx.transaction_id.as_deref().unwrap_or("?"),
                ctx.status
            )));
        }

        if let Some(lease) = ctx.lease.as_mut() {
            lease.enlist(true).await?;
            // Work done before begin was autocommitted or belongs to the caller
            lease.mark_used(false);
        }

        let transaction_id = generate_transaction_id();
        ctx.status = TransactionStatus::Active;
        ctx.started_at = Some((Instant::now(), Utc::now()));

        if self.options.monitor {
            info!(
                transaction_id = %transaction_id,
                lease_id = ?ctx.lease.as_ref().map(|l| l.id()),
                "Transaction started"
            );
        } else {
            debug!(transaction_id = %transaction_id, "Transaction started");
        }
        ctx.transaction_id = Some(transaction_id);
        Ok(())
    }

    /// Issue the context's lease, creating it on first request.
    ///
    /// Every successful call must be paired with one
    /// [`return_connection`](Self::return_connection).
    pub async fn request_connection<'a>(
        &self,
        ctx: &'a mut TransactionContext<S::Connection>,
        auto_commit: bool,
        data_source: Option<&str>,
        credentials: Option<Credentials>,
    ) -> DbResult<&'a mut ConnectionLease<S::Connection>> {
        let identity = self
            .source
            .resolve_identity(data_source, credentials)
            .await?;

        let issue_new = match ctx.lease.as_mut() {
            Some(lease) => {
                if lease.identity() != &identity {
                    return Err(DbError::identity_mismatch(
                        identity.to_string(),
                        lease.identity().to_string(),
                    ));
                }
                lease.reset_auto_commit(auto_commit).await?;
                lease.acquire();
                debug!(
                    lease_id = %lease.id(),
                    checkouts = lease.active_checkout_count(),
                    "Reissued connection"
                );
                false
            }
            None => true,
        };

        if issue_new {
            let in_transaction = ctx.status.is_in_progress();
            let connection = self.source.borrow(&identity).await?;
            let mut lease = ConnectionLease::new(identity, connection, self.options.batch_size);
            if let Err(e) = Self::prepare_lease(&mut lease, auto_commit, in_transaction).await {
                self.source.give_back(lease.into_connection()).await;
                return Err(e);
            }
            lease.acquire();
            debug!(
                lease_id = %lease.id(),
                identity = %lease.identity(),
                enlisted = lease.is_enlisted(),
                "Issued connection"
            );
            ctx.lease = Some(lease);
        }

        ctx.lease
            .as_mut()
            .ok_or_else(|| DbError::internal("Connection lease disappeared while being issued"))
    }

    async fn prepare_lease(
        lease: &mut ConnectionLease<S::Connection>,
        auto_commit: bool,
        in_transaction: bool,
    ) -> DbResult<()> {
        if in_transaction {
            lease.enlist(true).await
        } else {
            lease.reset_auto_commit(auto_commit).await
        }
    }

    /// Give back one checkout of the context's lease.
    ///
    /// The physical connection only goes back to the pool when the last
    /// checkout ends and no transaction holds it.
    pub async fn return_connection(
        &self,
        ctx: &mut TransactionContext<S::Connection>,
        lease_id: &str,
    ) -> DbResult<()> {
        let lease = ctx.lease_mut(lease_id)?;
        lease.release()?;
        debug!(
            lease_id = %lease_id,
            checkouts = lease.active_checkout_count(),
            enlisted = lease.is_enlisted(),
            "Released connection"
        );
        self.return_if_idle(ctx).await;
        Ok(())
    }

    /// Hand the lease back to the pool once nobody holds it.
    async fn return_if_idle(&self, ctx: &mut TransactionContext<S::Connection>) {
        let idle = ctx
            .lease
            .as_ref()
            .is_some_and(|l| l.active_checkout_count() == 0 && !l.is_enlisted());
        if !idle {
            return;
        }
        if let Some(lease) = ctx.lease.take() {
            debug!(lease_id = %lease.id(), "Returning connection to the pool");
            self.source.give_back(lease.into_connection()).await;
        }
    }

    pub async fn commit(&self, ctx: &mut TransactionContext<S::Connection>) -> DbResult<()> {
        match ctx.status {
            TransactionStatus::Active => {}
            TransactionStatus::MarkedRollback => {
                debug!(
                    transaction_id = ?ctx.transaction_id,
                    "Transaction marked rollback only, rolling back instead of commit"
                );
                return self.finish(ctx, Outcome::Rollback).await;
            }
            status => {
                return Err(DbError::illegal_state(format!(
                    "No transaction in progress ({}), cannot commit",
                    status
                )));
            }
        }

        if let Some((started, _)) = ctx.started_at {
            let elapsed = started.elapsed();
            if elapsed > self.options.timeout {
                warn!(
                    transaction_id = ?ctx.transaction_id,
                    elapsed_secs = elapsed.as_secs(),
                    "Transaction timed out, rolling back instead of commit"
                );
                self.finish(ctx, Outcome::Rollback).await?;
                return Err(DbError::timeout("transaction", elapsed.as_secs()));
            }
        }

        self.finish(ctx, Outcome::Commit).await
    }

    pub async fn rollback(&self, ctx: &mut TransactionContext<S::Connection>) -> DbResult<()> {
        if !ctx.status.is_in_progress() {
            return Err(DbError::illegal_state(format!(
                "No transaction in progress ({}), cannot roll back",
                ctx.status
            )));
        }
        self.finish(ctx, Outcome::Rollback).await
    }

    /// Make the only possible outcome of the current transaction a rollback.
    pub fn set_rollback_only(&self, ctx: &mut TransactionContext<S::Connection>) -> DbResult<()> {
        if ctx.status != TransactionStatus::Active {
            return Err(DbError::illegal_state(format!(
                "Transaction is {}, cannot mark it rollback only",
                ctx.status
            )));
        }
        ctx.status = TransactionStatus::MarkedRollback;
        debug!(transaction_id = ?ctx.transaction_id, "Transaction marked rollback only");
        Ok(())
    }

    /// End the transaction. Always leaves the context in a terminal status.
    async fn finish(
        &self,
        ctx: &mut TransactionContext<S::Connection>,
        outcome: Outcome,
    ) -> DbResult<()> {
        ctx.status = outcome.in_flight();
        let mut terminal = match outcome {
            Outcome::Commit => TransactionStatus::Committed,
            Outcome::Rollback => TransactionStatus::RolledBack,
        };
        let mut flushed = false;

        let result = match ctx.lease.as_mut() {
            Some(lease) => {
                // Leaving the transaction first lets the lease flush itself
                let result = match lease.enlist(false).await {
                    Ok(()) if lease.is_used() => {
                        flushed = true;
                        match outcome {
                            Outcome::Commit => lease.commit().await,
                            Outcome::Rollback => lease.rollback().await,
                        }
                    }
                    other => other,
                };
                lease.mark_used(false);

                if let Err(e) = &result {
                    if outcome == Outcome::Commit {
                        terminal = TransactionStatus::RolledBack;
                        if let Err(rollback_err) = lease.rollback().await {
                            error!(
                                lease_id = %lease.id(),
                                error = %rollback_err,
                                commit_error = %e,
                                "Rollback after failed commit also failed"
                            );
                        }
                        lease.mark_used(false);
                    }
                }
                result
            }
            None => Ok(()),
        };

        ctx.status = terminal;
        let elapsed_ms = ctx
            .started_at
            .map(|(started, _)| started.elapsed().as_millis())
            .unwrap_or_default();

        match &result {
            Ok(()) if self.options.monitor => info!(
                transaction_id = ?ctx.transaction_id,
                status = %terminal,
                flushed = flushed,
                elapsed_ms = elapsed_ms as u64,
                "Transaction finished"
            ),
            Ok(()) => debug!(
                transaction_id = ?ctx.transaction_id,
                status = %terminal,
                flushed = flushed,
                "Transaction finished"
            ),
            Err(e) => error!(
                transaction_id = ?ctx.transaction_id,
                status = %terminal,
                error = %e,
                "Transaction failed to finish cleanly"
            ),
        }

        self.return_if_idle(ctx).await;
        result
    }

    /// Forget all state of this context.
    ///
    /// Meant for tests. Any lease goes back to the pool and an in-flight
    /// transaction is abandoned without commit or rollback bookkeeping.
    pub async fn reset(&self, ctx: &mut TransactionContext<S::Connection>) {
        warn!(
            transaction_id = ?ctx.transaction_id,
            status = %ctx.status,
            has_lease = ctx.lease.is_some(),
            "Resetting transaction context, in-flight state is discarded"
        );
        if let Some(lease) = ctx.lease.take() {
            self.source.give_back(lease.into_connection()).await;
        }
        *ctx = TransactionContext::default();
    }
}

/// A coordinator bound to one execution context.
///
/// This is the surface application code and the schema bootstrapper use.
/// `read_only` requests run in autocommit mode, read-write requests do not.
pub struct Session<S: ConnectionSource> {
    coordinator: Arc<TransactionCoordinator<S>>,
    ctx: TransactionContext<S::Connection>,
}

impl<S: ConnectionSource> Session<S> {
    pub fn new(coordinator: Arc<TransactionCoordinator<S>>) -> Self {
        Self {
            coordinator,
            ctx: TransactionContext::new(),
        }
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator<S>> {
        &self.coordinator
    }

    pub fn context(&self) -> &TransactionContext<S::Connection> {
        &self.ctx
    }

    /// Connection to the default data source.
    pub async fn acquire(
        &mut self,
        read_only: bool,
    ) -> DbResult<&mut ConnectionLease<S::Connection>> {
        self.coordinator
            .request_connection(&mut self.ctx, read_only, None, None)
            .await
    }

    pub async fn acquire_from(
        &mut self,
        read_only: bool,
        data_source: &str,
    ) -> DbResult<&mut ConnectionLease<S::Connection>> {
        self.coordinator
            .request_connection(&mut self.ctx, read_only, Some(data_source), None)
            .await
    }

    pub async fn acquire_as(
        &mut self,
        read_only: bool,
        data_source: &str,
        user: &str,
        password: &str,
    ) -> DbResult<&mut ConnectionLease<S::Connection>> {
        self.coordinator
            .request_connection(
                &mut self.ctx,
                read_only,
                Some(data_source),
                Some(Credentials::new(user, password)),
            )
            .await
    }

    pub async fn release(&mut self, lease_id: &str) -> DbResult<()> {
        self.coordinator
            .return_connection(&mut self.ctx, lease_id)
            .await
    }

    /// The issued lease, for further work between acquire and release.
    pub fn connection(&mut self, lease_id: &str) -> DbResult<&mut ConnectionLease<S::Connection>> {
        self.ctx.lease_mut(lease_id)
    }

    pub async fn begin(&mut self) -> DbResult<()> {
        self.coordinator.begin(&mut self.ctx).await
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.coordinator.commit(&mut self.ctx).await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.coordinator.rollback(&mut self.ctx).await
    }

    pub fn set_rollback_only(&mut self) -> DbResult<()> {
        self.coordinator.set_rollback_only(&mut self.ctx)
    }

    pub fn status(&self) -> TransactionStatus {
        self.ctx.status()
    }

    pub fn transaction_info(&self) -> Option<TransactionInfo> {
        self.coordinator.transaction_info(&self.ctx)
    }

    /// See [`TransactionCoordinator::reset`].
    pub async fn reset(&mut self) {
        self.coordinator.reset(&mut self.ctx).await
    }
}

impl<S: ConnectionSource> Drop for Session<S> {
    fn drop(&mut self) {
        if self.ctx.status.is_in_progress() {
            warn!(
                transaction_id = ?self.ctx.transaction_id,
                "Session dropped with a transaction in progress, it is abandoned"
            );
        }
        let Some(lease) = self.ctx.lease.take() else {
            return;
        };

        warn!(
            lease_id = %lease.id(),
            checkouts = lease.active_checkout_count(),
            "Session dropped while holding a connection - release it explicitly"
        );
        let connection = lease.into_connection();
        let source = Arc::clone(&self.coordinator.source);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    source.give_back(connection).await;
                });
            }
            Err(_) => drop(connection),
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
