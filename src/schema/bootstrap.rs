//! Create-or-upgrade of registered schema units at startup.
//!
//! A pass has two phases. [`SchemaRegistry::plan`] reads the bookkeeping
//! table and decides per unit whether it must be created, upgraded or left
//! alone; a persisted version newer than the code fails the whole pass before
//! anything runs. [`SchemaRegistry::execute`] then applies the actions in
//! registration order, one committed transaction per unit, and stops at the
//! first failure.

use crate::db::{ConnectionSource, Session};
use crate::error::{DbError, DbResult};
use crate::schema::bookkeeping::{BookkeepingSchema, BookkeepingStatements};
use crate::schema::unit::{SchemaRecord, SchemaUnit};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What a pass does to one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SchemaAction {
    Create,
    Upgrade { from_version: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    pub schema: String,
    pub version: i32,
    pub action: SchemaAction,
}

/// Outcome of the LOAD_EXISTING phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapPlan {
    /// Records found in the bookkeeping table; empty if it could not be read.
    pub existing: Vec<SchemaRecord>,
    /// Units needing work, bookkeeping schema first.
    pub actions: Vec<PlannedAction>,
    /// Units already at their code version.
    pub unchanged: Vec<String>,
}

impl BootstrapPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    pub created: Vec<String>,
    pub upgraded: Vec<String>,
    pub unchanged: Vec<String>,
    pub elapsed_ms: u64,
}

/// Ordered set of schema units, the bookkeeping schema always first.
pub struct SchemaRegistry {
    bookkeeping: Arc<BookkeepingSchema>,
    units: Vec<Arc<dyn SchemaUnit>>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("table", &self.bookkeeping.table())
            .field("units", &self.names())
            .finish()
    }
}

impl SchemaRegistry {
    /// Registry whose bookkeeping table is `<prefix>SCHEMA`.
    pub fn new(prefix: &str) -> Self {
        let bookkeeping = Arc::new(BookkeepingSchema::new(prefix));
        Self {
            units: vec![bookkeeping.clone() as Arc<dyn SchemaUnit>],
            bookkeeping,
        }
    }

    pub fn bookkeeping_table(&self) -> &str {
        self.bookkeeping.table()
    }

    /// Unit names in creation order.
    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn SchemaUnit>> {
        self.units.iter().find(|u| u.name() == name)
    }

    /// Register a unit, its dependencies first.
    ///
    /// Names already registered are skipped, so shared dependencies are
    /// registered once. A dependency cycle is rejected and leaves the
    /// registry unchanged.
    pub fn register(&mut self, unit: Arc<dyn SchemaUnit>) -> DbResult<()> {
        let mut pending = Vec::new();
        let mut path = Vec::new();
        self.collect(unit, &mut pending, &mut path)?;
        for unit in &pending {
            debug!(schema = %unit.name(), version = unit.version(), "Registered schema unit");
        }
        self.units.extend(pending);
        Ok(())
    }

    fn collect(
        &self,
        unit: Arc<dyn SchemaUnit>,
        pending: &mut Vec<Arc<dyn SchemaUnit>>,
        path: &mut Vec<String>,
    ) -> DbResult<()> {
        let name = unit.name().to_string();
        if self.get(&name).is_some() || pending.iter().any(|u| u.name() == name) {
            return Ok(());
        }
        if path.contains(&name) {
            path.push(name);
            return Err(DbError::invalid_input(format!(
                "Schema dependency cycle: {}",
                path.join(" -> ")
            )));
        }

        path.push(name);
        for dependency in unit.dependencies() {
            self.collect(dependency, pending, path)?;
        }
        path.pop();
        pending.push(unit);
        Ok(())
    }

    /// Decide what each unit needs.
    ///
    /// An unreadable bookkeeping table means nothing exists yet.
    pub async fn plan<S: ConnectionSource>(&self, session: &mut Session<S>) -> DbResult<BootstrapPlan> {
        let lease_id = session.acquire(true).await?.id().to_string();
        let statements = BookkeepingStatements::new(
            self.bookkeeping.table(),
            session.connection(&lease_id)?.database_type(),
        );
        let loaded = statements.load(session.connection(&lease_id)?).await;
        session.release(&lease_id).await?;

        let existing = match loaded {
            Ok(records) => records,
            Err(e) => {
                info!(
                    table = %self.bookkeeping.table(),
                    reason = %e,
                    "Schema bookkeeping table not readable, every schema will be created"
                );
                Vec::new()
            }
        };
        let persisted: HashMap<&str, i32> = existing
            .iter()
            .map(|r| (r.name.as_str(), r.version))
            .collect();

        let mut plan = BootstrapPlan::default();
        for unit in &self.units {
            let (name, version) = (unit.name(), unit.version());
            let action = match persisted.get(name) {
                None => SchemaAction::Create,
                Some(&found) if found < version => SchemaAction::Upgrade {
                    from_version: found,
                },
                Some(&found) if found > version => {
                    error!(
                        schema = %name,
                        persisted_version = found,
                        code_version = version,
                        "Persisted schema is newer than the code"
                    );
                    return Err(DbError::schema_downgrade(name, found, version));
                }
                Some(_) => {
                    plan.unchanged.push(name.to_string());
                    continue;
                }
            };
            plan.actions.push(PlannedAction {
                schema: name.to_string(),
                version,
                action,
            });
        }
        plan.existing = existing;

        debug!(
            actions = plan.actions.len(),
            unchanged = plan.unchanged.len(),
            "Schema bootstrap planned"
        );
        Ok(plan)
    }

    /// Apply a plan, one transaction per unit.
    pub async fn execute<S: ConnectionSource>(
        &self,
        session: &mut Session<S>,
        plan: &BootstrapPlan,
        user: Option<&str>,
    ) -> DbResult<BootstrapReport> {
        let started = Instant::now();
        let mut report = BootstrapReport {
            unchanged: plan.unchanged.clone(),
            ..Default::default()
        };
        let mut statements = None;

        for planned in &plan.actions {
            let unit = self.get(&planned.schema).ok_or_else(|| {
                DbError::invalid_input(format!("Schema '{}' is not registered", planned.schema))
            })?;

            session.begin().await?;
            let applied = self
                .apply(session, unit.as_ref(), planned, user, &mut statements)
                .await;
            match applied {
                Ok(()) => session.commit().await?,
                Err(e) => {
                    if let Err(rollback_err) = session.rollback().await {
                        error!(
                            schema = %planned.schema,
                            error = %rollback_err,
                            "Rollback after failed schema change also failed"
                        );
                    }
                    error!(schema = %planned.schema, error = %e, "Schema bootstrap halted");
                    return Err(e);
                }
            }

            match planned.action {
                SchemaAction::Create => {
                    info!(schema = %planned.schema, version = planned.version, "Created schema");
                    report.created.push(planned.schema.clone());
                }
                SchemaAction::Upgrade { from_version } => {
                    info!(
                        schema = %planned.schema,
                        from_version,
                        version = planned.version,
                        "Upgraded schema"
                    );
                    report.upgraded.push(planned.schema.clone());
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Run one unit's change plus its bookkeeping write on a single lease.
    async fn apply<S: ConnectionSource>(
        &self,
        session: &mut Session<S>,
        unit: &dyn SchemaUnit,
        planned: &PlannedAction,
        user: Option<&str>,
        statements: &mut Option<BookkeepingStatements>,
    ) -> DbResult<()> {
        let lease = session.acquire(false).await?;
        let lease_id = lease.id().to_string();
        let statements = statements.get_or_insert_with(|| {
            BookkeepingStatements::new(self.bookkeeping.table(), lease.database_type())
        });

        let conn = session.connection(&lease_id)?;
        let result = match planned.action {
            SchemaAction::Create => match unit.create(conn, user).await {
                Ok(()) => statements.insert(conn, unit.name(), unit.version()).await,
                Err(e) => Err(e),
            },
            SchemaAction::Upgrade { from_version } => {
                match unit.upgrade(conn, user, from_version).await {
                    Ok(()) => statements.update(conn, unit.name(), unit.version()).await,
                    Err(e) => Err(e),
                }
            }
        };

        // Released inside the transaction: the lease goes back at commit
        if let Err(e) = session.release(&lease_id).await {
            warn!(lease_id = %lease_id, error = %e, "Could not release schema connection");
            return result.and(Err(e));
        }
        result
    }

    /// Plan and execute in one go.
    pub async fn init<S: ConnectionSource>(
        &self,
        session: &mut Session<S>,
        user: Option<&str>,
    ) -> DbResult<BootstrapReport> {
        let plan = self.plan(session).await?;
        if plan.is_empty() {
            info!(schemas = plan.unchanged.len(), "All schemas up to date");
        }
        self.execute(session, &plan, user).await
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SCHEMA_PREFIX)
    }
}
