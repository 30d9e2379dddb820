//! Integration tests for the versioned schema bootstrapper.

mod common;

use async_trait::async_trait;
use common::{Event, coordinator, session};
use db_lease::db::{SqlExecutor, TransactionStatus};
use db_lease::error::{DbError, DbResult, ErrorKind};
use db_lease::schema::{SchemaAction, SchemaRegistry, SchemaUnit};
use std::sync::{Arc, Mutex};

type CallLog = Arc<Mutex<Vec<String>>>;

/// Schema unit that records every callback it receives.
struct TableUnit {
    name: &'static str,
    version: i32,
    deps: Vec<Arc<dyn SchemaUnit>>,
    calls: CallLog,
}

impl TableUnit {
    fn new(name: &'static str, version: i32, calls: &CallLog) -> Arc<Self> {
        Self::with_deps(name, version, Vec::new(), calls)
    }

    fn with_deps(
        name: &'static str,
        version: i32,
        deps: Vec<Arc<dyn SchemaUnit>>,
        calls: &CallLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            version,
            deps,
            calls: Arc::clone(calls),
        })
    }
}

#[async_trait]
impl SchemaUnit for TableUnit {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn dependencies(&self) -> Vec<Arc<dyn SchemaUnit>> {
        self.deps.clone()
    }

    async fn create(&self, conn: &mut dyn SqlExecutor, user: Option<&str>) -> DbResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create:{}:{}", self.name, user.unwrap_or("-")));
        conn.execute(&format!("CREATE TABLE IF NOT EXISTS {} (id INTEGER)", self.name), &[])
            .await?;
        Ok(())
    }

    async fn upgrade(
        &self,
        conn: &mut dyn SqlExecutor,
        _user: Option<&str>,
        from_version: i32,
    ) -> DbResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("upgrade:{}:{}", self.name, from_version));
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN v{} INTEGER", self.name, self.version), &[])
            .await?;
        Ok(())
    }
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn test_fresh_database_creates_everything_in_order() {
    let (coordinator, source) = coordinator();
    let log = CallLog::default();
    let users = TableUnit::new("users", 1, &log);
    let orders = TableUnit::with_deps("orders", 2, vec![users as Arc<dyn SchemaUnit>], &log);

    let mut registry = SchemaRegistry::default();
    registry.register(orders).unwrap();
    assert_eq!(registry.names(), vec!["SCHEMA", "users", "orders"]);

    let mut session = session(&coordinator);
    let report = registry.init(&mut session, Some("app")).await.unwrap();

    assert_eq!(report.created, vec!["SCHEMA", "users", "orders"]);
    assert!(report.upgraded.is_empty());
    assert_eq!(calls(&log), vec!["create:users:app", "create:orders:app"]);

    assert_eq!(source.schema_version("SCHEMA"), Some(1));
    assert_eq!(source.schema_version("users"), Some(1));
    assert_eq!(source.schema_version("orders"), Some(2));
    assert!(source.state.lock().unwrap().tables.contains("BF_SCHEMA"));

    // One transaction per unit
    assert_eq!(source.journal.commits(), 3);
    assert_eq!(session.status(), TransactionStatus::Committed);
    assert!(!session.context().has_lease());
    assert_eq!(source.journal.borrows(), source.journal.returns());
}

#[tokio::test]
async fn test_second_run_is_noop() {
    let (coordinator, source) = coordinator();
    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    registry.register(TableUnit::new("users", 1, &log)).unwrap();

    let mut session = session(&coordinator);
    registry.init(&mut session, None).await.unwrap();
    source.journal.clear();
    log.lock().unwrap().clear();

    let report = registry.init(&mut session, None).await.unwrap();
    assert!(report.created.is_empty());
    assert!(report.upgraded.is_empty());
    assert_eq!(report.unchanged, vec!["SCHEMA", "users"]);
    assert!(calls(&log).is_empty());
    assert_eq!(source.journal.commits(), 0);
}

#[tokio::test]
async fn test_upgrade_from_recorded_version() {
    let (coordinator, source) = coordinator();
    source.seed("BF_SCHEMA", &[("SCHEMA", 1), ("users", 1), ("orders", 3)]);

    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    registry.register(TableUnit::new("users", 2, &log)).unwrap();
    registry.register(TableUnit::new("orders", 3, &log)).unwrap();
    registry.register(TableUnit::new("audit", 1, &log)).unwrap();

    let mut session = session(&coordinator);
    let plan = registry.plan(&mut session).await.unwrap();
    let actions: Vec<_> = plan
        .actions
        .iter()
        .map(|a| (a.schema.as_str(), a.action))
        .collect();
    assert_eq!(
        actions,
        vec![
            ("users", SchemaAction::Upgrade { from_version: 1 }),
            ("audit", SchemaAction::Create),
        ]
    );
    assert_eq!(plan.unchanged, vec!["SCHEMA", "orders"]);

    let report = registry.execute(&mut session, &plan, None).await.unwrap();
    assert_eq!(report.upgraded, vec!["users"]);
    assert_eq!(report.created, vec!["audit"]);
    assert_eq!(calls(&log), vec!["upgrade:users:1", "create:audit:-"]);
    assert_eq!(source.schema_version("users"), Some(2));
    assert_eq!(source.schema_version("audit"), Some(1));
}

#[tokio::test]
async fn test_downgrade_detected_before_any_change() {
    let (coordinator, source) = coordinator();
    source.seed("BF_SCHEMA", &[("SCHEMA", 1), ("users", 5)]);

    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    // Would need creating, but the downgrade must stop everything first
    registry.register(TableUnit::new("audit", 1, &log)).unwrap();
    registry.register(TableUnit::new("users", 3, &log)).unwrap();

    let mut session = session(&coordinator);
    let err = registry.init(&mut session, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaDowngrade);
    assert!(matches!(
        err,
        DbError::SchemaDowngrade {
            persisted_version: 5,
            code_version: 3,
            ..
        }
    ));

    assert!(calls(&log).is_empty());
    assert_eq!(source.journal.commits(), 0);
    assert_eq!(source.schema_version("audit"), None);
    assert_eq!(source.schema_version("users"), Some(5));
}

#[tokio::test]
async fn test_concurrent_upgrade_loses_guarded_update() {
    let (coordinator, source) = coordinator();
    source.seed("BF_SCHEMA", &[("SCHEMA", 1), ("users", 1)]);

    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    registry.register(TableUnit::new("users", 2, &log)).unwrap();

    let mut first = session(&coordinator);
    let mut second = session(&coordinator);
    let first_plan = registry.plan(&mut first).await.unwrap();
    let second_plan = registry.plan(&mut second).await.unwrap();

    registry
        .execute(&mut first, &first_plan, None)
        .await
        .unwrap();
    assert_eq!(source.schema_version("users"), Some(2));

    let err = registry
        .execute(&mut second, &second_plan, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("No record updated"));
    assert_eq!(second.status(), TransactionStatus::RolledBack);
    assert_eq!(source.schema_version("users"), Some(2));
}

#[tokio::test]
async fn test_concurrent_create_reports_concurrent_modification() {
    let (coordinator, source) = coordinator();
    source.seed("BF_SCHEMA", &[("SCHEMA", 1)]);

    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    registry.register(TableUnit::new("users", 1, &log)).unwrap();

    let mut first = session(&coordinator);
    let mut second = session(&coordinator);
    let first_plan = registry.plan(&mut first).await.unwrap();
    let second_plan = registry.plan(&mut second).await.unwrap();

    registry
        .execute(&mut first, &first_plan, None)
        .await
        .unwrap();
    let err = registry
        .execute(&mut second, &second_plan, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
}

#[tokio::test]
async fn test_failure_halts_bootstrap() {
    let (coordinator, source) = coordinator();
    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    registry.register(TableUnit::new("users", 1, &log)).unwrap();
    registry.register(TableUnit::new("orders", 1, &log)).unwrap();
    registry.register(TableUnit::new("audit", 1, &log)).unwrap();

    source.fail_sql_containing("EXISTS orders");

    let mut session = session(&coordinator);
    let err = registry.init(&mut session, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DatabaseAccess);

    // Units before the failure stay, the failing one is rolled back, nothing after runs
    assert_eq!(source.schema_version("users"), Some(1));
    assert_eq!(source.schema_version("orders"), None);
    assert_eq!(source.schema_version("audit"), None);
    assert_eq!(calls(&log), vec!["create:users:-", "create:orders:-"]);
    assert_eq!(session.status(), TransactionStatus::RolledBack);
    assert!(!session.context().has_lease());
    assert_eq!(source.journal.borrows(), source.journal.returns());
}

#[tokio::test]
async fn test_bookkeeping_writes_use_guarded_statements() {
    let (coordinator, source) = coordinator();
    source.seed("BF_SCHEMA", &[("SCHEMA", 1), ("users", 1)]);

    let log = CallLog::default();
    let mut registry = SchemaRegistry::default();
    registry.register(TableUnit::new("users", 2, &log)).unwrap();

    let mut session = session(&coordinator);
    registry.init(&mut session, None).await.unwrap();

    let update = source
        .journal
        .events()
        .into_iter()
        .find_map(|e| match e {
            Event::Execute { sql, .. } if sql.starts_with("UPDATE") => Some(sql),
            _ => None,
        })
        .unwrap();
    assert!(update.contains("MODIFICATION_DATE = CURRENT_TIMESTAMP"));
    assert!(update.ends_with("WHERE SCHEMA_NAME = ? AND SCHEMA_VERSION < ?"));
}

#[tokio::test]
async fn test_custom_prefix() {
    let (coordinator, source) = coordinator();
    let registry = SchemaRegistry::new("APP_");
    assert_eq!(registry.bookkeeping_table(), "APP_SCHEMA");

    let mut session = session(&coordinator);
    let report = registry.init(&mut session, None).await.unwrap();
    assert_eq!(report.created, vec!["SCHEMA"]);
    assert!(source.state.lock().unwrap().tables.contains("APP_SCHEMA"));
}
