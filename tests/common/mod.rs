//! In-memory connection source for coordinator and bootstrap tests.
//!
//! Every physical interaction is appended to a shared [`Journal`] so tests can
//! assert exactly which borrows, commits, rollbacks and returns happened. The
//! "database" understands just enough SQL to host the schema bookkeeping
//! table; writes made with autocommit off are staged per connection and only
//! become visible to others on commit.

#![allow(dead_code)]

use async_trait::async_trait;
use db_lease::config::TransactionOptions;
use db_lease::db::{ConnectionSource, PhysicalConnection, Session, TransactionCoordinator};
use db_lease::error::{DbError, DbResult};
use db_lease::models::{ConnectionIdentity, Credentials, DatabaseType, QueryParam, Row};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Borrow { conn: u32, identity: String },
    GiveBack { conn: u32 },
    SetAutoCommit { conn: u32, value: bool },
    Commit { conn: u32 },
    Rollback { conn: u32 },
    Execute { conn: u32, sql: String },
}

#[derive(Debug, Default)]
pub struct Journal {
    events: Mutex<Vec<Event>>,
}

impl Journal {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, Event::Commit { .. }))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, Event::Rollback { .. }))
    }

    pub fn borrows(&self) -> usize {
        self.count(|e| matches!(e, Event::Borrow { .. }))
    }

    pub fn returns(&self) -> usize {
        self.count(|e| matches!(e, Event::GiveBack { .. }))
    }

    /// Position of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }
}

/// Committed contents of the fake database.
#[derive(Debug, Clone, Default)]
pub struct DbState {
    pub tables: BTreeSet<String>,
    /// Bookkeeping rows: schema name to version.
    pub schema_rows: BTreeMap<String, i32>,
}

#[derive(Debug, Default)]
pub struct Faults {
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    /// Any statement containing this text fails.
    pub fail_sql: Mutex<Option<String>>,
}

pub struct MockSource {
    pub journal: Arc<Journal>,
    pub state: Arc<Mutex<DbState>>,
    pub faults: Arc<Faults>,
    data_sources: Vec<String>,
    next_id: AtomicU32,
}

impl MockSource {
    /// Source with data sources `main` (default) and `other`.
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Journal::default()),
            state: Arc::new(Mutex::new(DbState::default())),
            faults: Arc::new(Faults::default()),
            data_sources: vec!["main".to_string(), "other".to_string()],
            next_id: AtomicU32::new(1),
        }
    }

    /// Pretend an earlier bootstrap already ran.
    pub fn seed(&self, table: &str, rows: &[(&str, i32)]) {
        let mut state = self.state.lock().unwrap();
        state.tables.insert(table.to_string());
        for (name, version) in rows {
            state.schema_rows.insert(name.to_string(), *version);
        }
    }

    pub fn schema_version(&self, name: &str) -> Option<i32> {
        self.state.lock().unwrap().schema_rows.get(name).copied()
    }

    pub fn fail_sql_containing(&self, text: &str) {
        *self.faults.fail_sql.lock().unwrap() = Some(text.to_string());
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionSource for MockSource {
    type Connection = MockConnection;

    async fn resolve_identity(
        &self,
        data_source: Option<&str>,
        credentials: Option<Credentials>,
    ) -> DbResult<ConnectionIdentity> {
        let id = data_source.unwrap_or("main");
        if !self.data_sources.iter().any(|ds| ds == id) {
            return Err(DbError::data_source_not_found(id));
        }
        Ok(ConnectionIdentity::new(id).with_credentials(credentials))
    }

    async fn borrow(&self, identity: &ConnectionIdentity) -> DbResult<MockConnection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.journal.push(Event::Borrow {
            conn: id,
            identity: identity.to_string(),
        });
        Ok(MockConnection {
            id,
            auto_commit: true,
            staged: None,
            state: Arc::clone(&self.state),
            journal: Arc::clone(&self.journal),
            faults: Arc::clone(&self.faults),
        })
    }

    async fn give_back(&self, connection: MockConnection) {
        self.journal.push(Event::GiveBack {
            conn: connection.id,
        });
    }
}

pub struct MockConnection {
    pub id: u32,
    auto_commit: bool,
    /// Private copy of the state while a manual-commit unit of work is open.
    staged: Option<DbState>,
    state: Arc<Mutex<DbState>>,
    journal: Arc<Journal>,
    faults: Arc<Faults>,
}

impl MockConnection {
    fn visible(&self) -> DbState {
        match &self.staged {
            Some(staged) => staged.clone(),
            None => self.state.lock().unwrap().clone(),
        }
    }

    fn write(&mut self, change: impl FnOnce(&mut DbState) -> DbResult<u64>) -> DbResult<u64> {
        if self.auto_commit {
            let mut state = self.state.lock().unwrap();
            return change(&mut state);
        }
        let state = Arc::clone(&self.state);
        let staged = self
            .staged
            .get_or_insert_with(|| state.lock().unwrap().clone());
        change(staged)
    }

    fn check_fault(&self, sql: &str) -> DbResult<()> {
        let fail = self.faults.fail_sql.lock().unwrap().clone();
        match fail {
            Some(text) if sql.contains(&text) => Err(DbError::database(
                format!("injected failure for: {}", sql),
                Some("XX000".to_string()),
                "",
            )),
            _ => Ok(()),
        }
    }
}

fn table_after<'a>(sql: &'a str, keyword: &str) -> &'a str {
    sql[keyword.len()..]
        .split_whitespace()
        .next()
        .unwrap_or_default()
}

fn string_param(params: &[QueryParam], index: usize) -> String {
    match &params[index] {
        QueryParam::String(s) => s.clone(),
        other => panic!("expected string parameter, got {:?}", other),
    }
}

fn int_param(params: &[QueryParam], index: usize) -> i32 {
    match &params[index] {
        QueryParam::Int(v) => *v as i32,
        other => panic!("expected int parameter, got {:?}", other),
    }
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        self.journal.push(Event::SetAutoCommit {
            conn: self.id,
            value: auto_commit,
        });
        if auto_commit && !self.auto_commit {
            if let Some(staged) = self.staged.take() {
                *self.state.lock().unwrap() = staged;
            }
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.journal.push(Event::Commit { conn: self.id });
        if self.faults.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::connection("injected commit failure", ""));
        }
        if let Some(staged) = self.staged.take() {
            *self.state.lock().unwrap() = staged;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.journal.push(Event::Rollback { conn: self.id });
        self.staged = None;
        if self.faults.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::connection("injected rollback failure", ""));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.journal.push(Event::Execute {
            conn: self.id,
            sql: sql.to_string(),
        });
        self.check_fault(sql)?;

        if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let table = table_after(rest, "");
            return self.write(|s| {
                s.tables.insert(table.to_string());
                Ok(0)
            });
        }
        if sql.starts_with("CREATE TABLE ") {
            let table = table_after(sql, "CREATE TABLE ").trim_end_matches('(');
            return self.write(|s| {
                if !s.tables.insert(table.to_string()) {
                    return Err(DbError::database(
                        format!("table {} already exists", table),
                        Some("42P07".to_string()),
                        "",
                    ));
                }
                Ok(0)
            });
        }
        if sql.starts_with("INSERT INTO ") && sql.contains("SCHEMA_NAME") {
            let name = string_param(params, 0);
            let version = int_param(params, 1);
            return self.write(|s| {
                if s.schema_rows.contains_key(&name) {
                    return Err(DbError::database(
                        format!("duplicate key value for {}", name),
                        Some("23505".to_string()),
                        "",
                    ));
                }
                s.schema_rows.insert(name, version);
                Ok(1)
            });
        }
        if sql.starts_with("UPDATE ") && sql.contains("SCHEMA_VERSION <") {
            let version = int_param(params, 0);
            let name = string_param(params, 1);
            let guard = int_param(params, 2);
            return self.write(|s| match s.schema_rows.get_mut(&name) {
                Some(current) if *current < guard => {
                    *current = version;
                    Ok(1)
                }
                _ => Ok(0),
            });
        }
        Ok(0)
    }

    async fn fetch_all(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.journal.push(Event::Execute {
            conn: self.id,
            sql: sql.to_string(),
        });
        self.check_fault(sql)?;

        let state = self.visible();
        if let Some(idx) = sql.find(" FROM ") {
            let table = table_after(&sql[idx..], " FROM ");
            if sql.contains("SCHEMA_NAME") {
                if !state.tables.contains(table) {
                    return Err(DbError::database(
                        format!("no such table: {}", table),
                        Some("42P01".to_string()),
                        "",
                    ));
                }
                return Ok(state
                    .schema_rows
                    .iter()
                    .map(|(name, version)| {
                        let mut row = Row::new();
                        // Lower case, the way PostgreSQL reports unquoted names
                        row.insert("schema_name".to_string(), JsonValue::from(name.clone()));
                        row.insert("schema_version".to_string(), JsonValue::from(*version));
                        row
                    })
                    .collect());
            }
        }
        Ok(Vec::new())
    }
}

pub type MockCoordinator = TransactionCoordinator<MockSource>;

pub fn coordinator() -> (Arc<MockCoordinator>, Arc<MockSource>) {
    coordinator_with(TransactionOptions::default())
}

pub fn coordinator_with(options: TransactionOptions) -> (Arc<MockCoordinator>, Arc<MockSource>) {
    let source = Arc::new(MockSource::new());
    let coordinator = Arc::new(TransactionCoordinator::new(Arc::clone(&source), options));
    (coordinator, source)
}

pub fn session(coordinator: &Arc<MockCoordinator>) -> Session<MockSource> {
    coordinator.session()
}
