//! The bookkeeping table that records which schema version is installed.
//!
//! Columns: `SCHEMA_NAME` (unique), `SCHEMA_VERSION`, `CREATION_DATE`,
//! `MODIFICATION_DATE`. Timestamps always come from the database server.

use crate::db::SqlExecutor;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, column};
use crate::schema::unit::{SchemaRecord, SchemaUnit};
use async_trait::async_trait;
use tracing::{debug, info};

pub const BOOKKEEPING_SCHEMA_NAME: &str = "SCHEMA";
pub const BOOKKEEPING_SCHEMA_VERSION: i32 = 1;

/// Schema unit owning the bookkeeping table itself.
#[derive(Debug, Clone)]
pub struct BookkeepingSchema {
    table: String,
}

impl BookkeepingSchema {
    pub fn new(prefix: &str) -> Self {
        Self {
            table: format!("{}{}", prefix, BOOKKEEPING_SCHEMA_NAME),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl SchemaUnit for BookkeepingSchema {
    fn name(&self) -> &str {
        BOOKKEEPING_SCHEMA_NAME
    }

    fn version(&self) -> i32 {
        BOOKKEEPING_SCHEMA_VERSION
    }

    async fn create(&self, conn: &mut dyn SqlExecutor, _user: Option<&str>) -> DbResult<()> {
        let sql = format!(
            "CREATE TABLE {} (\
             SCHEMA_NAME VARCHAR(128) NOT NULL PRIMARY KEY, \
             SCHEMA_VERSION INTEGER NOT NULL, \
             CREATION_DATE TIMESTAMP NOT NULL, \
             MODIFICATION_DATE TIMESTAMP NOT NULL)",
            self.table
        );
        conn.execute(&sql, &[]).await?;
        info!(table = %self.table, "Created schema bookkeeping table");
        Ok(())
    }

    async fn upgrade(
        &self,
        _conn: &mut dyn SqlExecutor,
        _user: Option<&str>,
        from_version: i32,
    ) -> DbResult<()> {
        // Only one layout exists so far
        debug!(table = %self.table, from_version, "Bookkeeping table needs no changes");
        Ok(())
    }
}

/// SQL text for one bootstrap pass, built once for the backend's placeholder
/// style and reused for every unit.
#[derive(Debug, Clone)]
pub(crate) struct BookkeepingStatements {
    select: String,
    insert: String,
    update: String,
}

impl BookkeepingStatements {
    pub(crate) fn new(table: &str, db_type: DatabaseType) -> Self {
        let p = |i| db_type.placeholder(i);
        Self {
            select: format!("SELECT SCHEMA_NAME, SCHEMA_VERSION FROM {}", table),
            insert: format!(
                "INSERT INTO {} (SCHEMA_NAME, SCHEMA_VERSION, CREATION_DATE, MODIFICATION_DATE) \
                 VALUES ({}, {}, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)",
                table,
                p(1),
                p(2)
            ),
            update: format!(
                "UPDATE {} SET SCHEMA_VERSION = {}, MODIFICATION_DATE = CURRENT_TIMESTAMP \
                 WHERE SCHEMA_NAME = {} AND SCHEMA_VERSION < {}",
                table,
                p(1),
                p(2),
                p(3)
            ),
        }
    }

    /// Every record in the table.
    pub(crate) async fn load(&self, conn: &mut dyn SqlExecutor) -> DbResult<Vec<SchemaRecord>> {
        let rows = conn.fetch_all(&self.select, &[]).await?;
        rows.iter()
            .map(|row| {
                let name = column(row, "SCHEMA_NAME")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| DbError::internal("Bookkeeping row without SCHEMA_NAME"))?;
                let version = column(row, "SCHEMA_VERSION")
                    .and_then(|v| v.as_i64())
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| {
                        DbError::internal(format!(
                            "Bookkeeping row for '{}' has no valid SCHEMA_VERSION",
                            name
                        ))
                    })?;
                Ok(SchemaRecord {
                    name: name.to_string(),
                    version,
                })
            })
            .collect()
    }

    pub(crate) async fn insert(
        &self,
        conn: &mut dyn SqlExecutor,
        name: &str,
        version: i32,
    ) -> DbResult<()> {
        let params = [QueryParam::from(name), QueryParam::from(version)];
        let affected = conn
            .execute(&self.insert, &params)
            .await
            .map_err(|e| e.classify_write(true, &format!("Schema record '{}'", name)))?;
        if affected == 0 {
            return Err(DbError::inconsistent_data(
                format!("Schema record '{}' was not created", name),
                affected,
            ));
        }
        Ok(())
    }

    /// Raise the recorded version, unless someone already did.
    pub(crate) async fn update(
        &self,
        conn: &mut dyn SqlExecutor,
        name: &str,
        version: i32,
    ) -> DbResult<()> {
        let params = [
            QueryParam::from(version),
            QueryParam::from(name),
            QueryParam::from(version),
        ];
        let affected = conn.execute(&self.update, &params).await?;
        match affected {
            0 => Err(DbError::not_found(format!(
                "No record updated for schema '{}' to version {}",
                name, version
            ))),
            1 => Ok(()),
            n => Err(DbError::inconsistent_data(
                format!("Schema '{}' has more than one bookkeeping record", name),
                n,
            )),
        }
    }
}
