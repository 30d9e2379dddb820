//! The contract a versioned schema unit fulfils.

use crate::db::SqlExecutor;
use crate::error::DbResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// A named, versioned group of database objects.
///
/// `create` builds the objects from scratch at [`version`](Self::version);
/// `upgrade` brings objects created by an older version up to date. Both run
/// inside a transaction the bootstrapper opens and commits.
#[async_trait]
pub trait SchemaUnit: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> i32;

    /// Units that must exist before this one. Registered ahead of it.
    fn dependencies(&self) -> Vec<Arc<dyn SchemaUnit>> {
        Vec::new()
    }

    async fn create(&self, conn: &mut dyn SqlExecutor, user: Option<&str>) -> DbResult<()>;

    async fn upgrade(
        &self,
        conn: &mut dyn SqlExecutor,
        user: Option<&str>,
        from_version: i32,
    ) -> DbResult<()>;
}

impl std::fmt::Debug for dyn SchemaUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaUnit")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

/// One row of the bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaRecord {
    pub name: String,
    pub version: i32,
}
