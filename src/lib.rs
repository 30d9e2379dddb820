//! db-lease library
//!
//! Single-connection-per-context transaction coordination over sqlx pools
//! (SQLite, PostgreSQL, MySQL), plus a versioned schema bootstrapper built on
//! top of it.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;

pub use config::Config;
pub use db::{ConnectionManager, Session, TransactionCoordinator, TransactionStatus};
pub use error::{DbError, DbResult, ErrorKind};
pub use schema::{SchemaRegistry, SchemaUnit};
