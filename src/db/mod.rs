//! Database access layer.
//!
//! This module provides:
//! - The physical connection and connection source seams
//! - Connection leases and the per-context transaction coordinator
//! - The sqlx-backed connection pool adapter
//! - Parameter binding, row decoding and backend dispatch macros

#[macro_use]
pub mod macros;
pub mod lease;
pub mod params;
pub mod physical;
pub mod pool;
pub mod transaction;
pub mod types;

pub use lease::{BatchResult, ConnectionLease, SqlExecutor};
pub use physical::{ConnectionSource, PhysicalConnection};
pub use pool::{ConnectionManager, DbPool, SqlConnection};
pub use transaction::{
    Session, TransactionContext, TransactionCoordinator, TransactionInfo, TransactionStatus,
};
