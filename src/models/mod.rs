//! Data models for db-lease.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionIdentity, Credentials, DataSourceInfo, DatabaseType};
pub use query::{QueryParam, Row, column};
