//! Versioned schema bootstrap.
//!
//! Applications describe their database objects as [`SchemaUnit`]s, register
//! them in a [`SchemaRegistry`] and call [`SchemaRegistry::init`] at startup.
//! Installed versions are tracked in a bookkeeping table owned by
//! [`BookkeepingSchema`].

pub mod bookkeeping;
pub mod bootstrap;
pub mod unit;

pub use bookkeeping::{BOOKKEEPING_SCHEMA_NAME, BOOKKEEPING_SCHEMA_VERSION, BookkeepingSchema};
pub use bootstrap::{BootstrapPlan, BootstrapReport, PlannedAction, SchemaAction, SchemaRegistry};
pub use unit::{SchemaRecord, SchemaUnit};
