//! Data models for dbkeeper.
//!
//! This module re-exports the serializable types shared by the pool, the migrator
//! and the command line tool.

pub mod connection;
pub mod migration;
pub mod pool;

pub use connection::DatabaseType;
pub use migration::{AppliedMigration, MigrationReport, PerformedMigration};
pub use pool::PoolStats;
