//! Versioned schema migrations.
//!
//! - [`Migration`]: one named SQL script with its content hash
//! - [`MigrationSet`]: the migrations known to the application, with ordering and integrity rules
//! - [`SchemaDialect`]: per-backend SQL for the history table
//! - [`SchemaMigrator`]: applies a set to a [`Database`](crate::db::Database)

pub mod dialect;
pub mod migration;
pub mod migrator;
pub mod set;

pub use dialect::{MIGRATIONS_TABLE, SchemaDialect};
pub use migration::{Migration, hash_sql};
pub use migrator::{
    DefaultHooks, MigrationHandler, MigrationHooks, MigrationPhase, MigratorOptions, SchemaMigrator,
};
pub use set::MigrationSet;
