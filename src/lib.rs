//! dbkeeper
//!
//! A bounded, self-healing connection pool over SQLite, PostgreSQL and MySQL, and a versioned
//! schema migrator built on top of it.
//!
//! ```ignore
//! let db = Database::connect("sqlite:app.db", PoolOptions::default())?;
//! let set = MigrationSet::from_dir("migrations")?;
//! SchemaMigrator::new().migrate(&db, &set).await?;
//!
//! let names: Vec<String> = db
//!     .with_async(|ctx| Box::pin(async move { ctx.query_column("SELECT name FROM users", &[]).await }))
//!     .await?;
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;

pub use config::{Config, PoolOptions};
pub use db::{ConnectionContext, Database, PooledContext, SyncContext};
pub use error::{DbError, DbResult};
pub use migrate::{MigrationSet, SchemaMigrator};
