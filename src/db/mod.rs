//! Database access layer.
//!
//! This module provides:
//! - Connection factories over the sqlx Any driver
//! - Connection contexts with statement caches and nested savepoints
//! - The bounded connection pool and its background reclaimer
//! - A blocking adapter for synchronous callers
//! - The value model, row decoding and parameter binding
//! - Multi-statement script splitting

pub mod codec;
pub mod context;
pub mod factory;
#[macro_use]
pub mod macros;
mod params;
pub mod pool;
mod reclaimer;
pub mod row;
pub mod script;
mod slots;
mod statement_cache;
pub mod sync;
pub mod types;

pub use codec::{RowCodec, TypeConverter};
pub use context::ConnectionContext;
pub use factory::{ConnectionFactory, UrlConnectionFactory};
pub use pool::{Database, DatabaseBuilder, PooledContext};
pub use row::{ColumnInfo, FromRow, Row, RowIndex, RowSet};
pub use sync::SyncContext;
pub use types::{FromSql, SqlValue, TypeCategory, categorize_type};
