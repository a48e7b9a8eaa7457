//! Blocking view of a [`ConnectionContext`] for `with_sync` callers.

use crate::db::context::ConnectionContext;
use crate::db::row::{FromRow, Row, RowSet};
use crate::db::types::{FromSql, SqlValue};
use crate::error::DbResult;
use crate::models::DatabaseType;
use tokio::runtime::Handle;
use tracing::warn;
use uuid::Uuid;

/// Runs every [`ConnectionContext`] operation to completion on the pool's runtime.
pub struct SyncContext<'a> {
    ctx: &'a mut ConnectionContext,
    runtime: &'a Handle,
}

impl<'a> SyncContext<'a> {
    pub(crate) fn new(ctx: &'a mut ConnectionContext, runtime: &'a Handle) -> Self {
        Self { ctx, runtime }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id()
    }

    pub fn database_type(&self) -> DatabaseType {
        self.ctx.database_type()
    }

    pub fn nesting_depth(&self) -> u32 {
        self.ctx.nesting_depth()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.ctx.is_in_transaction()
    }

    pub fn cached_statement_counts(&self) -> (usize, usize) {
        self.ctx.cached_statement_counts()
    }

    pub fn execute_query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<RowSet> {
        self.runtime.block_on(self.ctx.execute_query(sql, params))
    }

    pub fn execute_update(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.runtime.block_on(self.ctx.execute_update(sql, params))
    }

    pub fn update_query_row(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        self.runtime.block_on(self.ctx.update_query_row(sql, params))
    }

    pub fn query_row(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        self.runtime.block_on(self.ctx.query_row(sql, params))
    }

    pub fn query_one<T: FromRow>(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<T>> {
        self.runtime.block_on(self.ctx.query_one(sql, params))
    }

    pub fn query_all<T: FromRow>(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<T>> {
        self.runtime.block_on(self.ctx.query_all(sql, params))
    }

    pub fn query_column<T: FromSql>(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<T>> {
        self.runtime.block_on(self.ctx.query_column(sql, params))
    }

    pub fn query_each<F>(&mut self, sql: &str, params: &[SqlValue], f: F) -> DbResult<u64>
    where
        F: FnMut(Row) -> DbResult<()> + Send,
    {
        self.runtime.block_on(self.ctx.query_each(sql, params, f))
    }

    pub fn execute_all(&mut self, script: &str) -> DbResult<usize> {
        self.runtime.block_on(self.ctx.execute_all(script))
    }

    pub fn begin_savepoint(&mut self) -> DbResult<()> {
        self.runtime.block_on(self.ctx.begin_savepoint())
    }

    pub fn release_savepoint(&mut self) -> DbResult<()> {
        self.runtime.block_on(self.ctx.release_savepoint())
    }

    pub fn rollback_savepoint(&mut self) -> DbResult<()> {
        self.runtime.block_on(self.ctx.rollback_savepoint())
    }

    /// Run `f` inside a savepoint; see [`ConnectionContext::with_savepoint`].
    pub fn with_savepoint<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut SyncContext<'_>) -> DbResult<T>,
    {
        self.begin_savepoint()?;
        let depth = self.ctx.nesting_depth();
        let result = f(self);
        self.runtime.block_on(self.ctx.unwind_to(depth));
        match result {
            Ok(value) => {
                self.release_savepoint()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_savepoint() {
                    warn!(context = %self.id(), error = %rollback_err, "Rollback after error failed");
                }
                Err(e)
            }
        }
    }

    pub fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut SyncContext<'_>) -> DbResult<T>,
    {
        self.with_savepoint(f)
    }
}

impl std::fmt::Debug for SyncContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext").field("ctx", &self.ctx).finish()
    }
}
