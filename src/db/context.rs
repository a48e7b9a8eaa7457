//! One logical database session.
//!
//! A [`ConnectionContext`] owns a write handle and, when the pool has a separate read factory,
//! a read handle. Reads go to the read handle outside transactions. Once a savepoint is open every
//! statement goes to the write handle so it takes part in the transaction.
//!
//! Prepared statements are cached per context and per mode. Inside a transaction, writes are
//! prepared fresh for each call and never cached.

use crate::db::codec::{RowCodec, column_info};
use crate::db::factory::ConnectionFactory;
use crate::db::params::bind_all;
use crate::db::row::{ColumnInfo, FromRow, Row, RowSet};
use crate::db::script::split_statements;
use crate::db::statement_cache::StatementCache;
use crate::db::types::{FromSql, SqlValue};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use futures_util::TryStreamExt;
use futures_util::future::{BoxFuture, FutureExt};
use sqlx::any::{AnyRow, AnyStatement};
use sqlx::{AnyConnection, Connection, Row as _, Statement};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ConnectionContext {
    id: Uuid,
    db_type: DatabaseType,
    writer: Option<AnyConnection>,
    /// Separate read handle; `None` when reads share the write handle.
    reader: Option<AnyConnection>,
    read_cache: StatementCache,
    write_cache: StatementCache,
    codec: Arc<RowCodec>,
    nesting: u32,
    closed: bool,
    /// Set while a driver call is in flight. Still set afterwards means the call was cancelled.
    busy: bool,
    /// A rollback failed; the transaction state of the handle is unknown.
    broken: bool,
}

impl ConnectionContext {
    /// Open a context with a write handle and an optional separate read handle.
    pub async fn open(
        write: &dyn ConnectionFactory,
        read: Option<&dyn ConnectionFactory>,
        codec: Arc<RowCodec>,
    ) -> DbResult<Self> {
        let writer = write.connect().await?;
        let reader = match read {
            Some(factory) => match factory.connect().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    if let Err(close_err) = writer.close().await {
                        debug!(error = %close_err, "Failed to close write handle");
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let ctx = Self {
            id: Uuid::new_v4(),
            db_type: write.database_type(),
            writer: Some(writer),
            reader,
            read_cache: StatementCache::default(),
            write_cache: StatementCache::default(),
            codec,
            nesting: 0,
            closed: false,
            busy: false,
            broken: false,
        };
        debug!(context = %ctx.id, separate_reader = ctx.reader.is_some(), "Opened connection context");
        Ok(ctx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Number of open savepoints (0 outside transactions).
    pub fn nesting_depth(&self) -> u32 {
        self.nesting
    }

    pub fn is_in_transaction(&self) -> bool {
        self.nesting > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of cached (read, write) statements.
    pub fn cached_statement_counts(&self) -> (usize, usize) {
        (self.read_cache.len(), self.write_cache.len())
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            Err(DbError::context_closed(self.id.to_string()))
        } else {
            Ok(())
        }
    }

    /// Pick the handle and cache for a statement.
    fn route(&mut self, write: bool) -> DbResult<(&mut AnyConnection, &mut StatementCache)> {
        let id = self.id;
        let in_transaction = self.nesting > 0;
        let Self {
            writer,
            reader,
            read_cache,
            write_cache,
            ..
        } = self;
        let writer = writer
            .as_mut()
            .ok_or_else(|| DbError::context_closed(id.to_string()))?;

        if write || in_transaction {
            return Ok((writer, write_cache));
        }
        match reader.as_mut() {
            Some(reader) => Ok((reader, read_cache)),
            None => Ok((writer, read_cache)),
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Run a query and materialize its rows.
    ///
    /// Outside a transaction the read handle is used; inside one, the write handle.
    pub async fn execute_query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<RowSet> {
        self.fetch(sql, params, false).await
    }

    /// Run a statement on the write handle and return the number of affected rows.
    ///
    /// Parameterized statements outside a transaction go through the write cache. Statements
    /// without parameters run as raw SQL and are never cached, so DDL and multi-statement text
    /// work on every backend.
    pub async fn execute_update(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.ensure_open()?;
        let params = self.codec.encode_params(params)?;
        let cached = self.nesting == 0 && !params.is_empty();
        debug!(context = %self.id, sql = %sql, params = params.len(), cached, "Executing update");

        self.busy = true;
        let result = match self.route(true) {
            Ok((conn, cache)) => {
                if cached {
                    execute_cached(conn, cache, sql, params).await
                } else if params.is_empty() {
                    // Some DDL cannot be prepared
                    execute_raw(conn, sql).await
                } else {
                    execute_uncached(conn, sql, params).await
                }
            }
            Err(e) => Err(e),
        };
        self.busy = false;

        if let Err(e) = &result {
            warn!(context = %self.id, sql = %sql, error = %e, "Update failed");
        }
        result
    }

    /// Run a write that returns rows (e.g. `INSERT ... RETURNING`) and return the first one.
    pub async fn update_query_row(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Option<Row>> {
        let rows = self.fetch(sql, params, true).await?;
        Ok(rows.into_rows().into_iter().next())
    }

    async fn fetch(&mut self, sql: &str, params: &[SqlValue], write: bool) -> DbResult<RowSet> {
        self.ensure_open()?;
        let params = self.codec.encode_params(params)?;
        let codec = Arc::clone(&self.codec);
        let cached = !(write && self.nesting > 0);
        debug!(context = %self.id, sql = %sql, params = params.len(), write, cached, "Executing query");

        self.busy = true;
        let result = match self.route(write) {
            Ok((conn, cache)) => {
                if cached {
                    fetch_cached(conn, cache, &codec, sql, params).await
                } else {
                    fetch_uncached(conn, &codec, sql, params).await
                }
            }
            Err(e) => Err(e),
        };
        self.busy = false;

        if let Err(e) = &result {
            warn!(context = %self.id, sql = %sql, error = %e, "Query failed");
        }
        result
    }

    /// First row of a query, if any.
    pub async fn query_row(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        let rows = self.execute_query(sql, params).await?;
        Ok(rows.into_rows().into_iter().next())
    }

    /// First row of a query mapped into a record.
    pub async fn query_one<T: FromRow>(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Option<T>> {
        match self.query_row(sql, params).await? {
            Some(row) => T::from_row(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Every row of a query mapped into a record.
    pub async fn query_all<T: FromRow>(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Vec<T>> {
        self.execute_query(sql, params).await?.map()
    }

    /// The first column of every row.
    pub async fn query_column<T: FromSql>(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Vec<T>> {
        let rows = self.execute_query(sql, params).await?;
        rows.iter().map(|row| row.get::<T>(0usize)).collect()
    }

    /// Stream a query's rows through `f` without materializing them.
    ///
    /// The cursor is released whether `f` succeeds, fails, or the call is cancelled. Returns the
    /// number of rows visited.
    pub async fn query_each<F>(&mut self, sql: &str, params: &[SqlValue], mut f: F) -> DbResult<u64>
    where
        F: FnMut(Row) -> DbResult<()> + Send,
    {
        self.ensure_open()?;
        let params = self.codec.encode_params(params)?;
        let codec = Arc::clone(&self.codec);
        debug!(context = %self.id, sql = %sql, params = params.len(), "Streaming query");

        self.busy = true;
        let result = match self.route(false) {
            Ok((conn, cache)) => stream_rows(conn, cache, &codec, sql, params, &mut f).await,
            Err(e) => Err(e),
        };
        self.busy = false;

        if let Err(e) = &result {
            warn!(context = %self.id, sql = %sql, error = %e, "Streaming query failed");
        }
        result
    }

    /// Run a multi-statement script on the write handle.
    ///
    /// The script is split by the `-- begin block --` convention of
    /// [`split_statements`]. Returns the number of statements executed.
    pub async fn execute_all(&mut self, script: &str) -> DbResult<usize> {
        self.ensure_open()?;
        let statements = split_statements(script);
        for (index, statement) in statements.iter().enumerate() {
            debug!(context = %self.id, index, sql = %statement, "Executing script statement");
            self.run_raw(statement).await.map_err(|e| {
                warn!(context = %self.id, index, error = %e, "Script statement failed");
                e
            })?;
        }
        Ok(statements.len())
    }

    async fn run_raw(&mut self, sql: &str) -> DbResult<()> {
        self.busy = true;
        let result = match self.route(true) {
            Ok((conn, _)) => execute_raw(conn, sql).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.busy = false;
        result
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction, or a nested savepoint when one is already open.
    pub async fn begin_savepoint(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        let depth = self.nesting + 1;
        let sql = if depth == 1 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT sp_{}", depth)
        };
        self.run_raw(&sql).await?;
        self.nesting = depth;
        debug!(context = %self.id, depth, "Savepoint opened");
        Ok(())
    }

    /// Commit the innermost savepoint.
    ///
    /// If the commit fails the level is rolled back and the error returned.
    pub async fn release_savepoint(&mut self) -> DbResult<()> {
        let depth = self.nesting;
        if depth == 0 {
            return Err(DbError::invalid_input("No open savepoint to release"));
        }
        let sql = if depth == 1 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE SAVEPOINT sp_{}", depth)
        };
        match self.run_raw(&sql).await {
            Ok(()) => {
                self.nesting = depth - 1;
                debug!(context = %self.id, depth, "Savepoint released");
                Ok(())
            }
            Err(e) => {
                warn!(context = %self.id, depth, error = %e, "Commit failed, rolling back");
                if let Err(rollback_err) = self.rollback_savepoint().await {
                    debug!(context = %self.id, error = %rollback_err, "Rollback after failed commit failed");
                }
                Err(e)
            }
        }
    }

    /// Roll back the innermost savepoint.
    ///
    /// The nesting level is closed even if the rollback fails; the context is then marked so the
    /// pool will not recycle it.
    pub async fn rollback_savepoint(&mut self) -> DbResult<()> {
        let depth = self.nesting;
        if depth == 0 {
            return Err(DbError::invalid_input("No open savepoint to roll back"));
        }
        let result = if depth == 1 {
            self.run_raw("ROLLBACK").await
        } else {
            match self
                .run_raw(&format!("ROLLBACK TO SAVEPOINT sp_{}", depth))
                .await
            {
                Ok(()) => self.run_raw(&format!("RELEASE SAVEPOINT sp_{}", depth)).await,
                Err(e) => Err(e),
            }
        };
        self.nesting = depth - 1;

        match &result {
            Ok(()) => debug!(context = %self.id, depth, "Savepoint rolled back"),
            Err(e) => {
                self.broken = true;
                warn!(context = %self.id, depth, error = %e, "Rollback failed");
            }
        }
        result
    }

    /// Run `f` inside a savepoint.
    ///
    /// Commits when `f` succeeds and rolls back to the savepoint when it fails. Calls nest: an
    /// inner failure can be caught and the outer unit of work continues.
    ///
    /// ```ignore
    /// ctx.with_savepoint(|ctx| Box::pin(async move {
    ///     ctx.execute_update("UPDATE accounts SET balance = balance - 10 WHERE id = ?", &sql_params![1]).await?;
    ///     ctx.execute_update("UPDATE accounts SET balance = balance + 10 WHERE id = ?", &sql_params![2]).await?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn with_savepoint<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ConnectionContext) -> BoxFuture<'c, DbResult<T>>,
    {
        self.begin_savepoint().await?;
        let depth = self.nesting;
        match f(self).await {
            Ok(value) => {
                self.unwind_to(depth).await;
                self.release_savepoint().await?;
                Ok(value)
            }
            Err(e) => {
                self.unwind_to(depth).await;
                if let Err(rollback_err) = self.rollback_savepoint().await {
                    warn!(context = %self.id, error = %rollback_err, "Rollback after error failed");
                }
                Err(e)
            }
        }
    }

    /// Alias of [`with_savepoint`](Self::with_savepoint) for the outermost unit of work.
    pub async fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ConnectionContext) -> BoxFuture<'c, DbResult<T>>,
    {
        self.with_savepoint(f).await
    }

    /// Roll back savepoints a callback opened and left open.
    pub(crate) async fn unwind_to(&mut self, depth: u32) {
        while self.nesting > depth {
            warn!(context = %self.id, depth = self.nesting, "Rolling back savepoint left open");
            if self.rollback_savepoint().await.is_err() {
                break;
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Check that the context can go back to the idle list.
    pub(crate) fn before_release(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::context_closed(self.id.to_string()));
        }
        if self.nesting > 0 {
            return Err(DbError::TransactionInProgress {
                depth: self.nesting,
            });
        }
        if self.busy {
            return Err(DbError::ContextInterrupted {
                context_id: self.id.to_string(),
            });
        }
        if self.broken {
            return Err(DbError::internal(format!(
                "context {} has an unknown transaction state after a failed rollback",
                self.id
            )));
        }
        Ok(())
    }

    /// Close both handles. Safe to call more than once.
    pub async fn close(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.read_cache.clear();
        self.write_cache.clear();

        let mut first_error = None;
        for conn in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            if let Err(e) = conn.close().await {
                first_error.get_or_insert(DbError::from(e));
            }
        }
        debug!(context = %self.id, "Closed connection context");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("db_type", &self.db_type)
            .field("separate_reader", &self.reader.is_some())
            .field("nesting", &self.nesting)
            .field("closed", &self.closed)
            .field("read_cache", &self.read_cache)
            .field("write_cache", &self.write_cache)
            .finish()
    }
}

// =============================================================================
// Driver calls
//
// Each call is boxed at a concrete connection lifetime so the futures of the context methods stay
// `Send` inside `for<'c> FnOnce(&'c mut ConnectionContext) -> BoxFuture<'c, _>` callbacks.
// =============================================================================

fn prepare<'a>(
    conn: &'a mut AnyConnection,
    sql: &'a str,
) -> BoxFuture<'a, DbResult<AnyStatement<'static>>> {
    async move {
        let statement = sqlx::Executor::prepare(&mut *conn, sql).await?;
        Ok(Statement::to_owned(&statement))
    }
    .boxed()
}

fn decode_rows(
    codec: &RowCodec,
    rows: &[AnyRow],
    columns: Arc<[ColumnInfo]>,
) -> DbResult<RowSet> {
    let decoded = rows
        .iter()
        .map(|row| codec.decode_row(row, &columns))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(RowSet::new(columns, decoded))
}

fn fetch_cached<'a>(
    conn: &'a mut AnyConnection,
    cache: &'a mut StatementCache,
    codec: &'a RowCodec,
    sql: &'a str,
    params: Vec<SqlValue>,
) -> BoxFuture<'a, DbResult<RowSet>> {
    async move {
        let statement = match cache.take(sql) {
            Some(statement) => statement,
            None => prepare(conn, sql).await?,
        };
        let columns = column_info(statement.columns());
        let result = bind_all(statement.query(), params)
            .fetch_all(&mut *conn)
            .await;
        cache.put(sql, statement);
        let rows: Vec<AnyRow> = result?;
        decode_rows(codec, &rows, columns)
    }
    .boxed()
}

fn fetch_uncached<'a>(
    conn: &'a mut AnyConnection,
    codec: &'a RowCodec,
    sql: &'a str,
    params: Vec<SqlValue>,
) -> BoxFuture<'a, DbResult<RowSet>> {
    async move {
        let rows: Vec<AnyRow> = bind_all(sqlx::query(sql).persistent(false), params)
            .fetch_all(&mut *conn)
            .await?;
        let columns = match rows.first() {
            Some(row) => column_info(row.columns()),
            None => Arc::from(Vec::new()),
        };
        decode_rows(codec, &rows, columns)
    }
    .boxed()
}

fn execute_cached<'a>(
    conn: &'a mut AnyConnection,
    cache: &'a mut StatementCache,
    sql: &'a str,
    params: Vec<SqlValue>,
) -> BoxFuture<'a, DbResult<u64>> {
    async move {
        let statement = match cache.take(sql) {
            Some(statement) => statement,
            None => prepare(conn, sql).await?,
        };
        let result = bind_all(statement.query(), params)
            .execute(&mut *conn)
            .await;
        cache.put(sql, statement);
        Ok(result?.rows_affected())
    }
    .boxed()
}

fn execute_uncached<'a>(
    conn: &'a mut AnyConnection,
    sql: &'a str,
    params: Vec<SqlValue>,
) -> BoxFuture<'a, DbResult<u64>> {
    async move {
        let result = bind_all(sqlx::query(sql).persistent(false), params)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
    .boxed()
}

fn execute_raw<'a>(conn: &'a mut AnyConnection, sql: &'a str) -> BoxFuture<'a, DbResult<u64>> {
    async move {
        let result = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }
    .boxed()
}

/// Stream rows of a cached statement through `f`. The stream is dropped on every exit path.
fn stream_rows<'a, F>(
    conn: &'a mut AnyConnection,
    cache: &'a mut StatementCache,
    codec: &'a RowCodec,
    sql: &'a str,
    params: Vec<SqlValue>,
    f: &'a mut F,
) -> BoxFuture<'a, DbResult<u64>>
where
    F: FnMut(Row) -> DbResult<()> + Send,
{
    async move {
        let statement = match cache.take(sql) {
            Some(statement) => statement,
            None => prepare(conn, sql).await?,
        };
        let columns = column_info(statement.columns());
        let result = async {
            let mut stream = bind_all(statement.query(), params).fetch(&mut *conn);
            let mut count = 0u64;
            while let Some(row) = stream.try_next().await? {
                f(codec.decode_row(&row, &columns)?)?;
                count += 1;
            }
            Ok::<u64, DbError>(count)
        }
        .await;
        cache.put(sql, statement);
        result
    }
    .boxed()
}
