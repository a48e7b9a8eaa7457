//! Schema migration runner.
//!
//! Applies the pending migrations of a [`MigrationSet`] to a [`Database`], one savepoint per
//! migration, and records each one in the history table. On backends without transactional DDL
//! the pool is drained first and the run happens on a private pool while normal traffic gets
//! `PoolPaused`.

use crate::config::DEFAULT_DRAIN_TIMEOUT_SECS;
use crate::db::{ConnectionContext, Database, FromRow, Row};
use crate::db::types::parse_timestamp;
use crate::error::{DbError, DbResult};
use crate::migrate::dialect::{MIGRATIONS_TABLE, SchemaDialect};
use crate::migrate::migration::Migration;
use crate::migrate::set::MigrationSet;
use crate::models::{AppliedMigration, MigrationReport, PerformedMigration};
use crate::sql_params;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default time to wait for checked-out contexts before a non-transactional run.
pub const DEFAULT_MIGRATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS);

/// Code run before or after the migration of one version, inside its savepoint.
pub type MigrationHandler =
    Box<dyn for<'c> Fn(&'c mut ConnectionContext) -> BoxFuture<'c, DbResult<()>> + Send + Sync>;

/// Callbacks around a whole migration run.
pub trait MigrationHooks: Send + Sync {
    /// Runs before any connection is acquired.
    fn before_all(&self) -> DbResult<()> {
        Ok(())
    }

    fn on_success(&self, _report: &MigrationReport) -> DbResult<()> {
        Ok(())
    }

    /// Called when a run fails on a backend without transactional DDL. The returned error is
    /// the one `migrate` reports.
    ///
    /// By default a failed migration is escalated to `RollbackUnsupported`, wrapping the
    /// failure: its statements may be half applied and only a restore can undo them. Failures
    /// before any script ran pass through unchanged.
    fn on_failure(&self, error: DbError) -> DbError {
        if matches!(error, DbError::MigrationFailed { .. }) {
            DbError::RollbackUnsupported {
                source: Box::new(error),
            }
        } else {
            error
        }
    }
}

/// Hooks that do nothing beyond the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl MigrationHooks for DefaultHooks {}

/// Where a migration run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Idle,
    Draining,
    TableEnsured,
    /// Applying migration `index` (1-based) of `total`.
    Applying { index: usize, total: usize },
    Committing,
    RolledBack,
    Restoring,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorOptions {
    pub drain_timeout: Duration,
    /// Wrap the whole batch in one outer transaction. Ignored without transactional DDL.
    pub single_transaction: bool,
    /// Override the backend's transactional DDL capability.
    pub transactional_ddl: Option<bool>,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_MIGRATION_DRAIN_TIMEOUT,
            single_transaction: false,
            transactional_ddl: None,
        }
    }
}

/// Applies migration sets.
///
/// ```ignore
/// let migrator = SchemaMigrator::new()
///     .after(3, |ctx| Box::pin(async move {
///         ctx.execute_update("UPDATE users SET active = 1", &[]).await?;
///         Ok(())
///     }))?;
/// let report = migrator.migrate(&db, &MigrationSet::from_dir("migrations")?).await?;
/// ```
pub struct SchemaMigrator {
    options: MigratorOptions,
    before: HashMap<i64, MigrationHandler>,
    after: HashMap<i64, MigrationHandler>,
    hooks: Box<dyn MigrationHooks>,
    phase: Mutex<MigrationPhase>,
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaMigrator {
    pub fn new() -> Self {
        Self::with_options(MigratorOptions::default())
    }

    pub fn with_options(options: MigratorOptions) -> Self {
        Self {
            options,
            before: HashMap::new(),
            after: HashMap::new(),
            hooks: Box::new(DefaultHooks),
            phase: Mutex::new(MigrationPhase::Idle),
        }
    }

    pub fn hooks(mut self, hooks: impl MigrationHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Register code to run before the migration of `version`.
    pub fn before<F>(mut self, version: i64, handler: F) -> DbResult<Self>
    where
        F: for<'c> Fn(&'c mut ConnectionContext) -> BoxFuture<'c, DbResult<()>>
            + Send
            + Sync
            + 'static,
    {
        register(&mut self.before, "before", version, Box::new(handler))?;
        Ok(self)
    }

    /// Register code to run after the migration of `version`.
    pub fn after<F>(mut self, version: i64, handler: F) -> DbResult<Self>
    where
        F: for<'c> Fn(&'c mut ConnectionContext) -> BoxFuture<'c, DbResult<()>>
            + Send
            + Sync
            + 'static,
    {
        register(&mut self.after, "after", version, Box::new(handler))?;
        Ok(self)
    }

    pub fn options(&self) -> &MigratorOptions {
        &self.options
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: MigrationPhase) {
        debug!(?phase, "Migration phase");
        *self.phase.lock() = phase;
    }

    fn uses_transactional_ddl(&self, db: &Database) -> bool {
        self.options
            .transactional_ddl
            .unwrap_or_else(|| SchemaDialect::new(db.database_type()).transactional_ddl())
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Bring the database up to date with `set`.
    ///
    /// Each migration runs in its own savepoint; a failure rolls it back, stops the run and is
    /// returned as `MigrationFailed`. Migrations applied before the failure stay applied unless
    /// `single_transaction` is set.
    pub async fn migrate(&self, db: &Database, set: &MigrationSet) -> DbResult<MigrationReport> {
        self.set_phase(MigrationPhase::Idle);
        let transactional = self.uses_transactional_ddl(db);
        info!(
            db_type = %db.database_type(),
            migrations = set.len(),
            transactional,
            "Starting schema migration"
        );

        if let Err(e) = self.hooks.before_all() {
            self.set_phase(MigrationPhase::Failed);
            return Err(e);
        }

        let started = Instant::now();
        let result = if transactional {
            match db.acquire_async().await {
                Ok(mut ctx) => self.apply(&mut ctx, set, true).await,
                Err(e) => Err(e),
            }
        } else {
            self.set_phase(MigrationPhase::Draining);
            db.close_all_contexts_with(self.options.drain_timeout, |exclusive| async move {
                let mut ctx = exclusive.acquire_async().await?;
                self.apply(&mut ctx, set, false).await
            })
            .await
        };
        self.set_phase(MigrationPhase::Restoring);

        match result {
            Ok(report) => {
                if let Err(e) = self.hooks.on_success(&report) {
                    self.set_phase(MigrationPhase::Failed);
                    return Err(e);
                }
                self.set_phase(MigrationPhase::Idle);
                info!(
                    applied = report.applied.len(),
                    db_version = report.db_version,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Schema migration complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_phase(MigrationPhase::Failed);
                error!(error = %e, "Schema migration failed");
                if transactional {
                    Err(e)
                } else {
                    Err(self.hooks.on_failure(e))
                }
            }
        }
    }

    /// Check history integrity and list pending migrations without applying anything.
    pub async fn verify(&self, db: &Database, set: &MigrationSet) -> DbResult<MigrationReport> {
        let mut ctx = db.acquire_async().await?;
        let performed = read_history(&mut ctx).await?;
        set.check_integrity(&performed)?;

        let starting_version = max_version(&performed);
        let pending = set.to_perform(starting_version, &repeatable_hashes(&performed))?;
        Ok(MigrationReport {
            starting_version,
            db_version: starting_version,
            applied: pending.into_iter().map(applied_entry).collect(),
            dry_run: true,
        })
    }

    /// Highest applied version, 0 for a fresh database.
    pub async fn current_version(&self, db: &Database) -> DbResult<i64> {
        Ok(max_version(&self.performed_migrations(db).await?))
    }

    /// The history table, ordered by name. Empty when the table does not exist yet.
    pub async fn performed_migrations(&self, db: &Database) -> DbResult<Vec<PerformedMigration>> {
        let mut ctx = db.acquire_async().await?;
        read_history(&mut ctx).await
    }

    // =========================================================================
    // Application
    // =========================================================================

    async fn apply(
        &self,
        ctx: &mut ConnectionContext,
        set: &MigrationSet,
        transactional: bool,
    ) -> DbResult<MigrationReport> {
        let dialect = SchemaDialect::new(ctx.database_type());
        ctx.execute_all(&dialect.create_table_sql()).await?;
        self.set_phase(MigrationPhase::TableEnsured);

        let performed = ctx
            .query_all::<PerformedMigration>(&dialect.select_history_sql(), &[])
            .await?;
        set.check_integrity(&performed)?;

        let starting_version = max_version(&performed);
        let pending = set.to_perform(starting_version, &repeatable_hashes(&performed))?;

        let outer = self.options.single_transaction && !pending.is_empty();
        if outer && !transactional {
            warn!("single_transaction ignored: DDL is not transactional on this backend");
        }
        let outer = outer && transactional;
        if outer {
            ctx.begin_savepoint().await?;
        }

        let applied = match self.apply_pending(ctx, dialect, &pending).await {
            Ok(applied) => applied,
            Err(e) => {
                if outer {
                    if let Err(rollback_err) = ctx.rollback_savepoint().await {
                        warn!(error = %rollback_err, "Rolling back migration batch failed");
                    }
                }
                self.set_phase(MigrationPhase::RolledBack);
                return Err(e);
            }
        };

        self.set_phase(MigrationPhase::Committing);
        if outer {
            ctx.release_savepoint().await?;
        }

        let db_version = applied
            .iter()
            .filter_map(|m| m.version)
            .max()
            .unwrap_or(starting_version)
            .max(starting_version);
        Ok(MigrationReport {
            starting_version,
            db_version,
            applied,
            dry_run: false,
        })
    }

    async fn apply_pending(
        &self,
        ctx: &mut ConnectionContext,
        dialect: SchemaDialect,
        pending: &[&Migration],
    ) -> DbResult<Vec<AppliedMigration>> {
        let total = pending.len();
        let mut done = Vec::with_capacity(total);
        for (i, migration) in pending.iter().copied().enumerate() {
            self.set_phase(MigrationPhase::Applying {
                index: i + 1,
                total,
            });
            info!(migration = %migration, index = i + 1, total, "Applying migration");
            let started = Instant::now();

            ctx.begin_savepoint()
                .await
                .map_err(|e| DbError::migration_failed(migration.name(), e))?;
            let depth = ctx.nesting_depth();
            match self.apply_one(ctx, dialect, migration).await {
                Ok(()) => {
                    ctx.unwind_to(depth).await;
                    ctx.release_savepoint()
                        .await
                        .map_err(|e| DbError::migration_failed(migration.name(), e))?;
                }
                Err(e) => {
                    ctx.unwind_to(depth).await;
                    if let Err(rollback_err) = ctx.rollback_savepoint().await {
                        warn!(migration = %migration, error = %rollback_err, "Rollback failed");
                    }
                    error!(migration = %migration, error = %e, "Migration failed");
                    return Err(DbError::migration_failed(migration.name(), e));
                }
            }

            debug!(
                migration = %migration,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Migration applied"
            );
            done.push(applied_entry(migration));
        }
        Ok(done)
    }

    async fn apply_one(
        &self,
        ctx: &mut ConnectionContext,
        dialect: SchemaDialect,
        migration: &Migration,
    ) -> DbResult<()> {
        if let Some(handler) = migration.version().and_then(|v| self.before.get(&v)) {
            handler(ctx).await?;
        }
        let statements = ctx.execute_all(migration.sql()).await?;
        debug!(migration = %migration, statements, "Executed migration script");
        if let Some(handler) = migration.version().and_then(|v| self.after.get(&v)) {
            handler(ctx).await?;
        }

        ctx.execute_update(&dialect.delete_sql(), &sql_params![migration.name()])
            .await?;
        match migration.version() {
            Some(version) => {
                ctx.execute_update(
                    &dialect.insert_sql(true),
                    &sql_params![migration.name(), version, migration.hash()],
                )
                .await?
            }
            None => {
                ctx.execute_update(
                    &dialect.insert_sql(false),
                    &sql_params![migration.name(), migration.hash()],
                )
                .await?
            }
        };
        Ok(())
    }
}

impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut before: Vec<_> = self.before.keys().copied().collect();
        let mut after: Vec<_> = self.after.keys().copied().collect();
        before.sort_unstable();
        after.sort_unstable();
        f.debug_struct("SchemaMigrator")
            .field("options", &self.options)
            .field("before", &before)
            .field("after", &after)
            .field("phase", &self.phase())
            .finish()
    }
}

fn register(
    handlers: &mut HashMap<i64, MigrationHandler>,
    kind: &str,
    version: i64,
    handler: MigrationHandler,
) -> DbResult<()> {
    if version < 1 {
        return Err(DbError::invalid_input(format!(
            "{} handler version must be at least 1, got {}",
            kind, version
        )));
    }
    match handlers.entry(version) {
        Entry::Occupied(_) => Err(DbError::invalid_input(format!(
            "{} handler for version {} is already registered",
            kind, version
        ))),
        Entry::Vacant(slot) => {
            slot.insert(handler);
            Ok(())
        }
    }
}

async fn read_history(ctx: &mut ConnectionContext) -> DbResult<Vec<PerformedMigration>> {
    let dialect = SchemaDialect::new(ctx.database_type());
    let exists = ctx
        .query_row(&dialect.table_exists_sql(), &sql_params![MIGRATIONS_TABLE])
        .await?
        .is_some();
    if !exists {
        return Ok(Vec::new());
    }
    ctx.query_all(&dialect.select_history_sql(), &[]).await
}

fn max_version(performed: &[PerformedMigration]) -> i64 {
    performed
        .iter()
        .filter_map(|m| m.version)
        .max()
        .unwrap_or(0)
}

fn repeatable_hashes(performed: &[PerformedMigration]) -> HashSet<String> {
    performed
        .iter()
        .filter(|m| m.is_repeatable())
        .map(|m| m.hash.clone())
        .collect()
}

fn applied_entry(migration: &Migration) -> AppliedMigration {
    AppliedMigration {
        name: migration.name().to_string(),
        version: migration.version(),
        hash: migration.hash().to_string(),
    }
}

impl FromRow for PerformedMigration {
    fn from_row(row: &Row) -> DbResult<Self> {
        let performed_at: Option<String> = row.get("performed_at")?;
        Ok(Self {
            name: row.get("name")?,
            version: row.get("version")?,
            hash: row.get("hash")?,
            performed_at: performed_at.as_deref().and_then(parse_timestamp),
        })
    }
}
