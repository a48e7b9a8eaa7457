//! The migrations available to a schema.

use crate::error::{DbError, DbResult};
use crate::migrate::migration::Migration;
use crate::models::PerformedMigration;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Versioned migrations by version plus repeatable migrations by name.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    versions: BTreeMap<i64, Migration>,
    repeatables: Vec<Migration>,
}

impl MigrationSet {
    /// Build a set from `(name, sql)` pairs.
    ///
    /// Fails on a malformed name or when two migrations claim the same version.
    pub fn new<N, S>(sources: impl IntoIterator<Item = (N, S)>) -> DbResult<Self>
    where
        N: Into<String>,
        S: Into<String>,
    {
        let mut versions: BTreeMap<i64, Migration> = BTreeMap::new();
        let mut repeatables = Vec::new();
        for (name, sql) in sources {
            let migration = Migration::new(name, sql)?;
            match migration.version() {
                None => repeatables.push(migration),
                Some(version) => {
                    if let Some(existing) = versions.get(&version) {
                        return Err(DbError::migration_naming(
                            migration.name(),
                            format!("version {} is already used by {}", version, existing.name()),
                        ));
                    }
                    versions.insert(version, migration);
                }
            }
        }
        repeatables.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(Self {
            versions,
            repeatables,
        })
    }

    /// Load every `*.sql` file of a directory. The file name is the migration name.
    pub fn from_dir(dir: impl AsRef<Path>) -> DbResult<Self> {
        let dir = dir.as_ref();
        let mut sources = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_sql = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
            if !path.is_file() || !is_sql {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            debug!(file = %path.display(), "Found migration");
            sources.push((name.to_string(), std::fs::read_to_string(&path)?));
        }
        sources.sort();
        info!(dir = %dir.display(), count = sources.len(), "Loaded migrations");
        Self::new(sources)
    }

    pub fn versions(&self) -> &BTreeMap<i64, Migration> {
        &self.versions
    }

    /// Repeatable migrations, sorted by name.
    pub fn repeatables(&self) -> &[Migration] {
        &self.repeatables
    }

    /// Highest known version, 0 when there are no versioned migrations.
    pub fn last_version(&self) -> i64 {
        self.versions.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.versions.len() + self.repeatables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Migrations to apply to a database at `db_version`, in order.
    ///
    /// Versioned migrations above `db_version` come first, ascending, then repeatable
    /// migrations whose hash is not among `repeatable_hashes`, by name.
    pub fn to_perform(
        &self,
        db_version: i64,
        repeatable_hashes: &HashSet<String>,
    ) -> DbResult<Vec<&Migration>> {
        let last_version = self.last_version();
        if db_version < 0 || db_version > last_version {
            return Err(DbError::migration_integrity(format!(
                "versions inconsistency: db version is {} and migration version is {}",
                db_version, last_version
            )));
        }

        let mut pending = Vec::new();
        for version in (db_version + 1)..=last_version {
            let migration = self.versions.get(&version).ok_or_else(|| {
                DbError::migration_integrity(format!(
                    "missing required migration version={}",
                    version
                ))
            })?;
            pending.push(migration);
        }
        pending.extend(
            self.repeatables
                .iter()
                .filter(|m| !repeatable_hashes.contains(m.hash())),
        );

        if pending.is_empty() {
            info!(db_version, "No migrations needed");
        } else {
            info!(db_version, count = pending.len(), "Migrations to perform");
        }
        Ok(pending)
    }

    /// Check that every applied versioned migration still exists unchanged.
    ///
    /// Repeatable migrations are expected to change and are not checked.
    pub fn check_integrity(&self, performed: &[PerformedMigration]) -> DbResult<()> {
        for record in performed {
            let Some(version) = record.version else {
                continue;
            };
            let Some(current) = self.versions.get(&version) else {
                return Err(DbError::migration_integrity(format!(
                    "migration {} does not exist anymore",
                    record.name
                )));
            };
            if current.hash() != record.hash {
                return Err(DbError::migration_integrity(format!(
                    "migration {} has been altered",
                    current.name()
                )));
            }
        }
        Ok(())
    }
}
