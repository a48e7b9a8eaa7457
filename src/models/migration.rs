//! Migration history and reporting models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of the migration history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformedMigration {
    pub name: String,
    /// None for repeatable migrations.
    pub version: Option<i64>,
    pub hash: String,
    pub performed_at: Option<DateTime<Utc>>,
}

impl PerformedMigration {
    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }
}

/// A migration the migrator applied, or would apply in check-only mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub name: String,
    pub version: Option<i64>,
    pub hash: String,
}

/// Outcome of a migrate or verify run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Highest applied version before the run.
    pub starting_version: i64,
    /// Highest applied version after the run.
    pub db_version: i64,
    pub applied: Vec<AppliedMigration>,
    /// True when nothing was executed (verify only).
    pub dry_run: bool,
}

impl MigrationReport {
    pub fn is_up_to_date(&self) -> bool {
        self.applied.is_empty()
    }
}
