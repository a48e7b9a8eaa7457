//! Per-backend SQL for the migration history table.

use crate::models::DatabaseType;

/// Name of the migration history table.
pub const MIGRATIONS_TABLE: &str = "__performed_migrations";

/// SQL the migrator needs, specialized per backend.
///
/// `performed_at` is read back as text; the Any driver has no timestamp type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaDialect {
    db_type: DatabaseType,
}

impl SchemaDialect {
    pub fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Whether DDL statements can be rolled back.
    pub fn transactional_ddl(&self) -> bool {
        self.db_type.supports_transactional_ddl()
    }

    /// Positional placeholder `n` (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self.db_type {
            DatabaseType::PostgreSQL => format!("${}", n),
            DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
        }
    }

    pub fn create_table_sql(&self) -> String {
        match self.db_type {
            DatabaseType::SQLite => format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (\n\
                 \x20   name TEXT NOT NULL PRIMARY KEY,\n\
                 \x20   version INTEGER,\n\
                 \x20   hash TEXT NOT NULL,\n\
                 \x20   performed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
                 )"
            ),
            DatabaseType::PostgreSQL => format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (\n\
                 \x20   name VARCHAR(255) NOT NULL PRIMARY KEY,\n\
                 \x20   version BIGINT,\n\
                 \x20   hash VARCHAR(64) NOT NULL,\n\
                 \x20   performed_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
                 )"
            ),
            DatabaseType::MySQL => format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (\n\
                 \x20   name VARCHAR(255) NOT NULL PRIMARY KEY,\n\
                 \x20   version BIGINT NULL,\n\
                 \x20   hash VARCHAR(64) NOT NULL,\n\
                 \x20   performed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
                 )"
            ),
        }
    }

    /// Query returning a row when the history table exists. Takes the table name as parameter 1.
    pub fn table_exists_sql(&self) -> String {
        match self.db_type {
            DatabaseType::SQLite => format!(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = {}",
                self.placeholder(1)
            ),
            DatabaseType::PostgreSQL => format!(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = {}",
                self.placeholder(1)
            ),
            DatabaseType::MySQL => format!(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = {}",
                self.placeholder(1)
            ),
        }
    }

    /// All history rows ordered by name, `performed_at` as text.
    pub fn select_history_sql(&self) -> String {
        let performed_at = match self.db_type {
            DatabaseType::SQLite => "performed_at",
            DatabaseType::PostgreSQL => "performed_at::text AS performed_at",
            DatabaseType::MySQL => "CAST(performed_at AS CHAR) AS performed_at",
        };
        format!("SELECT name, version, hash, {performed_at} FROM {MIGRATIONS_TABLE} ORDER BY name")
    }

    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {MIGRATIONS_TABLE} WHERE name = {}",
            self.placeholder(1)
        )
    }

    /// Insert a history row. Repeatable migrations leave `version` out so no untyped NULL is
    /// bound.
    pub fn insert_sql(&self, versioned: bool) -> String {
        if versioned {
            format!(
                "INSERT INTO {MIGRATIONS_TABLE} (name, version, hash) VALUES ({}, {}, {})",
                self.placeholder(1),
                self.placeholder(2),
                self.placeholder(3)
            )
        } else {
            format!(
                "INSERT INTO {MIGRATIONS_TABLE} (name, hash) VALUES ({}, {})",
                self.placeholder(1),
                self.placeholder(2)
            )
        }
    }
}

impl From<DatabaseType> for SchemaDialect {
    fn from(db_type: DatabaseType) -> Self {
        Self::new(db_type)
    }
}
