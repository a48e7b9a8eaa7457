//! Error types for dbkeeper.
//!
//! This module defines all error types using `thiserror`. Pool lifecycle errors are kept
//! distinct from each other because each one asks something different of the caller:
//! back off on exhaustion, wait while paused, stop once closed.

use thiserror::Error;

/// Coarse classification of [`DbError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No free context and no headroom to create one.
    ResourceExhaustion,
    /// Pool is paused, closed, or a context was used after close.
    LifecycleState,
    /// A context failed its pre-release check.
    Leak,
    DrainTimeout,
    MigrationNaming,
    MigrationIntegrity,
    MigrationExecution,
    RowMapping,
    Connection,
    Database,
    InvalidInput,
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Pool exhausted: {active} contexts open, capacity {capacity}")]
    PoolExhausted { active: usize, capacity: usize },

    #[error("Pool is paused: {reason}")]
    PoolPaused { reason: String },

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Drain timed out after {waited_ms}ms with {active} contexts still active")]
    DrainTimeout { active: usize, waited_ms: u64 },

    #[error("Connection context {context_id} is closed")]
    ContextClosed { context_id: String },

    #[error("Context released inside a transaction (nesting depth {depth})")]
    TransactionInProgress { depth: u32 },

    #[error("Context {context_id} was interrupted in the middle of an operation")]
    ContextInterrupted { context_id: String },

    #[error("Bad migration name '{name}': {reason}")]
    MigrationNaming { name: String, reason: String },

    #[error("Migration integrity violated: {message}")]
    MigrationIntegrity { message: String },

    #[error("Migration failed: {migration}: {source}")]
    MigrationFailed {
        migration: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Migration rollback is not supported; restore from a backup: {source}")]
    RollbackUnsupported {
        #[source]
        source: Box<DbError>,
    },

    #[error("Row mapping failed: {message}")]
    RowMapping { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn pool_exhausted(active: usize, capacity: usize) -> Self {
        Self::PoolExhausted { active, capacity }
    }

    pub fn pool_paused(reason: impl Into<String>) -> Self {
        Self::PoolPaused {
            reason: reason.into(),
        }
    }

    pub fn drain_timeout(active: usize, waited_ms: u64) -> Self {
        Self::DrainTimeout { active, waited_ms }
    }

    pub fn context_closed(context_id: impl Into<String>) -> Self {
        Self::ContextClosed {
            context_id: context_id.into(),
        }
    }

    /// Create a migration naming error.
    pub fn migration_naming(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MigrationNaming {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a migration integrity error.
    pub fn migration_integrity(message: impl Into<String>) -> Self {
        Self::MigrationIntegrity {
            message: message.into(),
        }
    }

    /// Wrap an error raised while applying `migration`.
    pub fn migration_failed(migration: impl Into<String>, source: DbError) -> Self {
        Self::MigrationFailed {
            migration: migration.into(),
            source: Box::new(source),
        }
    }

    /// Create a row mapping error.
    pub fn row_mapping(message: impl Into<String>) -> Self {
        Self::RowMapping {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("Retry with backoff or raise max_connections"),
            Self::PoolPaused { .. } => Some("Wait for the drain or migration to finish"),
            Self::PoolClosed => Some("Create a new pool"),
            Self::DrainTimeout { .. } => {
                Some("Release held contexts or increase the drain timeout")
            }
            Self::MigrationIntegrity { .. } => {
                Some("Restore the applied migration text or add a new migration instead")
            }
            _ => None,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::ResourceExhaustion,
            Self::PoolPaused { .. } | Self::PoolClosed | Self::ContextClosed { .. } => {
                ErrorKind::LifecycleState
            }
            Self::TransactionInProgress { .. } | Self::ContextInterrupted { .. } => {
                ErrorKind::Leak
            }
            Self::DrainTimeout { .. } => ErrorKind::DrainTimeout,
            Self::MigrationNaming { .. } => ErrorKind::MigrationNaming,
            Self::MigrationIntegrity { .. } => ErrorKind::MigrationIntegrity,
            Self::MigrationFailed { .. } | Self::RollbackUnsupported { .. } => {
                ErrorKind::MigrationExecution
            }
            Self::RowMapping { .. } => ErrorKind::RowMapping,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Database { .. } => ErrorKind::Database,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Internal { .. } | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::PoolExhausted { .. }
                | Self::PoolPaused { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::row_mapping(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::row_mapping(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::row_mapping(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::row_mapping(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::row_mapping(format!("Decode error: {}", source)),
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check database driver configuration",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "The connection must be discarded",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
