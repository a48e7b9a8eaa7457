//! A single named, hashed unit of SQL.

use crate::error::{DbError, DbResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)v(\d+)__").expect("invalid regex"));

const REPEATABLE_PREFIX: &str = "r__";

/// One migration script.
///
/// Names starting with `R__` (any case) are repeatable and carry no version. Every other name must
/// contain a `V<digits>__` token, e.g. `V3__add_users.sql`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    name: String,
    sql: String,
    hash: String,
    version: Option<i64>,
}

impl Migration {
    /// Parse a migration, failing on a malformed name.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        let sql = sql.into();
        let version = parse_version(&name)?;
        Ok(Self {
            hash: hash_sql(&sql),
            name,
            sql,
            version,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Base64-encoded SHA-256 of the SQL text.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// None for repeatable migrations.
    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }
}

impl std::fmt::Display for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn parse_version(name: &str) -> DbResult<Option<i64>> {
    if name.to_lowercase().starts_with(REPEATABLE_PREFIX) {
        return Ok(None);
    }
    let caps = VERSION_RE.captures(name).ok_or_else(|| {
        DbError::migration_naming(name, "expected an R__ prefix or a V<number>__ token")
    })?;
    let digits = caps.get(1).map_or("", |m| m.as_str());
    let version: i64 = digits
        .parse()
        .map_err(|_| DbError::migration_naming(name, format!("bad version number {}", digits)))?;
    if version < 1 {
        return Err(DbError::migration_naming(name, "version must be at least 1"));
    }
    Ok(Some(version))
}

/// Hash SQL text the way the history table records it.
pub fn hash_sql(sql: &str) -> String {
    STANDARD.encode(Sha256::digest(sql.as_bytes()))
}
