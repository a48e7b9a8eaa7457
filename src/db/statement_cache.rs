//! Per-context prepared statement cache.

use sqlx::any::AnyStatement;
use std::collections::HashMap;

/// Prepared statements keyed by SQL text.
///
/// Statements are taken out while they execute and put back afterwards, so a statement is never
/// shared between two in-flight calls.
#[derive(Default)]
pub(crate) struct StatementCache {
    statements: HashMap<String, AnyStatement<'static>>,
}

impl StatementCache {
    pub fn take(&mut self, sql: &str) -> Option<AnyStatement<'static>> {
        self.statements.remove(sql)
    }

    pub fn put(&mut self, sql: &str, statement: AnyStatement<'static>) {
        self.statements.insert(sql.to_string(), statement);
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.statements.len())
            .finish()
    }
}
