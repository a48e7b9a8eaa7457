//! Pool observability models.

use serde::Serialize;

/// Point-in-time snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured capacity; reads 0 while the pool is paused or closed.
    pub max_connections: usize,
    /// Contexts currently open, idle or checked out.
    pub active: usize,
    pub idle: usize,
    /// Contexts checked out or being opened (`active - idle`).
    pub in_use: usize,
    /// Contexts that failed their release check and were destroyed.
    pub leaked: usize,
    pub paused: bool,
    pub closed: bool,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max={} active={} idle={} in_use={} leaked={}",
            self.max_connections, self.active, self.idle, self.in_use, self.leaked
        )?;
        if self.closed {
            write!(f, " (closed)")
        } else if self.paused {
            write!(f, " (paused)")
        } else {
            Ok(())
        }
    }
}
