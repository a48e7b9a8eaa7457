//! Background task that converges a pool to its capacity.
//!
//! Wakes on a timer or when signalled (capacity change, pause, close, release above capacity),
//! destroys surplus idle contexts, and exits once the pool is closed or dropped.

use crate::db::pool::{PoolShared, close_contexts};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

pub(crate) async fn run(pool: Weak<PoolShared>, signal: Arc<Notify>, interval: Duration) {
    loop {
        let Some(shared) = pool.upgrade() else {
            return;
        };
        let (surplus, closed) = shared.take_surplus();
        if !surplus.is_empty() {
            let state = shared.state.lock();
            info!(
                pool = shared.id,
                reclaimed = surplus.len(),
                active = state.active,
                idle = state.idle.len(),
                "Reclaiming idle contexts"
            );
        }
        close_contexts(shared.id, surplus).await;

        if closed {
            debug!(pool = shared.id, "Reclaimer stopped");
            return;
        }

        // Still above capacity: contexts in use will come back soon, check again sooner.
        let wait = if shared.over_capacity() {
            interval / 5
        } else {
            interval
        };
        drop(shared);

        tokio::select! {
            _ = signal.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
