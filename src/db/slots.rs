//! Concurrency slots and reentrancy bookkeeping.
//!
//! Capacity limits the number of *top-level* acquisitions in flight. A task (or thread) that
//! already holds a context from a pool and asks the same pool for another one is reentrant: it
//! skips the slot wait so nested calls cannot deadlock against their own caller. Reentrant
//! acquisitions still count against the pool's hard ceiling of twice the capacity.

use crate::db::pool::PoolShared;
use crate::error::{DbError, DbResult};
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;

tokio::task_local! {
    /// Pools the current task holds a context from, innermost last.
    static HELD_POOLS: Vec<u64>;
}

thread_local! {
    static HELD_SYNC: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn held_by_current_task(pool_id: u64) -> bool {
    HELD_POOLS
        .try_with(|held| held.contains(&pool_id))
        .unwrap_or(false)
}

pub(crate) fn held_by_current_thread(pool_id: u64) -> bool {
    HELD_SYNC.with(|held| held.borrow().contains(&pool_id))
}

/// Run `fut` with `pool_id` recorded as held by the current task.
pub(crate) async fn scope_held<F: Future>(pool_id: u64, fut: F) -> F::Output {
    let mut held = HELD_POOLS.try_with(Vec::clone).unwrap_or_default();
    held.push(pool_id);
    HELD_POOLS.scope(held, fut).await
}

/// Records a pool as held by the current thread until dropped.
pub(crate) struct ThreadHold {
    pool_id: u64,
}

impl ThreadHold {
    pub fn new(pool_id: u64) -> Self {
        HELD_SYNC.with(|held| held.borrow_mut().push(pool_id));
        Self { pool_id }
    }
}

impl Drop for ThreadHold {
    fn drop(&mut self) {
        HELD_SYNC.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == self.pool_id) {
                held.remove(pos);
            }
        });
    }
}

/// A concurrency slot. Released on drop.
pub(crate) struct SlotPermit {
    shared: Arc<PoolShared>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.slots_in_use = state.slots_in_use.saturating_sub(1);
        }
        self.shared.slot_freed.notify_waiters();
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("pool", &self.shared.id)
            .finish()
    }
}

/// Wait for a free slot, up to the pool's acquire timeout.
///
/// Fails early when the pool is paused or closed, including while waiting.
pub(crate) async fn acquire_slot(shared: &Arc<PoolShared>) -> DbResult<SlotPermit> {
    let deadline = Instant::now() + shared.acquire_timeout;
    loop {
        let notified = shared.slot_freed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (in_use, capacity) = {
            let mut state = shared.state.lock();
            state.check_open()?;
            let capacity = shared.capacity.load(Ordering::Acquire);
            if state.slots_in_use < capacity {
                state.slots_in_use += 1;
                return Ok(SlotPermit {
                    shared: Arc::clone(shared),
                });
            }
            (state.slots_in_use, capacity)
        };

        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            tracing::debug!(pool = shared.id, in_use, capacity, "Timed out waiting for a slot");
            return Err(DbError::pool_exhausted(in_use, capacity));
        }
    }
}
