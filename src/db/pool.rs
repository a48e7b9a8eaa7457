//! Bounded, self-healing connection pool.
//!
//! # Capacity
//!
//! `max_connections` is the number of concurrency slots: top-level acquisitions beyond it wait
//! (up to the acquire timeout). Reentrant acquisitions (a task or thread asking again while it
//! already holds a context from the same pool) skip the slot wait. The number of open contexts
//! never exceeds `2 × max_connections`; past that acquisition fails with `PoolExhausted`.
//!
//! # Lifecycle
//!
//! ```text
//! open ──pause──▶ paused ──resume──▶ open
//!   │                                  │
//!   └──────────────close───────────────┴──▶ closed
//! ```
//!
//! While paused or closed, acquisitions fail immediately and released contexts are destroyed
//! instead of recycled. A background reclaimer retires idle contexts above capacity and tears the
//! pool down after close.

use crate::config::PoolOptions;
use crate::db::codec::RowCodec;
use crate::db::context::ConnectionContext;
use crate::db::factory::{ConnectionFactory, UrlConnectionFactory};
use crate::db::reclaimer;
use crate::db::slots::{self, SlotPermit, ThreadHold};
use crate::db::sync::SyncContext;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, PoolStats};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Counters and the idle list, guarded by one lock.
pub(crate) struct PoolState {
    /// Most recently released last.
    pub idle: Vec<ConnectionContext>,
    pub active: usize,
    pub leaked: usize,
    pub slots_in_use: usize,
    pub paused: bool,
    pub closed: bool,
}

impl PoolState {
    pub fn check_open(&self) -> DbResult<()> {
        if self.closed {
            Err(DbError::PoolClosed)
        } else if self.paused {
            Err(DbError::pool_paused("the pool is being drained"))
        } else {
            Ok(())
        }
    }

    /// Take every idle context out of the pool.
    pub fn take_idle(&mut self) -> Vec<ConnectionContext> {
        let idle = std::mem::take(&mut self.idle);
        self.active -= idle.len();
        idle
    }
}

pub(crate) struct PoolShared {
    pub id: u64,
    write_factory: Arc<dyn ConnectionFactory>,
    read_factory: Option<Arc<dyn ConnectionFactory>>,
    codec: Arc<RowCodec>,
    options: PoolOptions,
    pub acquire_timeout: Duration,
    pub capacity: AtomicUsize,
    pub state: Mutex<PoolState>,
    pub slot_freed: Notify,
    drained: Notify,
    keeper_signal: Arc<Notify>,
    runtime: Handle,
    keeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolShared {
    /// Wake drain waiters if nothing is open any more.
    fn notify_if_drained(&self, state: &PoolState) {
        if state.active == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Idle contexts the reclaimer should destroy, and whether the pool is closed.
    ///
    /// Everything idle goes when the pool is paused or closed; otherwise the oldest idle
    /// contexts go while more than `capacity` are open.
    pub(crate) fn take_surplus(&self) -> (Vec<ConnectionContext>, bool) {
        let capacity = self.capacity.load(Ordering::Acquire);
        let mut state = self.state.lock();
        let surplus = if state.closed || state.paused {
            state.take_idle()
        } else {
            let mut surplus = Vec::new();
            while state.active > capacity && !state.idle.is_empty() {
                surplus.push(state.idle.remove(0));
                state.active -= 1;
            }
            surplus
        };
        self.notify_if_drained(&state);
        (surplus, state.closed)
    }

    pub(crate) fn over_capacity(&self) -> bool {
        self.state.lock().active > self.capacity.load(Ordering::Acquire)
    }

    /// Close a context in the background.
    fn destroy(&self, mut context: ConnectionContext) {
        let pool = self.id;
        self.runtime.spawn(async move {
            if let Err(e) = context.close().await {
                debug!(pool, context = %context.id(), error = %e, "Error closing context");
            }
        });
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        if let Some(keeper) = self.keeper.lock().take() {
            keeper.abort();
        }
    }
}

/// Releases a reserved `active` count unless the context was actually opened.
struct Reservation<'a> {
    shared: &'a PoolShared,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.lock();
            state.active -= 1;
            self.shared.notify_if_drained(&state);
        }
    }
}

/// Clears the pause flag when dropped.
struct PauseGuard {
    shared: Arc<PoolShared>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.shared.state.lock().paused = false;
        self.shared.slot_freed.notify_waiters();
        info!(pool = self.shared.id, "Pool resumed");
    }
}

/// Builder for [`Database`].
pub struct DatabaseBuilder {
    write_factory: Arc<dyn ConnectionFactory>,
    read_factory: Option<Arc<dyn ConnectionFactory>>,
    codec: RowCodec,
    options: PoolOptions,
}

impl DatabaseBuilder {
    /// Open read handles from a separate factory.
    pub fn read_factory(mut self, factory: impl ConnectionFactory) -> Self {
        self.read_factory = Some(Arc::new(factory));
        self
    }

    pub fn codec(mut self, codec: RowCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Create the pool and start its reclaimer. Must run inside a tokio runtime.
    pub fn build(self) -> DbResult<Database> {
        Database::from_parts(
            self.write_factory,
            self.read_factory,
            Arc::new(self.codec),
            self.options,
        )
    }
}

/// A bounded pool of [`ConnectionContext`]s.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct Database {
    shared: Arc<PoolShared>,
}

impl Database {
    pub fn builder(write_factory: impl ConnectionFactory) -> DatabaseBuilder {
        DatabaseBuilder {
            write_factory: Arc::new(write_factory),
            read_factory: None,
            codec: RowCodec::default(),
            options: PoolOptions::default(),
        }
    }

    /// Create a pool whose contexts share one handle for reads and writes.
    pub fn new(write_factory: impl ConnectionFactory, options: PoolOptions) -> DbResult<Self> {
        Self::builder(write_factory).options(options).build()
    }

    /// Create a pool with separate read and write handles.
    pub fn with_read_factory(
        write_factory: impl ConnectionFactory,
        read_factory: impl ConnectionFactory,
        options: PoolOptions,
    ) -> DbResult<Self> {
        Self::builder(write_factory)
            .read_factory(read_factory)
            .options(options)
            .build()
    }

    /// Create a pool for a database URL.
    pub fn connect(url: &str, options: PoolOptions) -> DbResult<Self> {
        Self::new(UrlConnectionFactory::new(url)?, options)
    }

    fn from_parts(
        write_factory: Arc<dyn ConnectionFactory>,
        read_factory: Option<Arc<dyn ConnectionFactory>>,
        codec: Arc<RowCodec>,
        options: PoolOptions,
    ) -> DbResult<Self> {
        options.validate().map_err(DbError::invalid_input)?;
        let runtime = Handle::try_current().map_err(|_| {
            DbError::internal("A pool must be created inside a tokio runtime")
        })?;
        let db_type = write_factory.database_type();
        let capacity = options.max_connections_or_default(db_type == DatabaseType::SQLite) as usize;
        let reclaim_interval = options.reclaim_interval_or_default();

        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            write_factory,
            read_factory,
            codec,
            acquire_timeout: options.acquire_timeout_or_default(),
            options,
            capacity: AtomicUsize::new(capacity),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: 0,
                leaked: 0,
                slots_in_use: 0,
                paused: false,
                closed: false,
            }),
            slot_freed: Notify::new(),
            drained: Notify::new(),
            keeper_signal: Arc::new(Notify::new()),
            runtime,
            keeper: Mutex::new(None),
        });

        let keeper = shared.runtime.spawn(reclaimer::run(
            Arc::downgrade(&shared),
            Arc::clone(&shared.keeper_signal),
            reclaim_interval,
        ));
        *shared.keeper.lock() = Some(keeper);

        info!(
            pool = shared.id,
            db_type = %db_type,
            max_connections = capacity,
            separate_reader = shared.read_factory.is_some(),
            "Pool created"
        );
        Ok(Self { shared })
    }

    /// A new pool with the same factories, codec and options.
    fn fresh(&self) -> DbResult<Self> {
        let mut options = self.shared.options.clone();
        options.max_connections = Some(self.capacity() as u32);
        Self::from_parts(
            Arc::clone(&self.shared.write_factory),
            self.shared.read_factory.clone(),
            Arc::clone(&self.shared.codec),
            options,
        )
    }

    pub fn database_type(&self) -> DatabaseType {
        self.shared.write_factory.database_type()
    }

    /// Drain timeout from the pool options, for callers of [`close`](Self::close) and
    /// [`close_all_contexts`](Self::close_all_contexts).
    pub fn drain_timeout(&self) -> Duration {
        self.shared.options.drain_timeout_or_default()
    }

    fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::Acquire)
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Acquire a context, waiting for a free slot if needed.
    ///
    /// The context returns to the pool when the guard is dropped. Only [`with_async`]
    /// (Self::with_async) callbacks are reentrant; holding a guard from this method and
    /// acquiring again from the same task waits for a slot like any other caller.
    pub async fn acquire_async(&self) -> DbResult<PooledContext> {
        let reentrant = slots::held_by_current_task(self.shared.id);
        self.acquire_inner(reentrant).await
    }

    /// Run `f` with a pooled context.
    ///
    /// The context goes back to the pool afterwards, or is destroyed if `f` left it unusable.
    /// Nested calls on the same pool from inside `f` are reentrant and never wait for a slot.
    pub async fn with_async<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ConnectionContext) -> BoxFuture<'c, DbResult<T>>,
    {
        let reentrant = slots::held_by_current_task(self.shared.id);
        let mut pooled = self.acquire_inner(reentrant).await?;
        slots::scope_held(self.shared.id, f(&mut *pooled)).await
    }

    /// Blocking variant of [`acquire_async`](Self::acquire_async).
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async context, like [`Handle::block_on`].
    pub fn acquire_sync(&self) -> DbResult<PooledContext> {
        let reentrant = slots::held_by_current_thread(self.shared.id);
        self.block_on(self.acquire_inner(reentrant))
    }

    /// Blocking variant of [`with_async`](Self::with_async).
    ///
    /// Nested `with_sync` calls on the same thread are reentrant.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async context, like [`Handle::block_on`].
    pub fn with_sync<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut SyncContext<'_>) -> DbResult<T>,
    {
        let mut pooled = self.acquire_sync()?;
        let _hold = ThreadHold::new(self.shared.id);
        let mut context = SyncContext::new(&mut *pooled, &self.shared.runtime);
        f(&mut context)
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.shared.runtime.block_on(fut)
    }

    async fn acquire_inner(&self, reentrant: bool) -> DbResult<PooledContext> {
        self.shared.state.lock().check_open()?;
        let slot = if reentrant {
            None
        } else {
            Some(slots::acquire_slot(&self.shared).await?)
        };
        let context = self.checkout().await?;
        Ok(PooledContext {
            pool: self.clone(),
            context: Some(context),
            slot,
        })
    }

    /// Pop the most recently used idle context, or open a new one if the ceiling allows.
    async fn checkout(&self) -> DbResult<ConnectionContext> {
        let reservation = {
            let mut state = self.shared.state.lock();
            state.check_open()?;
            if let Some(context) = state.idle.pop() {
                return Ok(context);
            }
            let capacity = self.capacity();
            if state.active >= capacity * 2 {
                return Err(DbError::pool_exhausted(state.active, capacity));
            }
            state.active += 1;
            Reservation {
                shared: &self.shared,
                armed: true,
            }
        };

        let context = ConnectionContext::open(
            &*self.shared.write_factory,
            self.shared.read_factory.as_deref(),
            Arc::clone(&self.shared.codec),
        )
        .await?;
        reservation.commit();
        debug!(pool = self.shared.id, context = %context.id(), "Opened new context");
        Ok(context)
    }

    /// Return a context to the idle list, or destroy it.
    fn release(&self, context: ConnectionContext) {
        let shared = &self.shared;
        let check = context.before_release();
        let mut state = shared.state.lock();

        match check {
            Err(e) => {
                state.active -= 1;
                state.leaked += 1;
                warn!(
                    pool = shared.id,
                    context = %context.id(),
                    error = %e,
                    active = state.active,
                    leaked = state.leaked,
                    "Context failed its release check; destroying it"
                );
                shared.notify_if_drained(&state);
                drop(state);
                shared.destroy(context);
            }
            Ok(()) if state.paused || state.closed => {
                state.active -= 1;
                shared.notify_if_drained(&state);
                drop(state);
                debug!(pool = shared.id, context = %context.id(), "Destroying context released while draining");
                shared.destroy(context);
            }
            Ok(()) => {
                state.idle.push(context);
                let surplus = state.active > self.capacity();
                drop(state);
                if surplus {
                    shared.keeper_signal.notify_one();
                }
            }
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Configured capacity; 0 while paused or closed.
    pub fn max_connections(&self) -> usize {
        let state = self.shared.state.lock();
        if state.paused || state.closed {
            0
        } else {
            self.capacity()
        }
    }

    /// Change the capacity.
    ///
    /// Growing takes effect immediately. Shrinking lets the reclaimer retire idle contexts
    /// down to the new capacity; contexts in use are not disturbed.
    pub fn set_max_connections(&self, max_connections: usize) -> DbResult<()> {
        if max_connections == 0 {
            return Err(DbError::invalid_input("max_connections must be greater than 0"));
        }
        let previous = self.shared.capacity.swap(max_connections, Ordering::AcqRel);
        info!(pool = self.shared.id, previous, max_connections, "Capacity changed");
        self.shared.slot_freed.notify_waiters();
        self.shared.keeper_signal.notify_one();
        Ok(())
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let max_connections = if state.paused || state.closed {
            0
        } else {
            self.capacity()
        };
        PoolStats {
            max_connections,
            active: state.active,
            idle: state.idle.len(),
            in_use: state.active - state.idle.len(),
            leaked: state.leaked,
            paused: state.paused,
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    // =========================================================================
    // Drain and close
    // =========================================================================

    /// Pause the pool, destroy idle contexts and wait up to `max_wait` for the rest.
    ///
    /// The pool stays paused until the returned guard is dropped. On timeout the guard is
    /// dropped here, so a failed drain leaves the pool usable.
    async fn pause_and_drain(&self, max_wait: Duration) -> DbResult<PauseGuard> {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            if state.paused {
                return Err(DbError::pool_paused("a drain is already in progress"));
            }
            state.paused = true;
            let idle = state.take_idle();
            self.shared.notify_if_drained(&state);
            idle
        };
        let guard = PauseGuard {
            shared: Arc::clone(&self.shared),
        };
        info!(pool = self.shared.id, idle = idle.len(), "Pool paused; draining");

        self.shared.slot_freed.notify_waiters();
        self.shared.keeper_signal.notify_one();
        close_contexts(self.shared.id, idle).await;

        self.wait_for_drain(max_wait).await?;
        Ok(guard)
    }

    async fn wait_for_drain(&self, max_wait: Duration) -> DbResult<()> {
        let started = Instant::now();
        let deadline = started + max_wait;
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let active = self.shared.state.lock().active;
            if active == 0 {
                debug!(pool = self.shared.id, "Pool drained");
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let active = self.shared.state.lock().active;
                if active == 0 {
                    return Ok(());
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(pool = self.shared.id, active, waited_ms, "Drain timed out");
                return Err(DbError::drain_timeout(active, waited_ms));
            }
        }
    }

    /// Drain the pool and resume it.
    ///
    /// New acquisitions fail with `PoolPaused` until every context has come back or `max_wait`
    /// elapsed. The pool is resumed either way.
    pub async fn close_all_contexts(&self, max_wait: Duration) -> DbResult<()> {
        let _guard = self.pause_and_drain(max_wait).await?;
        Ok(())
    }

    /// Drain the pool, then run `f` against a fresh private pool with the same factories.
    ///
    /// The original pool stays paused while `f` runs and resumes afterwards, whatever the
    /// outcome. The private pool is closed before returning.
    pub async fn close_all_contexts_with<T, F, Fut>(&self, max_wait: Duration, f: F) -> DbResult<T>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let _guard = self.pause_and_drain(max_wait).await?;
        let exclusive = self.fresh()?;
        let result = f(exclusive.clone()).await;
        let closed = exclusive.close(max_wait).await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(pool = self.shared.id, error = %close_err, "Failed to close exclusive pool");
                }
                Err(e)
            }
        }
    }

    /// Close the pool. Idempotent.
    ///
    /// With a zero `wait` the reclaimer tears the pool down in the background. Otherwise idle
    /// contexts are closed here and the call waits up to `wait` for checked-out contexts to come
    /// back, failing with `DrainTimeout` if they do not.
    pub async fn close(&self, wait: Duration) -> DbResult<()> {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if wait.is_zero() {
                Vec::new()
            } else {
                let idle = state.take_idle();
                self.shared.notify_if_drained(&state);
                idle
            }
        };
        info!(pool = self.shared.id, "Closing pool");
        self.shared.slot_freed.notify_waiters();
        self.shared.keeper_signal.notify_one();

        if wait.is_zero() {
            return Ok(());
        }
        close_contexts(self.shared.id, idle).await;
        self.wait_for_drain(wait).await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.shared.id)
            .field("db_type", &self.database_type())
            .field("stats", &self.stats())
            .finish()
    }
}

pub(crate) async fn close_contexts(pool: u64, contexts: Vec<ConnectionContext>) {
    for mut context in contexts {
        if let Err(e) = context.close().await {
            debug!(pool, context = %context.id(), error = %e, "Error closing context");
        }
    }
}

/// A context checked out of a [`Database`]. Returned to the pool on drop.
pub struct PooledContext {
    pool: Database,
    context: Option<ConnectionContext>,
    slot: Option<SlotPermit>,
}

impl PooledContext {
    /// True when this acquisition skipped the slot wait.
    pub fn is_reentrant(&self) -> bool {
        self.slot.is_none()
    }
}

impl Deref for PooledContext {
    type Target = ConnectionContext;

    fn deref(&self) -> &ConnectionContext {
        match &self.context {
            Some(context) => context,
            None => unreachable!("context is only taken on drop"),
        }
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut ConnectionContext {
        match &mut self.context {
            Some(context) => context,
            None => unreachable!("context is only taken on drop"),
        }
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
        // The slot is freed after the context is back in the idle list.
        self.slot.take();
    }
}

impl std::fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledContext")
            .field("context", &self.context)
            .field("reentrant", &self.slot.is_none())
            .finish()
    }
}
