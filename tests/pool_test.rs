//! Integration tests for the connection pool.
//!
//! Tests verify that:
//! - Contexts are reused and never counted as leaked on a clean release
//! - Concurrent callers never exceed the configured capacity
//! - Contexts released inside a transaction or mid-operation are counted as leaked
//! - Drain, pause, resume and close behave as documented
//! - The reclaimer shrinks the pool after a capacity change
//! - Nested acquisitions from inside a callback do not deadlock

use dbkeeper::config::PoolOptions;
use dbkeeper::db::Database;
use dbkeeper::error::DbError;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Create a pool over a fresh SQLite file. The file lives as long as the returned handle.
fn setup_db(options: PoolOptions) -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}", temp_file.path().display());
    let db = Database::connect(&url, options).unwrap();
    (db, temp_file)
}

fn options(max_connections: u32) -> PoolOptions {
    PoolOptions {
        max_connections: Some(max_connections),
        acquire_timeout_ms: Some(2_000),
        reclaim_interval_ms: Some(50),
        drain_timeout_secs: None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_use_reuses_one_context() {
    let (db, _file) = setup_db(options(2));

    for i in 0..10i64 {
        let value: Vec<i64> = db
            .with_async(move |ctx| Box::pin(async move { ctx.query_column("SELECT ?", &[i.into()]).await }))
            .await
            .unwrap();
        assert_eq!(value, vec![i]);
    }

    let stats = db.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.leaked, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_respect_capacity() {
    let (db, _file) = setup_db(options(3));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let db = db.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            db.with_async(move |ctx| {
                Box::pin(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let one: Vec<i64> = ctx.query_column("SELECT 1", &[]).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(one)
                })
            })
            .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), vec![1]);
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = db.stats();
    assert!(stats.active <= 3);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.leaked, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_error_does_not_leak() {
    let (db, _file) = setup_db(options(2));

    let result: Result<(), DbError> = db
        .with_async(|ctx| {
            Box::pin(async move {
                ctx.execute_query("SELECT * FROM no_such_table", &[]).await?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(result, Err(DbError::Database { .. })));

    let stats = db.stats();
    assert_eq!(stats.leaked, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_transaction_on_release_is_a_leak() {
    let (db, _file) = setup_db(options(2));

    let result: Result<(), DbError> = db
        .with_async(|ctx| {
            Box::pin(async move {
                ctx.begin_savepoint().await?;
                Err(DbError::internal("gave up halfway"))
            })
        })
        .await;
    assert!(result.is_err());

    let stats = db.stats();
    assert_eq!(stats.leaked, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 0);
    // Capacity does not grow to compensate.
    assert_eq!(db.max_connections(), 2);

    // The pool keeps working with a fresh context.
    let value: Vec<i64> = db
        .with_async(|ctx| Box::pin(async move { ctx.query_column("SELECT 5", &[]).await }))
        .await
        .unwrap();
    assert_eq!(value, vec![5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_mid_query_counts_as_leak() {
    let (db, _file) = setup_db(options(2));

    let task_db = db.clone();
    let handle = tokio::spawn(async move {
        task_db
            .with_async(|ctx| {
                Box::pin(async move {
                    ctx.query_column::<i64>(
                        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 20000000) \
                         SELECT count(*) FROM c",
                        &[],
                    )
                    .await
                })
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    let stats = db.stats();
    assert_eq!(stats.leaked, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_cancellation_keeps_counts_consistent() {
    let (db, _file) = setup_db(options(2));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let db = db.clone();
        let hold_ms = rand::thread_rng().gen_range(0..30);
        handles.push(tokio::spawn(async move {
            db.with_async(move |ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    ctx.query_column::<i64>("SELECT 1", &[]).await
                })
            })
            .await
        }));
    }
    for handle in &handles {
        if rand::thread_rng().gen_bool(0.5) {
            handle.abort();
        }
        tokio::time::sleep(Duration::from_millis(rand::thread_rng().gen_range(0..5))).await;
    }
    for handle in handles {
        let _ = handle.await;
    }

    let stats = db.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.active, stats.idle);
    assert!(stats.active <= 4);

    // Every slot came back: two contexts can be held at once.
    let a = db.acquire_async().await.unwrap();
    let b = db.acquire_async().await.unwrap();
    drop((a, b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhaustion_after_acquire_timeout() {
    let mut opts = options(1);
    opts.acquire_timeout_ms = Some(100);
    let (db, _file) = setup_db(opts);

    let held = db.acquire_async().await.unwrap();
    let err = db.acquire_async().await.unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { capacity: 1, .. }));
    assert!(err.is_retryable());

    drop(held);
    db.acquire_async().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nested_with_async_does_not_deadlock() {
    let mut opts = options(1);
    opts.acquire_timeout_ms = Some(500);
    let (db, _file) = setup_db(opts);

    let inner_db = db.clone();
    let (outer, inner): (Vec<i64>, Vec<i64>) = db
        .with_async(move |ctx| {
            Box::pin(async move {
                let outer = ctx.query_column("SELECT 1", &[]).await?;
                let inner = inner_db
                    .with_async(|ctx| Box::pin(async move { ctx.query_column("SELECT 2", &[]).await }))
                    .await?;
                Ok((outer, inner))
            })
        })
        .await
        .unwrap();
    assert_eq!(outer, vec![1]);
    assert_eq!(inner, vec![2]);

    // The inner call opened a second context; the reclaimer may already have retired it.
    let stats = db.stats();
    assert!(stats.active <= 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.leaked, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_rejects_new_work_until_done() {
    let (db, _file) = setup_db(options(2));
    let held = db.acquire_async().await.unwrap();

    let drain_db = db.clone();
    let drain = tokio::spawn(async move {
        drain_db
            .close_all_contexts(Duration::from_secs(5))
            .await
    });
    assert!(wait_until(|| db.is_paused()).await);

    let err = db.acquire_async().await.unwrap_err();
    assert!(matches!(err, DbError::PoolPaused { .. }));
    assert_eq!(db.max_connections(), 0);

    drop(held);
    drain.await.unwrap().unwrap();

    assert!(!db.is_paused());
    let stats = db.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.leaked, 0);
    assert_eq!(db.max_connections(), 2);
    db.acquire_async().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_timeout_resumes_pool() {
    let (db, _file) = setup_db(options(2));
    let held = db.acquire_async().await.unwrap();

    let err = db
        .close_all_contexts(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DrainTimeout { active: 1, .. }));
    assert!(!db.is_paused());

    // The held context is still usable and the pool accepts work again.
    drop(held);
    db.acquire_async().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_is_idempotent() {
    let (db, _file) = setup_db(options(2));
    db.with_async(|ctx| Box::pin(async move { ctx.execute_update("CREATE TABLE t (x INTEGER)", &[]).await }))
        .await
        .unwrap();

    db.close(Duration::from_secs(1)).await.unwrap();
    db.close(Duration::from_secs(1)).await.unwrap();
    db.close(Duration::ZERO).await.unwrap();

    assert!(db.is_closed());
    let stats = db.stats();
    assert!(stats.closed);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.max_connections, 0);
    assert!(matches!(
        db.acquire_async().await.unwrap_err(),
        DbError::PoolClosed
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reclaimer_shrinks_after_capacity_change() {
    let (db, _file) = setup_db(options(4));

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(db.acquire_async().await.unwrap());
    }
    drop(held);
    assert_eq!(db.stats().idle, 4);

    db.set_max_connections(1).unwrap();
    assert!(wait_until(|| db.stats().active <= 1).await);
    assert_eq!(db.stats().leaked, 0);
    assert!(db.set_max_connections(0).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_timeout_comes_from_options() {
    let (db, _file) = setup_db(options(2));
    assert_eq!(db.drain_timeout(), Duration::from_secs(180));

    let mut opts = options(2);
    opts.drain_timeout_secs = Some(3);
    let (db, _file) = setup_db(opts);
    assert_eq!(db.drain_timeout(), Duration::from_secs(3));
    db.close(db.drain_timeout()).await.unwrap();
}
