//! Integration tests for blocking pool access.
//!
//! The pool runs on a tokio runtime owned by the test; the test thread itself is outside the
//! runtime, like any synchronous caller.

use dbkeeper::config::PoolOptions;
use dbkeeper::db::Database;
use dbkeeper::error::DbError;
use dbkeeper::sql_params;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::runtime::Runtime;

// Field order is drop order: the pool goes before its runtime.
struct Fixture {
    db: Database,
    runtime: Runtime,
    _file: NamedTempFile,
}

fn setup(max_connections: u32) -> Fixture {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let file = NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}", file.path().display());
    let db = {
        let _guard = runtime.enter();
        Database::connect(
            &url,
            PoolOptions {
                max_connections: Some(max_connections),
                acquire_timeout_ms: Some(500),
                ..PoolOptions::default()
            },
        )
        .unwrap()
    };
    db.with_sync(|ctx| {
        ctx.execute_update("CREATE TABLE counters (name TEXT PRIMARY KEY, hits INTEGER NOT NULL)", &[])
    })
    .unwrap();
    Fixture {
        db,
        runtime,
        _file: file,
    }
}

#[test]
fn test_with_sync_round_trip() {
    let f = setup(2);

    let hits: Vec<i64> = f
        .db
        .with_sync(|ctx| {
            ctx.execute_update(
                "INSERT INTO counters (name, hits) VALUES (?, ?)",
                &sql_params!["home", 1],
            )?;
            ctx.execute_update("UPDATE counters SET hits = hits + 1 WHERE name = ?", &sql_params!["home"])?;
            ctx.query_column("SELECT hits FROM counters WHERE name = ?", &sql_params!["home"])
        })
        .unwrap();
    assert_eq!(hits, vec![2]);

    let stats = f.db.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.leaked, 0);
}

#[test]
fn test_sync_savepoints() {
    let f = setup(2);

    f.db.with_sync(|ctx| {
        ctx.transaction(|ctx| {
            ctx.execute_update("INSERT INTO counters VALUES (?, ?)", &sql_params!["a", 1])?;
            let inner: Result<(), DbError> = ctx.with_savepoint(|ctx| {
                ctx.execute_update("INSERT INTO counters VALUES (?, ?)", &sql_params!["b", 1])?;
                // duplicate key
                ctx.execute_update("INSERT INTO counters VALUES (?, ?)", &sql_params!["a", 9])?;
                Ok(())
            });
            assert!(matches!(inner, Err(DbError::Database { .. })));
            assert_eq!(ctx.nesting_depth(), 1);
            Ok(())
        })
    })
    .unwrap();

    let names: Vec<String> = f
        .db
        .with_sync(|ctx| ctx.query_column("SELECT name FROM counters ORDER BY name", &[]))
        .unwrap();
    assert_eq!(names, vec!["a"]);
}

#[test]
fn test_nested_with_sync_is_reentrant() {
    let f = setup(1);

    let total: i64 = f
        .db
        .with_sync(|outer| {
            let one: Vec<i64> = outer.query_column("SELECT 1", &[])?;
            let two: Vec<i64> = f.db.with_sync(|inner| inner.query_column("SELECT 2", &[]))?;
            Ok(one[0] + two[0])
        })
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(f.db.stats().leaked, 0);
}

#[test]
fn test_acquire_sync_guard_returns_context() {
    let f = setup(1);

    {
        let mut ctx = f.db.acquire_sync().unwrap();
        assert!(!ctx.is_reentrant());
        f.runtime
            .block_on(ctx.execute_update("INSERT INTO counters VALUES (?, ?)", &sql_params!["x", 0]))
            .unwrap();
        assert_eq!(f.db.stats().in_use, 1);

        // The only slot is taken.
        let err = f.db.acquire_sync().unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
    }

    let stats = f.db.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[test]
fn test_sync_transaction_left_open_is_a_leak() {
    let f = setup(2);

    f.db.with_sync(|ctx| ctx.begin_savepoint()).unwrap();

    let stats = f.db.stats();
    assert_eq!(stats.leaked, 1);
    assert_eq!(stats.active, 0);
}

#[test]
fn test_sync_and_async_callers_share_the_pool() {
    let f = setup(2);

    let tasks: Vec<_> = (0..8)
        .map(|i: i64| {
            let db = f.db.clone();
            f.runtime.spawn(async move {
                db.with_async(move |ctx| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        ctx.query_column::<i64>("SELECT ?", &sql_params![i]).await
                    })
                })
                .await
            })
        })
        .collect();

    for i in 0..8i64 {
        let value: Vec<i64> = f
            .db
            .with_sync(|ctx| ctx.query_column("SELECT ? * 10", &sql_params![i]))
            .unwrap();
        assert_eq!(value, vec![i * 10]);
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let value = f.runtime.block_on(task).unwrap().unwrap();
        assert_eq!(value, vec![i as i64]);
    }

    let stats = f.db.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.leaked, 0);
    assert!(stats.active <= 4);
}
