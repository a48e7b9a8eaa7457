//! Integration tests for connection contexts.
//!
//! Tests verify that:
//! - Nested savepoints roll back only their own work
//! - Statements are cached per handle, except writes inside a transaction
//! - Multi-statement scripts honour `-- begin block --` delimiters
//! - Row helpers map results into records and scalars
//! - Reads go to the read handle and writes to the write handle

use dbkeeper::config::PoolOptions;
use dbkeeper::db::{Database, Row, UrlConnectionFactory};
use dbkeeper::error::DbError;
use dbkeeper::sql_params;
use tempfile::NamedTempFile;

fn sqlite_url(file: &NamedTempFile) -> String {
    format!("sqlite:{}", file.path().display())
}

/// Create a pool with an `items` table.
async fn setup_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::connect(&sqlite_url(&temp_file), PoolOptions::default()).unwrap();
    db.with_async(|ctx| {
        Box::pin(async move {
            ctx.execute_update(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL)",
                &[],
            )
            .await
        })
    })
    .await
    .unwrap();
    (db, temp_file)
}

async fn item_names(db: &Database) -> Vec<String> {
    db.with_async(|ctx| {
        Box::pin(async move { ctx.query_column("SELECT name FROM items ORDER BY id", &[]).await })
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inner_savepoint_failure_keeps_outer_work() {
    let (db, _file) = setup_db().await;

    db.with_async(|ctx| {
        Box::pin(async move {
            ctx.with_savepoint(|ctx| {
                Box::pin(async move {
                    ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params!["first"])
                        .await?;
                    assert_eq!(ctx.nesting_depth(), 1);

                    let inner: Result<(), DbError> = ctx
                        .with_savepoint(|ctx| {
                            Box::pin(async move {
                                assert_eq!(ctx.nesting_depth(), 2);
                                ctx.execute_update(
                                    "INSERT INTO items (name) VALUES (?)",
                                    &sql_params!["discarded"],
                                )
                                .await?;
                                Err(DbError::internal("inner failure"))
                            })
                        })
                        .await;
                    assert!(inner.is_err());
                    assert_eq!(ctx.nesting_depth(), 1);

                    ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params!["second"])
                        .await?;
                    Ok(())
                })
            })
            .await?;
            assert!(!ctx.is_in_transaction());
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(item_names(&db).await, vec!["first", "second"]);
    assert_eq!(db.stats().leaked, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outer_failure_rolls_back_everything() {
    let (db, _file) = setup_db().await;

    let result: Result<(), DbError> = db
        .with_async(|ctx| {
            Box::pin(async move {
                ctx.transaction(|ctx| {
                    Box::pin(async move {
                        ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params!["a"])
                            .await?;
                        ctx.with_savepoint(|ctx| {
                            Box::pin(async move {
                                ctx.execute_update(
                                    "INSERT INTO items (name) VALUES (?)",
                                    &sql_params!["b"],
                                )
                                .await
                            })
                        })
                        .await?;
                        // NOT NULL violation
                        ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params![None::<String>])
                            .await?;
                        Ok(())
                    })
                })
                .await
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::Database { .. })));
    assert!(item_names(&db).await.is_empty());
    assert_eq!(db.stats().leaked, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_savepoint_left_open_is_unwound() {
    let (db, _file) = setup_db().await;

    db.with_async(|ctx| {
        Box::pin(async move {
            ctx.with_savepoint(|ctx| {
                Box::pin(async move {
                    ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params!["kept"])
                        .await?;
                    ctx.begin_savepoint().await?;
                    ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params!["dangling"])
                        .await?;
                    Ok(())
                })
            })
            .await?;
            assert_eq!(ctx.nesting_depth(), 0);
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(item_names(&db).await, vec!["kept"]);
    assert_eq!(db.stats().leaked, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_release_without_savepoint_is_rejected() {
    let (db, _file) = setup_db().await;
    let mut ctx = db.acquire_async().await.unwrap();
    assert!(matches!(
        ctx.release_savepoint().await,
        Err(DbError::InvalidInput { .. })
    ));
    assert!(matches!(
        ctx.rollback_savepoint().await,
        Err(DbError::InvalidInput { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_statement_cache() {
    let (db, _file) = setup_db().await;
    let mut ctx = db.acquire_async().await.unwrap();
    // Table creation ran unprepared.
    assert_eq!(ctx.cached_statement_counts(), (0, 0));

    for i in 0..3i64 {
        let next: Vec<i64> = ctx.query_column("SELECT ? + 1", &sql_params![i]).await.unwrap();
        assert_eq!(next, vec![i + 1]);
    }
    assert_eq!(ctx.cached_statement_counts(), (1, 0));

    for name in ["x", "y"] {
        ctx.execute_update("INSERT INTO items (name) VALUES (?)", &sql_params![name])
            .await
            .unwrap();
    }
    assert_eq!(ctx.cached_statement_counts(), (1, 1));

    // Statements without parameters run raw and are not cached.
    let deleted = ctx
        .execute_update("DELETE FROM items WHERE name = 'none'", &[])
        .await
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(ctx.cached_statement_counts(), (1, 1));

    // Writes inside a transaction are not cached.
    ctx.begin_savepoint().await.unwrap();
    ctx.execute_update("UPDATE items SET price = ? WHERE name = ?", &sql_params![1.5, "x"])
        .await
        .unwrap();
    ctx.release_savepoint().await.unwrap();
    assert_eq!(ctx.cached_statement_counts(), (1, 1));

    let price: Option<(String, f64)> = ctx
        .query_one("SELECT name, price FROM items WHERE name = ?", &sql_params!["x"])
        .await
        .unwrap();
    assert_eq!(price, Some(("x".to_string(), 1.5)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_all_with_block() {
    let (db, _file) = setup_db().await;
    let script = "\
CREATE TABLE audit (msg TEXT);
-- begin block --
CREATE TRIGGER items_audit AFTER INSERT ON items
BEGIN
    INSERT INTO audit (msg) VALUES ('added ' || NEW.name);
END
-- end block --
INSERT INTO items (name) VALUES ('apple');
INSERT INTO items (name) VALUES ('pear');
";

    let audit: Vec<String> = db
        .with_async(move |ctx| {
            Box::pin(async move {
                let executed = ctx.execute_all(script).await?;
                assert_eq!(executed, 4);
                ctx.query_column("SELECT msg FROM audit ORDER BY rowid", &[]).await
            })
        })
        .await
        .unwrap();
    assert_eq!(audit, vec!["added apple", "added pear"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_all_stops_at_first_error() {
    let (db, _file) = setup_db().await;
    let result = db
        .with_async(|ctx| {
            Box::pin(async move {
                ctx.execute_all(
                    "INSERT INTO items (name) VALUES ('one');\nINSERT INTO missing VALUES (1);\nINSERT INTO items (name) VALUES ('three');\n",
                )
                .await
            })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(item_names(&db).await, vec!["one"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_row_helpers() {
    let (db, _file) = setup_db().await;
    let mut ctx = db.acquire_async().await.unwrap();
    ctx.execute_all(
        "INSERT INTO items (name, price) VALUES ('apple', 1.25);\n\
         INSERT INTO items (name, price) VALUES ('pear', NULL);\n",
    )
    .await
    .unwrap();

    let inserted = ctx
        .update_query_row(
            "INSERT INTO items (name, price) VALUES (?, ?) RETURNING id",
            &sql_params!["plum", 3.0],
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inserted.get::<i64>("id").unwrap(), 3);

    let rows: Vec<(i64, String, Option<f64>)> = ctx
        .query_all("SELECT id, name, price FROM items ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows[0], (1, "apple".to_string(), Some(1.25)));
    assert_eq!(rows[1].2, None);

    let row: Row = ctx
        .query_row("SELECT name, price FROM items WHERE id = ?", &sql_params![2])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<String>("name").unwrap(), "pear");
    assert!(row.get::<f64>("price").is_err());
    assert!(matches!(
        row.get::<String>("nope"),
        Err(DbError::RowMapping { .. })
    ));

    let none: Option<Row> = ctx
        .query_row("SELECT name FROM items WHERE id = ?", &sql_params![99])
        .await
        .unwrap();
    assert!(none.is_none());

    let mut seen = Vec::new();
    let count = ctx
        .query_each("SELECT name FROM items ORDER BY id", &[], |row| {
            seen.push(row.get::<String>(0usize)?);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(seen, vec!["apple", "pear", "plum"]);

    let err = ctx
        .query_each("SELECT name FROM items ORDER BY id", &[], |_| {
            Err(DbError::internal("stop"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Internal { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_operation_runs_inside_callbacks() {
    let (db, _file) = setup_db().await;

    let (count, names, visited) = db
        .with_async(|ctx| {
            Box::pin(async move {
                ctx.transaction(|ctx| {
                    Box::pin(async move {
                        ctx.execute_update(
                            "INSERT INTO items (name, price) VALUES (?, ?)",
                            &sql_params!["apple", 1.0],
                        )
                        .await?;
                        ctx.execute_update("INSERT INTO items (name) VALUES ('pear')", &[])
                            .await?;
                        ctx.update_query_row(
                            "INSERT INTO items (name) VALUES (?) RETURNING id",
                            &sql_params!["plum"],
                        )
                        .await?;
                        ctx.execute_all("UPDATE items SET price = 2.0 WHERE name = 'pear';\nDELETE FROM items WHERE name = 'none';\n")
                            .await?;
                        ctx.with_savepoint(|ctx| {
                            Box::pin(async move {
                                ctx.execute_query("SELECT * FROM items", &[]).await?;
                                ctx.query_row("SELECT name FROM items WHERE id = ?", &sql_params![1])
                                    .await?;
                                Ok(())
                            })
                        })
                        .await
                    })
                })
                .await?;

                let count: Option<(i64,)> = ctx.query_one("SELECT count(*) FROM items", &[]).await?;
                let names: Vec<(String,)> =
                    ctx.query_all("SELECT name FROM items ORDER BY id", &[]).await?;
                let mut visited = 0;
                ctx.query_each("SELECT name FROM items", &[], |_| {
                    visited += 1;
                    Ok(())
                })
                .await?;
                Ok((count, names, visited))
            })
        })
        .await
        .unwrap();

    assert_eq!(count, Some((3,)));
    assert_eq!(
        names.into_iter().map(|(name,)| name).collect::<Vec<_>>(),
        vec!["apple", "pear", "plum"]
    );
    assert_eq!(visited, 3);
    assert_eq!(db.stats().leaked, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_separate_read_handle() {
    let temp_file = NamedTempFile::new().unwrap();
    let url = sqlite_url(&temp_file);
    let db = Database::with_read_factory(
        UrlConnectionFactory::new(&url).unwrap(),
        UrlConnectionFactory::new(&url).unwrap(),
        PoolOptions::default(),
    )
    .unwrap();

    let mut ctx = db.acquire_async().await.unwrap();
    ctx.execute_update("CREATE TABLE notes (body TEXT)", &[]).await.unwrap();
    ctx.execute_update("INSERT INTO notes (body) VALUES (?)", &sql_params!["hello"])
        .await
        .unwrap();

    // Committed on the write handle, visible on the read handle.
    let bodies: Vec<String> = ctx.query_column("SELECT body FROM notes", &[]).await.unwrap();
    assert_eq!(bodies, vec!["hello"]);
    assert_eq!(ctx.cached_statement_counts(), (1, 1));

    // Inside a transaction reads use the write handle and see uncommitted work.
    ctx.begin_savepoint().await.unwrap();
    ctx.execute_update("INSERT INTO notes (body) VALUES (?)", &sql_params!["draft"])
        .await
        .unwrap();
    let count: Vec<i64> = ctx.query_column("SELECT count(*) FROM notes", &[]).await.unwrap();
    assert_eq!(count, vec![2]);
    ctx.rollback_savepoint().await.unwrap();

    let count: Vec<i64> = ctx.query_column("SELECT count(*) FROM notes", &[]).await.unwrap();
    assert_eq!(count, vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_context_rejects_work() {
    let (db, _file) = setup_db().await;
    let mut ctx = db.acquire_async().await.unwrap();
    ctx.close().await.unwrap();
    ctx.close().await.unwrap();
    assert!(ctx.is_closed());
    assert!(matches!(
        ctx.execute_query("SELECT 1", &[]).await,
        Err(DbError::ContextClosed { .. })
    ));
    drop(ctx);
    // A closed context is not returned to the idle list.
    assert_eq!(db.stats().idle, 0);
    assert_eq!(db.stats().leaked, 1);
}
