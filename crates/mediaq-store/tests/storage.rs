//! End-to-end storage tests against file-backed databases.

#![allow(missing_docs, unused_results)]

use std::time::Duration;

use assert_matches::assert_matches;
use tokio::time::timeout;

use mediaq_store::batch::{BatchOptions, batch_insert};
use mediaq_store::{
    ConfigRepo, MediaType, MigrationManager, QueueItemPatch, QueueRepo, QueueStatus, StorageConfig,
    StorageContext, StorageError, Value,
};

fn file_config(dir: &tempfile::TempDir) -> StorageConfig {
    StorageConfig {
        max_connections: 4,
        acquire_timeout_ms: 2_000,
        ..StorageConfig::file(dir.path().join("db").join("mediaq.db"))
    }
}

async fn open(dir: &tempfile::TempDir) -> StorageContext {
    StorageContext::open(file_config(dir)).await.unwrap()
}

#[tokio::test]
async fn pool_never_exceeds_max_and_blocks_excess_callers() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = StorageContext::open(StorageConfig {
        max_connections: 2,
        acquire_timeout_ms: 5_000,
        ..file_config(&dir)
    })
    .await
    .unwrap();

    let a = ctx.acquire().await.unwrap();
    let b = ctx.acquire().await.unwrap();
    assert_eq!(ctx.stats().total, 2);
    assert_eq!(ctx.stats().active, 2);

    let waiter = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.acquire().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(ctx.stats().waiting, 1);

    let released_id = a.id();
    drop(a);
    let handed = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(handed, released_id);
    assert_eq!(ctx.stats().total, 2);
    drop(b);
    ctx.shutdown();
}

#[tokio::test]
async fn acquire_times_out_when_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = StorageContext::open(StorageConfig {
        max_connections: 1,
        acquire_timeout_ms: 100,
        ..file_config(&dir)
    })
    .await
    .unwrap();
    let _held = ctx.acquire().await.unwrap();
    let err = ctx.acquire().await.unwrap_err();
    assert_matches!(err, StorageError::PoolTimeout { .. });
    assert!(err.is_retryable());
}

#[tokio::test]
async fn concurrent_writers_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir).await;

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..25 {
                ctx.with_connection(move |conn| {
                    QueueRepo::create(
                        conn,
                        &QueueItemPatch::new_item(MediaType::Movie, format!("w{worker}-{n}")),
                    )
                })
                .await
                .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let total = ctx.with_connection(QueueRepo::count).await.unwrap();
    assert_eq!(total, 200);
    assert!(ctx.stats().total <= 4);
}

#[tokio::test]
async fn transaction_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir).await;

    let result: Result<(), StorageError> = ctx
        .with_transaction(|conn| {
            QueueRepo::create(conn, &QueueItemPatch::new_item(MediaType::Movie, "kept?"))?;
            ConfigRepo::set_value(conn, "last_added", "kept?")?;
            Err(StorageError::InvalidConfig("validation failed".into()))
        })
        .await;
    assert_matches!(result, Err(StorageError::InvalidConfig(_)));

    let (items, value) = ctx
        .with_connection(|conn| {
            Ok::<_, StorageError>((QueueRepo::count(conn)?, ConfigRepo::get_value(conn, "last_added")?))
        })
        .await
        .unwrap();
    assert_eq!(items, 0);
    assert!(value.is_none());

    ctx.with_transaction(|conn| {
        QueueRepo::create(conn, &QueueItemPatch::new_item(MediaType::Movie, "kept"))?;
        ConfigRepo::set_value(conn, "last_added", "kept")
    })
    .await
    .unwrap();
    assert_eq!(ctx.with_connection(QueueRepo::count).await.unwrap(), 1);
}

#[tokio::test]
async fn repository_round_trip_update_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir).await;

    ctx.with_connection(|conn| {
        let created = QueueRepo::create(
            conn,
            &QueueItemPatch::new_item(MediaType::Tv, "Severance")
                .tmdb_id(95_396)
                .episode(1, 1),
        )?;
        let fetched = QueueRepo::get(conn, created.id)?.unwrap();
        assert_eq!(fetched, created);

        let patch = QueueItemPatch {
            status: Some(QueueStatus::InProgress),
            ..QueueItemPatch::default()
        };
        let updated = QueueRepo::update(conn, created.id, &patch)?;
        assert_eq!(updated.status, QueueStatus::InProgress);
        assert_eq!(updated.name, "Severance");
        assert_eq!(updated.episode, Some(1));

        QueueRepo::delete(conn, created.id)?;
        assert!(QueueRepo::get(conn, created.id)?.is_none());
        assert_matches!(QueueRepo::delete(conn, created.id), Err(StorageError::NotFound { .. }));
        Ok::<_, StorageError>(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn reopening_applies_no_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let first = open(&dir).await;
    first.shutdown();

    let second = open(&dir).await;
    let pending = second
        .with_connection(|conn| {
            let manager = MigrationManager::with_builtin();
            Ok::<_, StorageError>((manager.pending(conn)?.len(), manager.migrate(conn)?))
        })
        .await
        .unwrap();
    assert_eq!(pending, (0, Vec::new()));
}

#[tokio::test]
async fn failing_chunk_rolls_back_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir).await;

    let rows: Vec<usize> = (0..1_000).collect();
    let err = ctx
        .with_connection(move |conn| {
            batch_insert(
                conn,
                "queue",
                &rows,
                |n| {
                    let name = if *n == 550 { Value::Null } else { Value::Text(format!("movie {n}")) };
                    let now = Value::Text("2026-01-01T00:00:00.000000Z".into());
                    vec![
                        ("type", Value::Text("movie".into())),
                        ("name", name),
                        ("created_at", now.clone()),
                        ("updated_at", now),
                    ]
                },
                &BatchOptions::default(),
            )
        })
        .await
        .unwrap_err();
    assert!(err.is_constraint_violation());
    assert_eq!(ctx.with_connection(QueueRepo::count).await.unwrap(), 0);
}

#[tokio::test]
async fn get_values_maps_absent_keys_to_none() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir).await;
    let values = ctx
        .with_connection(|conn| {
            ConfigRepo::set_values(conn, &[("a", "1"), ("b", "2")])?;
            ConfigRepo::get_values(conn, &["a", "b", "c"])
        })
        .await
        .unwrap();
    assert_eq!(values["a"].as_deref(), Some("1"));
    assert_eq!(values["b"].as_deref(), Some("2"));
    assert_eq!(values["c"], None);
}

#[tokio::test]
async fn diagnostics_see_pooled_queries() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(&dir).await;
    for _ in 0..3 {
        ctx.with_connection(|conn| QueueRepo::find_by_status(conn, QueueStatus::Completed))
            .await
            .unwrap();
    }
    let stats = ctx.optimizer().unwrap().get_performance_stats();
    assert!(stats.most_frequent.iter().any(|p| {
        p.normalized.starts_with("SELECT * FROM queue WHERE status = ?") && p.count == 3
    }));

    let plan = ctx
        .with_connection({
            let optimizer = ctx.optimizer().unwrap().clone();
            move |conn| {
                optimizer.get_query_plan(
                    conn,
                    "SELECT * FROM queue WHERE status = ?",
                    &[Value::Text("completed".into())],
                )
            }
        })
        .await
        .unwrap();
    assert!(plan.iter().any(|step| step.detail.contains("idx_queue_status")));
}
