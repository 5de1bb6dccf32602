//! Integration tests for database migrations and connection pooling.
//!
//! Each test creates a unique temporary database inside a shared
//! containerized PostgreSQL instance (via testcontainers), runs
//! migrations, and drops it on completion so tests are fully isolated.

use conductor_db::config::DbConfig;
use conductor_db::pool;

use conductor_test_utils::{create_test_db, drop_test_db, pg_url};

/// Expected tables created by the migrations.
const EXPECTED_TABLES: &[&str] = &[
    "activity_log",
    "checkpoints",
    "corrections",
    "evaluations",
    "reviews",
    "subtask_dependencies",
    "subtasks",
    "tasks",
    "workers",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (temp_pool, db_name) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(&temp_pool)
    .await
    .expect("should list tables");

    let tables: Vec<&str> = rows.iter().map(|(name,)| name.as_str()).collect();
    for expected in EXPECTED_TABLES {
        assert!(
            tables.contains(expected),
            "missing table {expected:?}; got {tables:?}"
        );
    }

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (temp_pool, db_name) = create_test_db().await;

    // Re-running against an already-migrated database is a no-op.
    pool::run_migrations(&temp_pool)
        .await
        .expect("second run should succeed");

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn prepare_database_creates_and_migrates() {
    let base_url = pg_url().await;
    let db_name = format!("conductor_prepare_{}", uuid::Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{base_url}/{db_name}")).with_max_connections(2);

    let pool = pool::prepare_database(&config)
        .await
        .expect("prepare_database should create and migrate");

    let counts = pool::table_counts(&pool).await.expect("should count tables");
    assert!(
        counts.iter().any(|(table, _)| table == "tasks"),
        "schema should be in place after prepare_database"
    );

    // Idempotent: a second run against the existing database is a no-op.
    let again = pool::prepare_database(&config)
        .await
        .expect("second prepare_database should succeed");
    again.close().await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn table_counts_lists_every_table() {
    let (temp_pool, db_name) = create_test_db().await;

    let counts = pool::table_counts(&temp_pool)
        .await
        .expect("should count tables");

    for expected in EXPECTED_TABLES {
        assert!(
            counts.iter().any(|(table, count)| table == expected && *count == 0),
            "expected empty table {expected:?} in counts"
        );
    }

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}
