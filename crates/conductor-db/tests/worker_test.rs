//! Integration tests for worker registration, heartbeats, and soft
//! deletion.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{WorkerResidency, WorkerStatus};
use conductor_db::queries::workers::{self, NewWorker};

use conductor_test_utils::{create_test_db, drop_test_db};

async fn register(pool: &PgPool, id: Uuid, machine: &str, tools: &[&str]) {
    workers::upsert_worker(
        pool,
        &NewWorker {
            id,
            machine_name: machine,
            capabilities: &serde_json::json!(tools),
            residency: WorkerResidency::Remote,
        },
    )
    .await
    .expect("upsert_worker should succeed");
}

#[tokio::test]
async fn register_sets_online_with_heartbeat() {
    let (pool, db_name) = create_test_db().await;
    let id = Uuid::new_v4();

    register(&pool, id, "builder-1", &["claude"]).await;

    let worker = workers::get_worker(&pool, id).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
    assert!(worker.last_heartbeat.is_some());
    assert_eq!(worker.tool_ids(), vec!["claude"]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reregistration_replaces_capabilities_and_revives() {
    let (pool, db_name) = create_test_db().await;
    let id = Uuid::new_v4();

    register(&pool, id, "builder-1", &["claude"]).await;
    workers::set_worker_status(&pool, id, WorkerStatus::Offline).await.unwrap();

    register(&pool, id, "builder-1", &["claude", "gemini"]).await;

    let worker = workers::get_worker(&pool, id).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
    assert_eq!(worker.tool_ids(), vec!["claude", "gemini"]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn heartbeat_updates_resources() {
    let (pool, db_name) = create_test_db().await;
    let id = Uuid::new_v4();
    register(&pool, id, "builder-1", &["claude"]).await;

    let rows = workers::record_heartbeat(&pool, id, 42.0, 55.5, 12.0).await.unwrap();
    assert_eq!(rows, 1);

    let worker = workers::get_worker(&pool, id).await.unwrap().unwrap();
    assert_eq!(worker.cpu_pct, 42.0);
    assert_eq!(worker.mem_pct, 55.5);
    assert_eq!(worker.disk_pct, 12.0);

    // Unknown worker: no rows.
    let rows = workers::record_heartbeat(&pool, Uuid::new_v4(), 1.0, 1.0, 1.0)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn deregistered_workers_drop_out_of_listings() {
    let (pool, db_name) = create_test_db().await;
    let keep = Uuid::new_v4();
    let drop_ = Uuid::new_v4();
    register(&pool, keep, "keeper", &["claude"]).await;
    register(&pool, drop_, "dropper", &["gemini"]).await;

    let rows = workers::deregister_worker(&pool, drop_).await.unwrap();
    assert_eq!(rows, 1);
    // Idempotent at the query level: already deregistered.
    let rows = workers::deregister_worker(&pool, drop_).await.unwrap();
    assert_eq!(rows, 0);

    let listed = workers::list_workers(&pool, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, keep);

    // Heartbeats from a deregistered worker are ignored.
    let rows = workers::record_heartbeat(&pool, drop_, 1.0, 1.0, 1.0).await.unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn live_listing_orders_by_registration() {
    let (pool, db_name) = create_test_db().await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    register(&pool, first, "first", &["claude"]).await;
    register(&pool, second, "second", &["claude"]).await;

    workers::transition_worker_status(&pool, second, WorkerStatus::Online, WorkerStatus::Busy)
        .await
        .unwrap();

    let live = workers::list_live_workers(&pool).await.unwrap();
    assert_eq!(live.len(), 2, "busy workers stay in the live set");
    assert_eq!(live[0].id, first);
    assert_eq!(live[1].id, second);

    pool.close().await;
    drop_test_db(&db_name).await;
}
