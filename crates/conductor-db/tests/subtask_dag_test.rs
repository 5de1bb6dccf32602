//! Integration tests for the subtask DAG queries: dependency-driven
//! promotion, dispatch ordering, retries, and worker reclaim.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{
    CheckpointFrequency, PrivacyLevel, Subtask, SubtaskKind, SubtaskStatus,
};
use conductor_db::queries::subtasks::{self, NewSubtask};
use conductor_db::queries::tasks::{self, NewTask};

use conductor_test_utils::{create_test_db, drop_test_db};

async fn insert_task(pool: &PgPool) -> Uuid {
    tasks::insert_task(
        pool,
        &NewTask {
            description: "test task",
            checkpoint_frequency: CheckpointFrequency::Medium,
            privacy: PrivacyLevel::Normal,
            preferred_tools: &serde_json::json!([]),
        },
    )
    .await
    .expect("insert_task should succeed")
    .id
}

async fn insert_subtask(pool: &PgPool, task_id: Uuid, name: &str) -> Subtask {
    insert_subtask_with(pool, task_id, name, 3, 0).await
}

async fn insert_subtask_with(
    pool: &PgPool,
    task_id: Uuid,
    name: &str,
    complexity: i32,
    priority: i32,
) -> Subtask {
    subtasks::insert_subtask(
        pool,
        &NewSubtask {
            task_id,
            kind: SubtaskKind::Work,
            name,
            description: "do the thing",
            recommended_tool: Some("claude"),
            complexity,
            priority,
            review_target: None,
        },
    )
    .await
    .expect("insert_subtask should succeed")
}

#[tokio::test]
async fn promote_ready_respects_dependencies() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;

    let a = insert_subtask(&pool, task_id, "a").await;
    let b = insert_subtask(&pool, task_id, "b").await;
    subtasks::insert_dependency(&pool, b.id, a.id).await.unwrap();

    // Only "a" promotes; "b" waits on it.
    let promoted = subtasks::promote_ready(&pool, task_id).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].id, a.id);

    // Drive "a" through to completed.
    subtasks::assign_subtask(&pool, a.id, Uuid::new_v4()).await.unwrap();
    subtasks::transition_subtask_status(&pool, a.id, SubtaskStatus::Assigned, SubtaskStatus::Running)
        .await
        .unwrap();
    subtasks::complete_subtask(&pool, a.id, &serde_json::json!({"files": []}))
        .await
        .unwrap();

    let promoted = subtasks::promote_ready(&pool, task_id).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].id, b.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ready_order_is_priority_then_complexity_then_fifo() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;

    let plain = insert_subtask_with(&pool, task_id, "plain", 3, 0).await;
    let urgent_hard = insert_subtask_with(&pool, task_id, "urgent-hard", 5, 10).await;
    let urgent_easy = insert_subtask_with(&pool, task_id, "urgent-easy", 1, 10).await;

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    let ready = subtasks::get_ready_subtasks(&pool, task_id).await.unwrap();

    let names: Vec<&str> = ready.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["urgent-easy", "urgent-hard", "plain"]);
    assert_eq!(ready[0].id, urgent_easy.id);
    assert_eq!(ready[1].id, urgent_hard.id);
    assert_eq!(ready[2].id, plain.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn assign_bumps_attempt_and_requires_ready() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;
    let subtask = insert_subtask(&pool, task_id, "a").await;
    let worker = Uuid::new_v4();

    // Not ready yet: no rows.
    let rows = subtasks::assign_subtask(&pool, subtask.id, worker).await.unwrap();
    assert_eq!(rows, 0);

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    let rows = subtasks::assign_subtask(&pool, subtask.id, worker).await.unwrap();
    assert_eq!(rows, 1);

    let reloaded = subtasks::get_subtask(&pool, subtask.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SubtaskStatus::Assigned);
    assert_eq!(reloaded.attempt, 1);
    assert_eq!(reloaded.assigned_worker, Some(worker));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_requeues_failed_subtask_once_per_retry_value() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;
    let subtask = insert_subtask(&pool, task_id, "a").await;

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    subtasks::assign_subtask(&pool, subtask.id, Uuid::new_v4()).await.unwrap();
    subtasks::transition_subtask_status(
        &pool,
        subtask.id,
        SubtaskStatus::Assigned,
        SubtaskStatus::Running,
    )
    .await
    .unwrap();
    subtasks::fail_subtask(&pool, subtask.id, "boom").await.unwrap();

    let rows = subtasks::retry_subtask(&pool, subtask.id, 0).await.unwrap();
    assert_eq!(rows, 1);

    // Stale retries value: optimistic miss.
    let rows = subtasks::retry_subtask(&pool, subtask.id, 0).await.unwrap();
    assert_eq!(rows, 0);

    let reloaded = subtasks::get_subtask(&pool, subtask.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SubtaskStatus::Ready);
    assert_eq!(reloaded.retries, 1);
    assert!(reloaded.error.is_none());
    assert!(reloaded.assigned_worker.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reclaim_returns_lost_workers_subtasks_to_ready() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;
    let a = insert_subtask(&pool, task_id, "a").await;
    let b = insert_subtask(&pool, task_id, "b").await;
    let worker = Uuid::new_v4();

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    subtasks::assign_subtask(&pool, a.id, worker).await.unwrap();
    subtasks::assign_subtask(&pool, b.id, worker).await.unwrap();
    subtasks::transition_subtask_status(&pool, a.id, SubtaskStatus::Assigned, SubtaskStatus::Running)
        .await
        .unwrap();

    let reclaimed = subtasks::reclaim_for_worker(&pool, worker).await.unwrap();
    assert_eq!(reclaimed.len(), 2);

    for subtask in &reclaimed {
        assert_eq!(subtask.status, SubtaskStatus::Ready);
        assert_eq!(subtask.retries, 1);
        assert!(subtask.assigned_worker.is_none());
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn progress_counts_by_status() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;
    let a = insert_subtask(&pool, task_id, "a").await;
    let _b = insert_subtask(&pool, task_id, "b").await;

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    subtasks::assign_subtask(&pool, a.id, Uuid::new_v4()).await.unwrap();
    subtasks::transition_subtask_status(&pool, a.id, SubtaskStatus::Assigned, SubtaskStatus::Running)
        .await
        .unwrap();
    subtasks::complete_subtask(&pool, a.id, &serde_json::json!({})).await.unwrap();

    let progress = tasks::get_task_progress(&pool, task_id).await.unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.ready, 1);
    assert_eq!(progress.total, 2);
    assert_eq!(progress.percent(), 50);
    assert!(!progress.is_drained());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn correcting_cycle_updates_output() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;
    let subtask = insert_subtask(&pool, task_id, "a").await;

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    subtasks::assign_subtask(&pool, subtask.id, Uuid::new_v4()).await.unwrap();
    subtasks::transition_subtask_status(
        &pool,
        subtask.id,
        SubtaskStatus::Assigned,
        SubtaskStatus::Running,
    )
    .await
    .unwrap();
    subtasks::complete_subtask(&pool, subtask.id, &serde_json::json!({"text": "v1"}))
        .await
        .unwrap();

    assert_eq!(subtasks::begin_correcting(&pool, subtask.id).await.unwrap(), 1);
    assert_eq!(
        subtasks::finish_correcting(&pool, subtask.id, &serde_json::json!({"text": "v2"}))
            .await
            .unwrap(),
        1
    );
    subtasks::bump_review_cycles(&pool, subtask.id).await.unwrap();

    let reloaded = subtasks::get_subtask(&pool, subtask.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SubtaskStatus::Completed);
    assert_eq!(reloaded.review_cycles, 1);
    assert_eq!(reloaded.output.unwrap()["text"], "v2");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn work_counts_for_checkpoint_policy() {
    let (pool, db_name) = create_test_db().await;
    let task_id = insert_task(&pool).await;
    let a = insert_subtask(&pool, task_id, "a").await;
    let _b = insert_subtask(&pool, task_id, "b").await;

    // A review subtask must not count as work.
    subtasks::insert_subtask(
        &pool,
        &NewSubtask {
            task_id,
            kind: SubtaskKind::Review,
            name: "review-a",
            description: "review",
            recommended_tool: None,
            complexity: 2,
            priority: 10,
            review_target: Some(a.id),
        },
    )
    .await
    .unwrap();

    subtasks::promote_ready(&pool, task_id).await.unwrap();
    subtasks::assign_subtask(&pool, a.id, Uuid::new_v4()).await.unwrap();
    subtasks::transition_subtask_status(&pool, a.id, SubtaskStatus::Assigned, SubtaskStatus::Running)
        .await
        .unwrap();
    subtasks::complete_subtask(&pool, a.id, &serde_json::json!({})).await.unwrap();

    let (total, remaining) = subtasks::count_work(&pool, task_id).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(remaining, 1);
    assert_eq!(subtasks::count_completed_work(&pool, task_id).await.unwrap(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
