//! Database query functions for the `activity_log` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ActivityLog;

/// Parameters for appending an activity log row.
#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub task_id: Option<Uuid>,
    pub subtask_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub event_type: String,
    pub payload: Value,
}

/// Append a new activity log row. Returns the inserted row with
/// server-generated defaults (id, recorded_at).
pub async fn insert_activity(pool: &PgPool, new: &NewActivity) -> Result<ActivityLog> {
    let entry = sqlx::query_as::<_, ActivityLog>(
        "INSERT INTO activity_log (task_id, subtask_id, worker_id, event_type, payload) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.subtask_id)
    .bind(new.worker_id)
    .bind(&new.event_type)
    .bind(&new.payload)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert activity log entry {}", new.event_type))?;

    Ok(entry)
}

/// All activity for a task, oldest first.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<ActivityLog>> {
    let entries = sqlx::query_as::<_, ActivityLog>(
        "SELECT * FROM activity_log WHERE task_id = $1 ORDER BY recorded_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list activity for task {task_id}"))?;

    Ok(entries)
}

/// The most recent activity rows across all tasks.
pub async fn recent(pool: &PgPool, limit: i64) -> Result<Vec<ActivityLog>> {
    let entries = sqlx::query_as::<_, ActivityLog>(
        "SELECT * FROM activity_log ORDER BY recorded_at DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent activity")?;

    Ok(entries)
}
