//! Database query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointReason, CheckpointStatus};

/// Insert a new checkpoint in `pending_review` status.
///
/// The partial unique index `checkpoints_one_pending_per_task` rejects a
/// second pending checkpoint for the same task; callers can detect that
/// case with [`is_unique_violation`].
pub async fn insert_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    reason: CheckpointReason,
    snapshot: &serde_json::Value,
) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (task_id, reason, snapshot) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(reason)
    .bind(snapshot)
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// Whether an error chain bottoms out in a Postgres unique violation
/// (SQLSTATE 23505).
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .and_then(|db| db.code())
            .is_some_and(|code| code == "23505")
    })
}

/// Fetch a single checkpoint by ID.
pub async fn get_checkpoint(pool: &PgPool, id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// The most recent checkpoint for a task, if any.
pub async fn latest_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE task_id = $1 \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(checkpoint)
}

/// The pending checkpoint for a task, if one exists.
pub async fn pending_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE task_id = $1 AND status = 'pending_review'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pending checkpoint")?;

    Ok(checkpoint)
}

/// Record a user decision: `pending_review -> {approved, corrected,
/// rejected}`. Optimistic on the pending status; returns rows affected
/// (0 means the checkpoint was already decided).
pub async fn decide_checkpoint(
    pool: &PgPool,
    id: Uuid,
    to: CheckpointStatus,
    notes: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE checkpoints \
         SET status = $1, notes = COALESCE($2, notes), decided_at = NOW() \
         WHERE id = $3 AND status = 'pending_review'",
    )
    .bind(to)
    .bind(notes)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to decide checkpoint")?;

    Ok(result.rows_affected())
}

/// List all checkpoints for a task, oldest first.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints for task")?;

    Ok(checkpoints)
}
