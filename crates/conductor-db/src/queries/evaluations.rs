//! Database query functions for the `evaluations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Evaluation;

/// Parameters for recording an evaluation.
#[derive(Debug, Clone)]
pub struct NewEvaluation<'a> {
    pub subtask_id: Uuid,
    pub dimension_scores: &'a serde_json::Value,
    pub overall: f64,
    pub details: &'a serde_json::Value,
}

/// Insert an evaluation row.
pub async fn insert_evaluation(pool: &PgPool, new: &NewEvaluation<'_>) -> Result<Evaluation> {
    let evaluation = sqlx::query_as::<_, Evaluation>(
        "INSERT INTO evaluations (subtask_id, dimension_scores, overall, details) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.subtask_id)
    .bind(new.dimension_scores)
    .bind(new.overall)
    .bind(new.details)
    .fetch_one(pool)
    .await
    .context("failed to insert evaluation")?;

    Ok(evaluation)
}

/// The most recent evaluation for a subtask, if any.
pub async fn latest_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Option<Evaluation>> {
    let evaluation = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations \
         WHERE subtask_id = $1 \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(subtask_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest evaluation")?;

    Ok(evaluation)
}

/// Mean overall score across a task's evaluated subtasks, if any were
/// evaluated.
pub async fn aggregate_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<f64>> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT AVG(e.overall) \
         FROM evaluations e \
         JOIN subtasks s ON s.id = e.subtask_id \
         WHERE s.task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to aggregate evaluations for task")?;

    Ok(row.0)
}
