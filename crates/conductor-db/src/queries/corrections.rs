//! Database query functions for the `corrections` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Correction, CorrectionCategory, CorrectionOutcome};

/// Parameters for filing a correction.
#[derive(Debug, Clone)]
pub struct NewCorrection<'a> {
    pub checkpoint_id: Option<Uuid>,
    pub subtask_id: Uuid,
    pub category: CorrectionCategory,
    pub guidance: &'a str,
    pub retry_index: i32,
    pub learning_mode: bool,
}

/// Insert a correction row in `pending` outcome.
pub async fn insert_correction(pool: &PgPool, new: &NewCorrection<'_>) -> Result<Correction> {
    let correction = sqlx::query_as::<_, Correction>(
        "INSERT INTO corrections \
         (checkpoint_id, subtask_id, category, guidance, retry_index, learning_mode) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.checkpoint_id)
    .bind(new.subtask_id)
    .bind(new.category)
    .bind(new.guidance)
    .bind(new.retry_index)
    .bind(new.learning_mode)
    .fetch_one(pool)
    .await
    .context("failed to insert correction")?;

    Ok(correction)
}

/// Record the outcome of a correction attempt.
pub async fn resolve_correction(
    pool: &PgPool,
    id: Uuid,
    outcome: CorrectionOutcome,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE corrections \
         SET outcome = $1, resolved_at = NOW() \
         WHERE id = $2 AND outcome = 'pending'",
    )
    .bind(outcome)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resolve correction")?;

    Ok(result.rows_affected())
}

/// List corrections filed against one subtask, oldest first.
pub async fn list_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<Correction>> {
    let corrections = sqlx::query_as::<_, Correction>(
        "SELECT * FROM corrections WHERE subtask_id = $1 ORDER BY created_at ASC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to list corrections for subtask")?;

    Ok(corrections)
}
