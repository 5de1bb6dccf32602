//! Database query functions for the `reviews` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Review, ReviewDecision};

/// Parameters for opening a peer review.
#[derive(Debug, Clone)]
pub struct NewReview {
    pub subtask_id: Uuid,
    pub review_subtask_id: Uuid,
    pub reviewer_worker: Option<Uuid>,
    pub author_worker: Option<Uuid>,
}

/// Insert a new review row linking an original subtask to its review
/// subtask.
pub async fn insert_review(pool: &PgPool, new: &NewReview) -> Result<Review> {
    let review = sqlx::query_as::<_, Review>(
        "INSERT INTO reviews (subtask_id, review_subtask_id, reviewer_worker, author_worker) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.subtask_id)
    .bind(new.review_subtask_id)
    .bind(new.reviewer_worker)
    .bind(new.author_worker)
    .fetch_one(pool)
    .await
    .context("failed to insert review")?;

    Ok(review)
}

/// Find the review record whose review subtask is the given one.
pub async fn get_by_review_subtask(
    pool: &PgPool,
    review_subtask_id: Uuid,
) -> Result<Option<Review>> {
    let review = sqlx::query_as::<_, Review>(
        "SELECT * FROM reviews WHERE review_subtask_id = $1",
    )
    .bind(review_subtask_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch review by review subtask")?;

    Ok(review)
}

/// Record the reviewer's verdict and the controller's decision.
pub async fn record_verdict(
    pool: &PgPool,
    id: Uuid,
    score: f64,
    issues: &serde_json::Value,
    decision: ReviewDecision,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE reviews \
         SET score = $1, issues = $2, decision = $3, decided_at = NOW() \
         WHERE id = $4 AND decision IS NULL",
    )
    .bind(score)
    .bind(issues)
    .bind(decision)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record review verdict")?;

    Ok(result.rows_affected())
}

/// List reviews of one original subtask, oldest first.
pub async fn list_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<Review>> {
    let reviews = sqlx::query_as::<_, Review>(
        "SELECT * FROM reviews WHERE subtask_id = $1 ORDER BY created_at ASC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to list reviews for subtask")?;

    Ok(reviews)
}

/// Update the reviewer assignment once the review subtask is dispatched.
pub async fn set_reviewer(pool: &PgPool, id: Uuid, reviewer_worker: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE reviews SET reviewer_worker = $1 WHERE id = $2")
        .bind(reviewer_worker)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set reviewer")?;

    Ok(result.rows_affected())
}
