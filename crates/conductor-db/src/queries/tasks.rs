//! Database query functions for the `tasks` table.
//!
//! Every UPDATE carries an optimistic predicate on the current status and
//! bumps the monotonic `version` column. Per-task serialization uses
//! `SELECT .. FOR UPDATE` inside a caller-owned transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{CheckpointFrequency, PrivacyLevel, Task, TaskStatus};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub description: &'a str,
    pub checkpoint_frequency: CheckpointFrequency,
    pub privacy: PrivacyLevel,
    pub preferred_tools: &'a serde_json::Value,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, version).
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (description, checkpoint_frequency, privacy, preferred_tools) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.description)
    .bind(new.checkpoint_frequency)
    .bind(new.privacy)
    .bind(new.preferred_tools)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Lock a task row for the duration of the surrounding transaction.
///
/// This is the per-task serialization point: every scheduling decision
/// that reads or writes a task's subtasks takes this lock first.
pub async fn lock_task(executor: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to lock task row")?;

    Ok(task)
}

/// List tasks, optionally filtered by status, newest first.
pub async fn list_tasks(
    pool: &PgPool,
    status: Option<TaskStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Count tasks, optionally filtered by status.
pub async fn count_tasks(pool: &PgPool, status: Option<TaskStatus>) -> Result<i64> {
    let row: (i64,) = match status {
        Some(status) => {
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = $1")
                .bind(status)
                .fetch_one(pool)
                .await
        }
        None => sqlx::query_as("SELECT COUNT(*) FROM tasks").fetch_one(pool).await,
    }
    .context("failed to count tasks")?;

    Ok(row.0)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Bumps the version counter. Returns the number of rows
/// affected (0 means the status did not match).
pub async fn transition_task_status(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             version = version + 1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(executor)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Compare-and-swap update of the task progress column.
///
/// Only applies when the version still matches `expected_version`; callers
/// retry with backoff on a miss. Returns rows affected.
pub async fn update_task_progress(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
    progress: i32,
    expected_version: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET progress = $1, version = version + 1 \
         WHERE id = $2 AND version = $3",
    )
    .bind(progress)
    .bind(task_id)
    .bind(expected_version)
    .execute(executor)
    .await
    .context("failed to update task progress")?;

    Ok(result.rows_affected())
}

/// Unconditional progress write, for use under a held row lock.
pub async fn set_task_progress(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
    progress: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET progress = $1, version = version + 1 WHERE id = $2",
    )
    .bind(progress)
    .bind(task_id)
    .execute(executor)
    .await
    .context("failed to set task progress")?;

    Ok(result.rows_affected())
}

/// Reset progress after a checkpoint rejection. The only path on which
/// progress is allowed to decrease.
pub async fn reset_task_progress(executor: impl PgExecutor<'_>, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET progress = 0, version = version + 1 WHERE id = $1",
    )
    .bind(task_id)
    .execute(executor)
    .await
    .context("failed to reset task progress")?;

    Ok(result.rows_affected())
}

/// Status counts for a task's subtasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub pending: i64,
    pub ready: i64,
    pub assigned: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub correcting: i64,
    pub total: i64,
}

impl TaskProgress {
    /// Percentage of completed subtasks, rounded down, in [0, 100].
    pub fn percent(&self) -> i32 {
        if self.total == 0 {
            return 0;
        }
        (self.completed * 100 / self.total) as i32
    }

    /// Whether no subtask is still schedulable or in flight.
    pub fn is_drained(&self) -> bool {
        self.pending == 0
            && self.ready == 0
            && self.assigned == 0
            && self.running == 0
            && self.correcting == 0
    }
}

/// Get a summary of subtask counts by status for a given task.
pub async fn get_task_progress(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<TaskProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM subtasks \
         WHERE task_id = $1 \
         GROUP BY status",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to get task progress")?;

    let mut progress = TaskProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "ready" => progress.ready = *count,
            "assigned" => progress.assigned = *count,
            "running" => progress.running = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "correcting" => progress.correcting = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_down() {
        let progress = TaskProgress {
            completed: 2,
            total: 3,
            ..Default::default()
        };
        assert_eq!(progress.percent(), 66);
    }

    #[test]
    fn percent_empty_task_is_zero() {
        assert_eq!(TaskProgress::default().percent(), 0);
    }

    #[test]
    fn percent_all_done_is_hundred() {
        let progress = TaskProgress {
            completed: 5,
            total: 5,
            ..Default::default()
        };
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn drained_requires_no_schedulable_work() {
        let mut progress = TaskProgress {
            completed: 4,
            failed: 1,
            total: 5,
            ..Default::default()
        };
        assert!(progress.is_drained());
        progress.running = 1;
        assert!(!progress.is_drained());
    }
}
