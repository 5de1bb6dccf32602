//! Database query functions for the `subtasks` and `subtask_dependencies`
//! tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{Subtask, SubtaskKind, SubtaskStatus};

/// Parameters for inserting a new subtask row.
#[derive(Debug, Clone)]
pub struct NewSubtask<'a> {
    pub task_id: Uuid,
    pub kind: SubtaskKind,
    pub name: &'a str,
    pub description: &'a str,
    pub recommended_tool: Option<&'a str>,
    pub complexity: i32,
    pub priority: i32,
    pub review_target: Option<Uuid>,
}

/// Insert a new subtask row. Returns the inserted subtask with
/// server-generated defaults (id, created_at, status).
pub async fn insert_subtask(
    executor: impl PgExecutor<'_>,
    new: &NewSubtask<'_>,
) -> Result<Subtask> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks \
         (task_id, kind, name, description, recommended_tool, complexity, priority, review_target) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.kind)
    .bind(new.name)
    .bind(new.description)
    .bind(new.recommended_tool)
    .bind(new.complexity)
    .bind(new.priority)
    .bind(new.review_target)
    .fetch_one(executor)
    .await
    .context("failed to insert subtask")?;

    Ok(subtask)
}

/// Insert a dependency edge: `subtask_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dependency(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    depends_on_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO subtask_dependencies (subtask_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(subtask_id)
    .bind(depends_on_id)
    .execute(executor)
    .await
    .context("failed to insert subtask dependency")?;

    Ok(())
}

/// Fetch a single subtask by ID.
pub async fn get_subtask(executor: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// List all subtasks for a task, ordered by creation time.
pub async fn list_subtasks_for_task(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to list subtasks for task")?;

    Ok(subtasks)
}

/// Get the IDs of all subtasks that a given subtask depends on.
pub async fn get_dependencies(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM subtask_dependencies WHERE subtask_id = $1")
            .bind(subtask_id)
            .fetch_all(executor)
            .await
            .context("failed to get subtask dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Promote every pending subtask whose dependencies are all completed to
/// `ready`. Returns the promoted rows.
///
/// Runs inside the caller's transaction, under the parent task's row lock.
pub async fn promote_ready(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<Subtask>> {
    let promoted = sqlx::query_as::<_, Subtask>(
        "UPDATE subtasks s \
         SET status = 'ready' \
         WHERE s.task_id = $1 \
           AND s.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM subtask_dependencies sd \
               JOIN subtasks dep ON dep.id = sd.depends_on \
               WHERE sd.subtask_id = s.id AND dep.status != 'completed' \
           ) \
         RETURNING *",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to promote ready subtasks")?;

    Ok(promoted)
}

/// Get all ready subtasks for a task in dispatch order: descending
/// priority, ascending complexity, FIFO on creation time.
pub async fn get_ready_subtasks(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks \
         WHERE task_id = $1 AND status = 'ready' \
         ORDER BY priority DESC, complexity ASC, created_at ASC",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to get ready subtasks")?;

    Ok(subtasks)
}

/// Atomically transition a subtask from one status to another.
///
/// Optimistic: the WHERE clause pins the expected `from` status. Sets
/// `started_at` when entering `running` and `completed_at` when entering a
/// terminal status. Returns rows affected.
pub async fn transition_subtask_status(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    from: SubtaskStatus,
    to: SubtaskStatus,
) -> Result<u64> {
    let started_at: Option<DateTime<Utc>> =
        (to == SubtaskStatus::Running).then(Utc::now);
    let completed_at: Option<DateTime<Utc>> = to.is_terminal().then(Utc::now);

    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(subtask_id)
    .bind(from)
    .execute(executor)
    .await
    .context("failed to transition subtask status")?;

    Ok(result.rows_affected())
}

/// Assign a ready subtask to a worker: `ready -> assigned`, bumping the
/// dispatch attempt counter. Returns rows affected.
pub async fn assign_subtask(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    worker_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'assigned', assigned_worker = $1, attempt = attempt + 1 \
         WHERE id = $2 AND status = 'ready'",
    )
    .bind(worker_id)
    .bind(subtask_id)
    .execute(executor)
    .await
    .context("failed to assign subtask")?;

    Ok(result.rows_affected())
}

/// Record a successful completion: `running -> completed` with output.
pub async fn complete_subtask(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    output: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'completed', output = $1, error = NULL, completed_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(output)
    .bind(subtask_id)
    .execute(executor)
    .await
    .context("failed to complete subtask")?;

    Ok(result.rows_affected())
}

/// Record a failure: `running -> failed` with error text.
pub async fn fail_subtask(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'failed', error = $1, completed_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error)
    .bind(subtask_id)
    .execute(executor)
    .await
    .context("failed to fail subtask")?;

    Ok(result.rows_affected())
}

/// Requeue a failed subtask for another attempt:
/// `failed -> ready`, incrementing the retry counter.
pub async fn retry_subtask(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    current_retries: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'ready', \
             retries = retries + 1, \
             assigned_worker = NULL, \
             error = NULL, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = $1 AND status = 'failed' AND retries = $2",
    )
    .bind(subtask_id)
    .bind(current_retries)
    .execute(executor)
    .await
    .context("failed to retry subtask")?;

    Ok(result.rows_affected())
}

/// Reclaim every in-flight subtask assigned to a lost worker.
///
/// `assigned`/`running -> ready` with the retry counter incremented and the
/// assignment cleared. Returns the reclaimed rows.
pub async fn reclaim_for_worker(
    executor: impl PgExecutor<'_>,
    worker_id: Uuid,
) -> Result<Vec<Subtask>> {
    let reclaimed = sqlx::query_as::<_, Subtask>(
        "UPDATE subtasks \
         SET status = 'ready', \
             retries = retries + 1, \
             assigned_worker = NULL, \
             started_at = NULL \
         WHERE assigned_worker = $1 AND status IN ('assigned', 'running') \
         RETURNING *",
    )
    .bind(worker_id)
    .fetch_all(executor)
    .await
    .context("failed to reclaim subtasks for worker")?;

    Ok(reclaimed)
}

/// Cancel every non-terminal subtask of a task. Returns the cancelled rows
/// (the ones that were still in flight, for worker notification).
pub async fn cancel_subtasks_for_task(
    executor: impl PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<Subtask>> {
    let cancelled = sqlx::query_as::<_, Subtask>(
        "UPDATE subtasks \
         SET status = 'failed', error = 'task cancelled', completed_at = NOW() \
         WHERE task_id = $1 \
           AND status IN ('pending', 'ready', 'assigned', 'running', 'correcting') \
         RETURNING *",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to cancel subtasks for task")?;

    Ok(cancelled)
}

/// Store the aggregate evaluation score on the subtask row.
pub async fn set_score(pool: &PgPool, subtask_id: Uuid, score: f64) -> Result<u64> {
    let result = sqlx::query("UPDATE subtasks SET score = $1 WHERE id = $2")
        .bind(score)
        .bind(subtask_id)
        .execute(pool)
        .await
        .context("failed to set subtask score")?;

    Ok(result.rows_affected())
}

/// Charge one review cycle against the subtask's ceiling.
pub async fn bump_review_cycles(pool: &PgPool, subtask_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET review_cycles = review_cycles + 1 WHERE id = $1",
    )
    .bind(subtask_id)
    .execute(pool)
    .await
    .context("failed to bump review cycles")?;

    Ok(result.rows_affected())
}

/// Move a completed subtask into `correcting` while its correction runs.
pub async fn begin_correcting(pool: &PgPool, subtask_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET status = 'correcting' \
         WHERE id = $1 AND status = 'completed'",
    )
    .bind(subtask_id)
    .execute(pool)
    .await
    .context("failed to mark subtask correcting")?;

    Ok(result.rows_affected())
}

/// Fold a finished correction back into its target:
/// `correcting -> completed` with the corrected output.
pub async fn finish_correcting(
    executor: impl PgExecutor<'_>,
    subtask_id: Uuid,
    output: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'completed', output = $1, completed_at = NOW() \
         WHERE id = $2 AND status = 'correcting'",
    )
    .bind(output)
    .bind(subtask_id)
    .execute(executor)
    .await
    .context("failed to finish correcting subtask")?;

    Ok(result.rows_affected())
}

/// Running subtasks whose execution started before the cutoff. Used by
/// the execution-timeout sweep.
pub async fn list_stuck_running(
    executor: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks \
         WHERE status = 'running' AND started_at IS NOT NULL AND started_at < $1",
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await
    .context("failed to list stuck running subtasks")?;

    Ok(subtasks)
}

/// Per-worker counts of non-terminal assigned subtasks, for load-aware
/// selection.
pub async fn current_loads(executor: impl PgExecutor<'_>) -> Result<Vec<(Uuid, i64)>> {
    let rows: Vec<(Uuid, i64)> = sqlx::query_as(
        "SELECT assigned_worker, COUNT(*) \
         FROM subtasks \
         WHERE assigned_worker IS NOT NULL AND status IN ('assigned', 'running') \
         GROUP BY assigned_worker",
    )
    .fetch_all(executor)
    .await
    .context("failed to get worker loads")?;

    Ok(rows)
}

/// Count non-terminal subtasks assigned to one worker.
pub async fn current_load_for(executor: impl PgExecutor<'_>, worker_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subtasks \
         WHERE assigned_worker = $1 AND status IN ('assigned', 'running')",
    )
    .bind(worker_id)
    .fetch_one(executor)
    .await
    .context("failed to count worker load")?;

    Ok(row.0)
}

/// Count completed work-kind subtasks for a task (checkpoint frequency
/// policy input).
pub async fn count_completed_work(executor: impl PgExecutor<'_>, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subtasks \
         WHERE task_id = $1 AND kind = 'work' AND status = 'completed'",
    )
    .bind(task_id)
    .fetch_one(executor)
    .await
    .context("failed to count completed work subtasks")?;

    Ok(row.0)
}

/// Count work-kind subtasks for a task, total and remaining.
pub async fn count_work(executor: impl PgExecutor<'_>, task_id: Uuid) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE status != 'completed') \
         FROM subtasks \
         WHERE task_id = $1 AND kind = 'work'",
    )
    .bind(task_id)
    .fetch_one(executor)
    .await
    .context("failed to count work subtasks")?;

    Ok(row)
}
