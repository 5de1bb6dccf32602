//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Worker, WorkerResidency, WorkerStatus};

/// Parameters for registering a worker.
#[derive(Debug, Clone)]
pub struct NewWorker<'a> {
    pub id: Uuid,
    pub machine_name: &'a str,
    pub capabilities: &'a serde_json::Value,
    pub residency: WorkerResidency,
}

/// Register a worker, or refresh an existing registration in place.
///
/// Re-registration after a restart revives a soft-deleted or offline row
/// and replaces the capability set.
pub async fn upsert_worker(pool: &PgPool, new: &NewWorker<'_>) -> Result<Worker> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, machine_name, capabilities, residency, status, last_heartbeat) \
         VALUES ($1, $2, $3, $4, 'online', NOW()) \
         ON CONFLICT (id) DO UPDATE \
         SET machine_name = EXCLUDED.machine_name, \
             capabilities = EXCLUDED.capabilities, \
             residency = EXCLUDED.residency, \
             status = 'online', \
             last_heartbeat = NOW(), \
             deregistered_at = NULL \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.machine_name)
    .bind(new.capabilities)
    .bind(new.residency)
    .fetch_one(pool)
    .await
    .context("failed to upsert worker")?;

    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, id: Uuid) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")?;

    Ok(worker)
}

/// List registered workers, optionally filtered by status. Soft-deleted
/// workers are excluded.
pub async fn list_workers(pool: &PgPool, status: Option<WorkerStatus>) -> Result<Vec<Worker>> {
    let workers = match status {
        Some(status) => {
            sqlx::query_as::<_, Worker>(
                "SELECT * FROM workers \
                 WHERE deregistered_at IS NULL AND status = $1 \
                 ORDER BY registered_at ASC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Worker>(
                "SELECT * FROM workers \
                 WHERE deregistered_at IS NULL \
                 ORDER BY registered_at ASC",
            )
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list workers")?;

    Ok(workers)
}

/// List workers eligible for dispatch: online or busy, not soft-deleted,
/// ordered by registration time (selection tie-break).
pub async fn list_live_workers(pool: &PgPool) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers \
         WHERE deregistered_at IS NULL AND status IN ('online', 'busy') \
         ORDER BY registered_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list live workers")?;

    Ok(workers)
}

/// Record a heartbeat: refresh the timestamp and resource snapshot.
/// Returns rows affected (0 when the worker is unknown or deregistered).
pub async fn record_heartbeat(
    pool: &PgPool,
    id: Uuid,
    cpu_pct: f64,
    mem_pct: f64,
    disk_pct: f64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers \
         SET last_heartbeat = NOW(), cpu_pct = $1, mem_pct = $2, disk_pct = $3 \
         WHERE id = $4 AND deregistered_at IS NULL",
    )
    .bind(cpu_pct)
    .bind(mem_pct)
    .bind(disk_pct)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Set a worker's status. Optimistic on the expected current status.
pub async fn transition_worker_status(
    pool: &PgPool,
    id: Uuid,
    from: WorkerStatus,
    to: WorkerStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE workers SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition worker status")?;

    Ok(result.rows_affected())
}

/// Unconditionally set a worker's status (used by the liveness sweeper,
/// which already serializes per worker).
pub async fn set_worker_status(pool: &PgPool, id: Uuid, status: WorkerStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE workers SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set worker status")?;

    Ok(result.rows_affected())
}

/// Soft-delete a worker on deregistration.
pub async fn deregister_worker(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers \
         SET deregistered_at = NOW(), status = 'offline' \
         WHERE id = $1 AND deregistered_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to deregister worker")?;

    Ok(result.rows_affected())
}
