//! Task and subtask state machine transitions.
//!
//! Validates and executes state transitions, enforcing the allowed
//! transition graphs, optimistic locking, and timestamp management.

use anyhow::Context;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{SubtaskStatus, TaskStatus};
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::tasks as task_db;

use crate::error::{CoreError, CoreResult};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending            -> initializing
/// initializing       -> running
/// initializing       -> failed      (decomposition input invalid)
/// running            -> checkpoint_pending
/// checkpoint_pending -> running     (checkpoint approved)
/// checkpoint_pending -> failed      (checkpoint rejected)
/// running            -> completed
/// running            -> failed
/// any non-terminal   -> cancelled
/// ```
///
/// `completed`, `failed`, and `cancelled` are absorbing.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == TaskStatus::Cancelled {
            return true;
        }
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Initializing)
                | (TaskStatus::Initializing, TaskStatus::Running)
                | (TaskStatus::Initializing, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::CheckpointPending)
                | (TaskStatus::CheckpointPending, TaskStatus::Running)
                | (TaskStatus::CheckpointPending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` when entering `running` for the first time.
    /// - Sets `completed_at` when entering an absorbing state.
    ///
    /// Returns a conflict error when the current status in the database
    /// does not match `from`, and not-found when the task is absent.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(CoreError::conflict(format!(
                "invalid task transition: {from} -> {to}"
            ))
            .with_details(serde_json::json!({ "task_id": task_id })));
        }

        let started_at = (to == TaskStatus::Running && from == TaskStatus::Initializing)
            .then(Utc::now);
        let completed_at = to.is_terminal().then(Utc::now);

        let rows = task_db::transition_task_status(pool, task_id, from, to, started_at, completed_at)
            .await
            .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            // Either the task does not exist or the status did not match.
            let task = task_db::get_task(pool, task_id).await?;
            return match task {
                None => Err(CoreError::not_found(format!("task {task_id} not found"))),
                Some(t) => Err(CoreError::conflict(format!(
                    "task {} has status {}, expected {}",
                    task_id, t.status, from
                ))
                .with_details(serde_json::json!({
                    "task_id": task_id,
                    "actual": t.status,
                    "expected": from,
                }))),
            };
        }

        Ok(())
    }
}

/// The subtask state machine.
///
/// ```text
/// pending    -> ready       (dependencies completed)
/// ready      -> assigned    (dispatched to a worker)
/// assigned   -> ready       (worker lost before starting)
/// assigned   -> running
/// running    -> completed
/// running    -> failed
/// running    -> ready       (worker lost mid-run, reclaim)
/// failed     -> ready       (retry with budget remaining)
/// completed  -> correcting  (correction spawned against it)
/// correcting -> completed   (corrected output folded back)
/// ```
pub struct SubtaskStateMachine;

impl SubtaskStateMachine {
    pub fn is_valid_transition(from: SubtaskStatus, to: SubtaskStatus) -> bool {
        matches!(
            (from, to),
            (SubtaskStatus::Pending, SubtaskStatus::Ready)
                | (SubtaskStatus::Ready, SubtaskStatus::Assigned)
                | (SubtaskStatus::Assigned, SubtaskStatus::Ready)
                | (SubtaskStatus::Assigned, SubtaskStatus::Running)
                | (SubtaskStatus::Running, SubtaskStatus::Completed)
                | (SubtaskStatus::Running, SubtaskStatus::Failed)
                | (SubtaskStatus::Running, SubtaskStatus::Ready)
                | (SubtaskStatus::Failed, SubtaskStatus::Ready)
                | (SubtaskStatus::Completed, SubtaskStatus::Correcting)
                | (SubtaskStatus::Correcting, SubtaskStatus::Completed)
        )
    }

    /// Execute a validated transition with optimistic locking.
    pub async fn transition(
        pool: &PgPool,
        subtask_id: Uuid,
        from: SubtaskStatus,
        to: SubtaskStatus,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(CoreError::conflict(format!(
                "invalid subtask transition: {from} -> {to}"
            ))
            .with_details(serde_json::json!({ "subtask_id": subtask_id })));
        }

        let rows = subtask_db::transition_subtask_status(pool, subtask_id, from, to)
            .await
            .with_context(|| {
                format!("failed to transition subtask {subtask_id} from {from} to {to}")
            })?;

        if rows == 0 {
            let subtask = subtask_db::get_subtask(pool, subtask_id).await?;
            return match subtask {
                None => Err(CoreError::not_found(format!(
                    "subtask {subtask_id} not found"
                ))),
                Some(s) => Err(CoreError::conflict(format!(
                    "subtask {} has status {}, expected {}",
                    subtask_id, s.status, from
                ))),
            };
        }

        Ok(())
    }

    /// Start a dispatched subtask: `assigned -> running`.
    pub async fn start(pool: &PgPool, subtask_id: Uuid) -> CoreResult<()> {
        Self::transition(pool, subtask_id, SubtaskStatus::Assigned, SubtaskStatus::Running).await
    }

    /// Requeue a failed subtask, enforcing the retry budget.
    pub async fn retry(
        pool: &PgPool,
        subtask_id: Uuid,
        max_attempts: u32,
    ) -> CoreResult<()> {
        let subtask = subtask_db::get_subtask(pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} not found")))?;

        if subtask.status != SubtaskStatus::Failed {
            return Err(CoreError::conflict(format!(
                "cannot retry subtask {}: status is {}, expected failed",
                subtask_id, subtask.status
            )));
        }

        if subtask.retries >= max_attempts as i32 {
            return Err(CoreError::fatal(format!(
                "subtask {} exhausted retries ({}/{})",
                subtask_id, subtask.retries, max_attempts
            ))
            .with_details(serde_json::json!({
                "subtask_id": subtask_id,
                "retries": subtask.retries,
            })));
        }

        let rows = subtask_db::retry_subtask(pool, subtask_id, subtask.retries).await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "optimistic lock failed on retry for subtask {subtask_id}"
            )));
        }

        Ok(())
    }
}
