//! Checkpoint controller: frequency policy, trigger evaluation, and the
//! approve / reject / correct flows.
//!
//! A checkpoint pauses its task in `checkpoint_pending` until a human
//! decides. At most one pending checkpoint exists per task; the partial
//! unique index in the store is the backstop for the policy-level check.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{
    Checkpoint, CheckpointFrequency, CheckpointReason, CheckpointStatus, SubtaskStatus,
    TaskStatus,
};
use conductor_db::queries::checkpoints as checkpoint_db;
use conductor_db::queries::evaluations as evaluation_db;
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::tasks as task_db;

use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventKind};
use crate::state::TaskStateMachine;

/// Whether the frequency policy fires after a work subtask completed.
///
/// - low: only when exactly one work subtask remains.
/// - medium: every third completion, or when the 50 % threshold was just
///   crossed, or when one remains.
/// - high: after every completion.
pub fn frequency_trigger(
    frequency: CheckpointFrequency,
    completed_work: i64,
    total_work: i64,
    remaining_work: i64,
) -> bool {
    match frequency {
        CheckpointFrequency::Low => remaining_work == 1,
        CheckpointFrequency::Medium => {
            let every_third = completed_work > 0 && completed_work % 3 == 0;
            let crossed_half =
                completed_work * 2 >= total_work && (completed_work - 1) * 2 < total_work;
            every_third || crossed_half || remaining_work == 1
        }
        CheckpointFrequency::High => true,
    }
}

/// The checkpoint controller.
pub struct CheckpointController {
    pool: PgPool,
    bus: std::sync::Arc<EventBus>,
}

impl CheckpointController {
    pub fn new(pool: PgPool, bus: std::sync::Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Raise a checkpoint for a task and move it to `checkpoint_pending`.
    ///
    /// Silently declines (returns `Ok(None)`) when the task is already
    /// paused on a pending checkpoint, which dedupes double-triggers from
    /// the medium-frequency rule. A store-level unique violation from a
    /// concurrent raise maps to the same outcome.
    pub async fn raise(
        &self,
        task_id: Uuid,
        reason: CheckpointReason,
    ) -> CoreResult<Option<Checkpoint>> {
        if checkpoint_db::pending_for_task(&self.pool, task_id)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let snapshot = self.build_snapshot(task_id).await?;

        let checkpoint =
            match checkpoint_db::insert_checkpoint(&self.pool, task_id, reason, &snapshot).await {
                Ok(checkpoint) => checkpoint,
                Err(err) if checkpoint_db::is_unique_violation(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            };

        TaskStateMachine::transition(
            &self.pool,
            task_id,
            TaskStatus::Running,
            TaskStatus::CheckpointPending,
        )
        .await?;

        tracing::info!(
            task_id = %task_id,
            checkpoint_id = %checkpoint.id,
            reason = %reason,
            "checkpoint raised"
        );

        self.bus.publish(
            EventKind::CheckpointReady,
            Some(task_id),
            serde_json::json!({
                "checkpoint_id": checkpoint.id,
                "reason": reason,
                "snapshot": checkpoint.snapshot,
            }),
        );

        Ok(Some(checkpoint))
    }

    /// Approve a pending checkpoint: the task resumes.
    ///
    /// Approving an already-approved checkpoint is a no-op; any other
    /// decided state is a conflict.
    pub async fn approve(&self, checkpoint_id: Uuid, notes: Option<&str>) -> CoreResult<Checkpoint> {
        let checkpoint = self.get(checkpoint_id).await?;

        match checkpoint.status {
            CheckpointStatus::Approved => return Ok(checkpoint),
            CheckpointStatus::PendingReview => {}
            other => {
                return Err(CoreError::conflict(format!(
                    "checkpoint {checkpoint_id} is {other}, cannot approve"
                )));
            }
        }

        let rows = checkpoint_db::decide_checkpoint(
            &self.pool,
            checkpoint_id,
            CheckpointStatus::Approved,
            notes,
        )
        .await?;
        if rows == 0 {
            // Decided concurrently; re-read and report accordingly.
            let now = self.get(checkpoint_id).await?;
            if now.status == CheckpointStatus::Approved {
                return Ok(now);
            }
            return Err(CoreError::conflict(format!(
                "checkpoint {checkpoint_id} was decided concurrently"
            )));
        }

        TaskStateMachine::transition(
            &self.pool,
            checkpoint.task_id,
            TaskStatus::CheckpointPending,
            TaskStatus::Running,
        )
        .await?;

        self.bus.publish(
            EventKind::TaskUpdate,
            Some(checkpoint.task_id),
            serde_json::json!({ "status": TaskStatus::Running, "checkpoint_id": checkpoint_id }),
        );

        self.get(checkpoint_id).await
    }

    /// Reject a pending checkpoint: the task fails.
    ///
    /// Rejecting a non-pending checkpoint is a conflict.
    pub async fn reject(&self, checkpoint_id: Uuid, notes: Option<&str>) -> CoreResult<Checkpoint> {
        let checkpoint = self.get(checkpoint_id).await?;

        if checkpoint.status != CheckpointStatus::PendingReview {
            return Err(CoreError::conflict(format!(
                "checkpoint {} is {}, cannot reject",
                checkpoint_id, checkpoint.status
            )));
        }

        let rows = checkpoint_db::decide_checkpoint(
            &self.pool,
            checkpoint_id,
            CheckpointStatus::Rejected,
            notes,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "checkpoint {checkpoint_id} was decided concurrently"
            )));
        }

        TaskStateMachine::transition(
            &self.pool,
            checkpoint.task_id,
            TaskStatus::CheckpointPending,
            TaskStatus::Failed,
        )
        .await?;

        // Rejection is the one path on which progress resets.
        task_db::reset_task_progress(&self.pool, checkpoint.task_id).await?;

        self.bus.publish(
            EventKind::TaskFailed,
            Some(checkpoint.task_id),
            serde_json::json!({ "reason": "checkpoint_rejected", "checkpoint_id": checkpoint_id }),
        );

        self.get(checkpoint_id).await
    }

    /// Mark a pending checkpoint as corrected.
    ///
    /// Corrections are only accepted while the checkpoint is pending;
    /// anything else is a conflict. The caller (orchestrator) spawns the
    /// correction subtask and resumes the task.
    pub async fn mark_corrected(&self, checkpoint_id: Uuid, notes: Option<&str>) -> CoreResult<Checkpoint> {
        let checkpoint = self.get(checkpoint_id).await?;

        if checkpoint.status != CheckpointStatus::PendingReview {
            return Err(CoreError::conflict(format!(
                "checkpoint {} is {}, corrections are only accepted while pending review",
                checkpoint_id, checkpoint.status
            )));
        }

        let rows = checkpoint_db::decide_checkpoint(
            &self.pool,
            checkpoint_id,
            CheckpointStatus::Corrected,
            notes,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "checkpoint {checkpoint_id} was decided concurrently"
            )));
        }

        TaskStateMachine::transition(
            &self.pool,
            checkpoint.task_id,
            TaskStatus::CheckpointPending,
            TaskStatus::Running,
        )
        .await?;

        self.get(checkpoint_id).await
    }

    async fn get(&self, checkpoint_id: Uuid) -> CoreResult<Checkpoint> {
        checkpoint_db::get_checkpoint(&self.pool, checkpoint_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("checkpoint {checkpoint_id} not found"))
            })
    }

    /// Capture the task's current shape: completed subtasks, aggregate
    /// score, what runs next, and open issues.
    async fn build_snapshot(&self, task_id: Uuid) -> CoreResult<serde_json::Value> {
        let subtasks = subtask_db::list_subtasks_for_task(&self.pool, task_id).await?;
        let aggregate_score = evaluation_db::aggregate_for_task(&self.pool, task_id).await?;

        let completed: Vec<_> = subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .map(|s| serde_json::json!({ "id": s.id, "name": s.name, "score": s.score }))
            .collect();
        let next: Vec<_> = subtasks
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SubtaskStatus::Pending | SubtaskStatus::Ready | SubtaskStatus::Assigned
                )
            })
            .map(|s| serde_json::json!({ "id": s.id, "name": s.name }))
            .collect();
        let issues: Vec<_> = subtasks
            .iter()
            .filter_map(|s| {
                s.error
                    .as_ref()
                    .map(|error| serde_json::json!({ "subtask_id": s.id, "error": error }))
            })
            .collect();

        Ok(serde_json::json!({
            "completed_subtasks": completed,
            "aggregate_score": aggregate_score,
            "next_subtasks": next,
            "issues": issues,
        }))
    }
}

/// Whether an evaluation score is low enough to force a checkpoint.
pub fn low_score_trigger(overall: f64) -> bool {
    overall < 7.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_db::models::CheckpointFrequency::*;

    #[test]
    fn low_fires_only_with_one_remaining() {
        assert!(frequency_trigger(Low, 4, 5, 1));
        assert!(!frequency_trigger(Low, 3, 5, 2));
        assert!(!frequency_trigger(Low, 5, 5, 0));
    }

    #[test]
    fn low_single_subtask_dag_fires_before_completion() {
        // A one-subtask task: before its only subtask completes, one
        // remains, so the checkpoint fires exactly once.
        assert!(frequency_trigger(Low, 0, 1, 1));
    }

    #[test]
    fn medium_fires_every_third_completion() {
        assert!(frequency_trigger(Medium, 3, 10, 7));
        assert!(frequency_trigger(Medium, 6, 10, 4));
        assert!(!frequency_trigger(Medium, 4, 10, 6));
    }

    #[test]
    fn medium_fires_on_half_crossing() {
        // 5 of 10: crossing from 4 (below half) to 5 (at half).
        assert!(frequency_trigger(Medium, 5, 10, 5));
        // 7 of 10: already past half, no crossing.
        assert!(!frequency_trigger(Medium, 7, 10, 3));
    }

    #[test]
    fn medium_fires_with_one_remaining() {
        assert!(frequency_trigger(Medium, 9, 10, 1));
    }

    #[test]
    fn medium_zero_completed_does_not_fire_modulo() {
        assert!(!frequency_trigger(Medium, 0, 10, 10));
    }

    #[test]
    fn high_fires_always() {
        assert!(frequency_trigger(High, 1, 10, 9));
        assert!(frequency_trigger(High, 2, 10, 8));
        assert!(frequency_trigger(High, 10, 10, 0));
    }

    #[test]
    fn low_score_threshold() {
        assert!(low_score_trigger(6.9));
        assert!(!low_score_trigger(7.0));
        assert!(!low_score_trigger(9.5));
    }
}
