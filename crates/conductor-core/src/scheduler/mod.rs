//! DAG-aware scheduler: promotes ready subtasks, selects workers, and
//! dispatches through the worker channel.
//!
//! Per-task mutations run inside a transaction that first locks the task
//! row (`SELECT .. FOR UPDATE`), so concurrent completions, promotions,
//! and progress recomputation serialize per task without a global lock.
//! No lock is held across a dispatch to a worker: dispatching happens
//! after the transaction commits.

pub mod selection;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{Subtask, SubtaskKind, SubtaskStatus, Task, WorkerStatus};
use conductor_db::queries::activity::{self, NewActivity};
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::tasks as task_db;
use conductor_db::queries::workers as worker_db;

use crate::config::CoreConfig;
use crate::dispatch::{CoreMessage, WorkerChannels};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventKind};
use selection::{Candidate, Request};

/// Outcome of recording a subtask completion or failure.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub subtask: Subtask,
    /// Task progress percentage after the transition.
    pub progress: i32,
    /// Subtasks promoted to ready by this transition.
    pub newly_ready: Vec<Subtask>,
    /// Whether every subtask of the task has drained.
    pub drained: bool,
}

pub struct DagScheduler {
    pool: PgPool,
    bus: Arc<EventBus>,
    channels: Arc<WorkerChannels>,
    config: CoreConfig,
}

impl DagScheduler {
    pub fn new(
        pool: PgPool,
        bus: Arc<EventBus>,
        channels: Arc<WorkerChannels>,
        config: CoreConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            channels,
            config,
        }
    }

    /// Admit a freshly decomposed task: promote its initial ready set and
    /// dispatch what can be dispatched.
    pub async fn admit(&self, task_id: Uuid) -> CoreResult<usize> {
        let mut tx = self.pool.begin().await.context("failed to begin admit tx")?;
        task_db::lock_task(&mut *tx, task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id} not found")))?;
        let promoted = subtask_db::promote_ready(&mut *tx, task_id).await?;
        tx.commit().await.context("failed to commit admit tx")?;

        for subtask in &promoted {
            self.emit_subtask_update(subtask.task_id, subtask.id, SubtaskStatus::Ready);
        }

        self.pump(task_id).await
    }

    /// Dispatch as many ready subtasks as eligible workers allow.
    ///
    /// Returns the number of subtasks dispatched. Subtasks with no
    /// eligible worker stay ready; an activity-log row records the first
    /// starvation per pump so operators can see why nothing moves.
    pub async fn pump(&self, task_id: Uuid) -> CoreResult<usize> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id} not found")))?;

        // Only running tasks schedule; checkpoint-paused and terminal
        // tasks keep their ready set frozen.
        if task.status != conductor_db::models::TaskStatus::Running {
            return Ok(0);
        }

        let ready = subtask_db::get_ready_subtasks(&self.pool, task_id).await?;
        if ready.is_empty() {
            return Ok(0);
        }

        let mut candidates = self.load_candidates().await?;
        let mut dispatched = 0;
        let mut starved_logged = false;

        for subtask in ready {
            match self.dispatch_one(&task, &subtask, &mut candidates).await? {
                true => dispatched += 1,
                false if !starved_logged => {
                    starved_logged = true;
                    activity::insert_activity(
                        &self.pool,
                        &NewActivity {
                            task_id: Some(task_id),
                            subtask_id: Some(subtask.id),
                            worker_id: None,
                            event_type: "no_eligible_workers".to_owned(),
                            payload: serde_json::json!({
                                "subtask": subtask.name,
                                "recommended_tool": subtask.recommended_tool,
                            }),
                        },
                    )
                    .await?;
                    self.bus.publish(
                        EventKind::ActivityLog,
                        Some(task_id),
                        serde_json::json!({
                            "event": "no_eligible_workers",
                            "subtask_id": subtask.id,
                        }),
                    );
                }
                false => {}
            }
        }

        Ok(dispatched)
    }

    /// Candidate snapshot: live workers with spare concurrency.
    async fn load_candidates(&self) -> CoreResult<Vec<Candidate>> {
        let workers = worker_db::list_live_workers(&self.pool).await?;
        let loads: HashMap<Uuid, i64> = subtask_db::current_loads(&self.pool)
            .await?
            .into_iter()
            .collect();

        Ok(workers
            .iter()
            .filter(|worker| {
                let load = loads.get(&worker.id).copied().unwrap_or(0);
                (load as usize) < self.config.max_concurrent_subtasks_per_worker
            })
            .map(|worker| {
                Candidate::from_worker(worker, loads.get(&worker.id).copied().unwrap_or(0))
            })
            .collect())
    }

    /// Try to dispatch one subtask. Returns whether it was dispatched.
    async fn dispatch_one(
        &self,
        task: &Task,
        subtask: &Subtask,
        candidates: &mut Vec<Candidate>,
    ) -> CoreResult<bool> {
        let acceptable = preferred_tools(task);
        let excluded = self.exclusions_for(subtask).await?;

        let request = Request {
            recommended_tool: subtask.recommended_tool.as_deref(),
            acceptable_tools: &acceptable,
            privacy: Some(task.privacy),
            excluded: &excluded,
        };

        // Corrections go back to the original author when that worker is
        // still a viable candidate.
        let preferred_author = if subtask.kind == SubtaskKind::Correction {
            match subtask.review_target {
                Some(target_id) => subtask_db::get_subtask(&self.pool, target_id)
                    .await?
                    .and_then(|t| t.assigned_worker)
                    .filter(|author| {
                        candidates
                            .iter()
                            .any(|c| c.id == *author && selection::score(c, &request).is_some())
                    }),
                None => None,
            }
        } else {
            None
        };

        let selected = preferred_author.or_else(|| {
            selection::select(candidates, &request).map(|c| c.id)
        });
        let Some(worker_id) = selected else {
            return Ok(false);
        };

        // Assign in the store first; the dispatch goes out after.
        let rows = subtask_db::assign_subtask(&self.pool, subtask.id, worker_id).await?;
        if rows == 0 {
            // Someone else moved it; skip quietly.
            return Ok(false);
        }

        let assigned = subtask_db::get_subtask(&self.pool, subtask.id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {} vanished", subtask.id)))?;

        let context = self.build_context(task, subtask).await?;
        let message = CoreMessage::ExecuteTask {
            subtask_id: subtask.id,
            attempt: assigned.attempt,
            tool: subtask.recommended_tool.clone(),
            instructions: subtask.description.clone(),
            context,
        };

        if let Err(err) = self
            .channels
            .dispatch(worker_id, subtask.id, assigned.attempt, message)
            .await
        {
            tracing::warn!(
                subtask_id = %subtask.id,
                worker_id = %worker_id,
                error = %err,
                "dispatch failed, returning subtask to ready"
            );
            subtask_db::transition_subtask_status(
                &self.pool,
                subtask.id,
                SubtaskStatus::Assigned,
                SubtaskStatus::Ready,
            )
            .await?;
            // Drop the dead worker from this pump's candidate set.
            candidates.retain(|candidate| candidate.id != worker_id);
            return Ok(false);
        }

        tracing::info!(
            subtask_id = %subtask.id,
            subtask_name = %subtask.name,
            worker_id = %worker_id,
            attempt = assigned.attempt,
            "subtask dispatched"
        );

        // Track the new load locally and flip the worker to busy at the
        // concurrency limit.
        if let Some(candidate) = candidates.iter_mut().find(|c| c.id == worker_id) {
            candidate.load += 1;
            if candidate.load as usize >= self.config.max_concurrent_subtasks_per_worker {
                worker_db::transition_worker_status(
                    &self.pool,
                    worker_id,
                    WorkerStatus::Online,
                    WorkerStatus::Busy,
                )
                .await?;
                self.emit_worker_update(worker_id, WorkerStatus::Busy);
                candidates.retain(|c| c.id != worker_id);
            }
        }

        self.emit_subtask_update(subtask.task_id, subtask.id, SubtaskStatus::Assigned);
        Ok(true)
    }

    /// Workers excluded from taking this subtask.
    ///
    /// A review must not go to the original author while another live
    /// worker exists; the exclusion is waived when the author is the only
    /// worker left.
    async fn exclusions_for(&self, subtask: &Subtask) -> CoreResult<Vec<Uuid>> {
        if subtask.kind != SubtaskKind::Review {
            return Ok(vec![]);
        }
        let Some(target_id) = subtask.review_target else {
            return Ok(vec![]);
        };
        let target = subtask_db::get_subtask(&self.pool, target_id).await?;
        let author = target.and_then(|t| t.assigned_worker);

        // Waive the exclusion when the author is the only live worker.
        if let Some(author) = author {
            let live = worker_db::list_live_workers(&self.pool).await?;
            let others_exist = live.iter().any(|worker| worker.id != author);
            if others_exist {
                return Ok(vec![author]);
            }
        }
        Ok(vec![])
    }

    /// Context blob shipped with an execute message: the parent task plus
    /// completed dependency outputs.
    async fn build_context(&self, task: &Task, subtask: &Subtask) -> CoreResult<serde_json::Value> {
        let dep_ids = subtask_db::get_dependencies(&self.pool, subtask.id).await?;
        let mut dependencies = Vec::with_capacity(dep_ids.len());
        for dep_id in dep_ids {
            if let Some(dep) = subtask_db::get_subtask(&self.pool, dep_id).await? {
                dependencies.push(serde_json::json!({
                    "name": dep.name,
                    "output": dep.output,
                }));
            }
        }

        Ok(serde_json::json!({
            "task_id": task.id,
            "task_description": task.description,
            "privacy": task.privacy,
            "dependencies": dependencies,
        }))
    }

    /// Record a successful completion: move the subtask to done, promote
    /// newly-ready successors, and recompute progress — all under the
    /// task row lock.
    pub async fn on_subtask_complete(
        &self,
        subtask_id: Uuid,
        output: &serde_json::Value,
    ) -> CoreResult<CompletionOutcome> {
        let subtask = subtask_db::get_subtask(&self.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} not found")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin completion tx")?;
        task_db::lock_task(&mut *tx, subtask.task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {} not found", subtask.task_id)))?;

        let rows = subtask_db::complete_subtask(&mut *tx, subtask_id, output).await?;
        if rows == 0 {
            // Result for a subtask that is not running: stale or replayed.
            tx.rollback().await.ok();
            return Err(CoreError::conflict(format!(
                "subtask {subtask_id} is not running; completion not applied"
            )));
        }

        let newly_ready = subtask_db::promote_ready(&mut *tx, subtask.task_id).await?;
        let progress = task_db::get_task_progress(&mut *tx, subtask.task_id).await?;
        task_db::set_task_progress(&mut *tx, subtask.task_id, progress.percent()).await?;

        tx.commit().await.context("failed to commit completion tx")?;

        self.emit_subtask_update(subtask.task_id, subtask_id, SubtaskStatus::Completed);
        for ready in &newly_ready {
            self.emit_subtask_update(subtask.task_id, ready.id, SubtaskStatus::Ready);
        }
        self.bus.publish(
            EventKind::TaskUpdate,
            Some(subtask.task_id),
            serde_json::json!({ "progress": progress.percent() }),
        );

        self.refresh_worker_after_release(subtask.assigned_worker).await?;

        let subtask = subtask_db::get_subtask(&self.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} vanished")))?;

        Ok(CompletionOutcome {
            subtask,
            progress: progress.percent(),
            newly_ready,
            drained: progress.is_drained(),
        })
    }

    /// Record a failure. The caller decides between retry and task
    /// failure based on the returned subtask's retry budget.
    pub async fn on_subtask_failed(
        &self,
        subtask_id: Uuid,
        error: &str,
    ) -> CoreResult<CompletionOutcome> {
        let subtask = subtask_db::get_subtask(&self.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} not found")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin failure tx")?;
        task_db::lock_task(&mut *tx, subtask.task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {} not found", subtask.task_id)))?;

        let rows = subtask_db::fail_subtask(&mut *tx, subtask_id, error).await?;
        if rows == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::conflict(format!(
                "subtask {subtask_id} is not running; failure not applied"
            )));
        }

        let progress = task_db::get_task_progress(&mut *tx, subtask.task_id).await?;
        task_db::set_task_progress(&mut *tx, subtask.task_id, progress.percent()).await?;
        tx.commit().await.context("failed to commit failure tx")?;

        self.emit_subtask_update(subtask.task_id, subtask_id, SubtaskStatus::Failed);
        self.refresh_worker_after_release(subtask.assigned_worker).await?;

        let subtask = subtask_db::get_subtask(&self.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} vanished")))?;

        Ok(CompletionOutcome {
            subtask,
            progress: progress.percent(),
            newly_ready: vec![],
            drained: progress.is_drained(),
        })
    }

    /// Reclaim every in-flight subtask of a lost worker back to ready.
    ///
    /// Returns the reclaimed subtasks; the caller re-pumps their tasks.
    pub async fn on_worker_lost(&self, worker_id: Uuid) -> CoreResult<Vec<Subtask>> {
        let reclaimed = subtask_db::reclaim_for_worker(&self.pool, worker_id).await?;

        self.channels
            .clear_in_flight_many(reclaimed.iter().map(|s| (s.id, s.attempt)));

        for subtask in &reclaimed {
            activity::insert_activity(
                &self.pool,
                &NewActivity {
                    task_id: Some(subtask.task_id),
                    subtask_id: Some(subtask.id),
                    worker_id: Some(worker_id),
                    event_type: "subtask_reclaimed".to_owned(),
                    payload: serde_json::json!({
                        "subtask": subtask.name,
                        "retries": subtask.retries,
                    }),
                },
            )
            .await?;
            self.emit_subtask_update(subtask.task_id, subtask.id, SubtaskStatus::Ready);
        }

        if !reclaimed.is_empty() {
            tracing::warn!(
                worker_id = %worker_id,
                count = reclaimed.len(),
                "reclaimed subtasks from lost worker"
            );
        }

        Ok(reclaimed)
    }

    /// Flip a busy worker back to online once it sheds load.
    async fn refresh_worker_after_release(&self, worker_id: Option<Uuid>) -> CoreResult<()> {
        let Some(worker_id) = worker_id else {
            return Ok(());
        };
        let load = subtask_db::current_load_for(&self.pool, worker_id).await?;
        if (load as usize) < self.config.max_concurrent_subtasks_per_worker {
            let rows = worker_db::transition_worker_status(
                &self.pool,
                worker_id,
                WorkerStatus::Busy,
                WorkerStatus::Online,
            )
            .await?;
            if rows > 0 {
                self.emit_worker_update(worker_id, WorkerStatus::Online);
            }
        }
        Ok(())
    }

    fn emit_subtask_update(&self, task_id: Uuid, subtask_id: Uuid, status: SubtaskStatus) {
        self.bus.publish(
            EventKind::SubtaskUpdate,
            Some(task_id),
            serde_json::json!({ "subtask_id": subtask_id, "status": status }),
        );
    }

    fn emit_worker_update(&self, worker_id: Uuid, status: WorkerStatus) {
        self.bus.publish(
            EventKind::WorkerUpdate,
            None,
            serde_json::json!({ "worker_id": worker_id, "status": status }),
        );
    }
}

/// The task's preferred tool set, parsed from its JSON column.
pub fn preferred_tools(task: &Task) -> Vec<String> {
    task.preferred_tools
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_db::models::{CheckpointFrequency, PrivacyLevel, TaskStatus};

    #[test]
    fn preferred_tools_parses_array() {
        let task = Task {
            id: Uuid::new_v4(),
            description: "x".to_owned(),
            checkpoint_frequency: CheckpointFrequency::Low,
            privacy: PrivacyLevel::Normal,
            preferred_tools: serde_json::json!(["claude", "gemini"]),
            status: TaskStatus::Running,
            progress: 0,
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert_eq!(preferred_tools(&task), vec!["claude", "gemini"]);
    }

    #[test]
    fn preferred_tools_tolerates_malformed_column() {
        let task = Task {
            id: Uuid::new_v4(),
            description: "x".to_owned(),
            checkpoint_frequency: CheckpointFrequency::Low,
            privacy: PrivacyLevel::Normal,
            preferred_tools: serde_json::json!("claude"),
            status: TaskStatus::Running,
            progress: 0,
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(preferred_tools(&task).is_empty());
    }
}
