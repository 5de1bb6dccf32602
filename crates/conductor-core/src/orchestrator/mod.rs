//! The task orchestrator: owns the task lifecycle and sequences
//! decomposition, scheduling, evaluation, peer review, checkpoints, and
//! completion.
//!
//! One orchestrator instance serves every task; per-task serialization
//! happens in the scheduler's task-row transactions, never through a
//! global lock. External calls (workers, LLM, evaluators) are never made
//! while a store lock is held.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{
    CheckpointFrequency, CheckpointReason, CorrectionCategory, CorrectionOutcome, PrivacyLevel,
    ReviewDecision, Subtask, SubtaskKind, SubtaskStatus, Task, TaskStatus,
};
use conductor_db::queries::activity::{self, NewActivity};
use conductor_db::queries::checkpoints as checkpoint_db;
use conductor_db::queries::corrections as correction_db;
use conductor_db::queries::reviews as review_db;
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::tasks as task_db;
use conductor_db::queries::evaluations as evaluation_db;

use crate::checkpoint::{self, CheckpointController};
use crate::config::CoreConfig;
use crate::decompose::llm::LlmClient;
use crate::decompose::{Decomposer, DecomposeError, SubtaskSpec};
use crate::dispatch::{ResultStatus, WorkerChannels, WorkerMessage};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::evaluate::{self, EvaluatorPipeline};
use crate::events::{EventBus, EventKind};
use crate::registry::WorkerRegistry;
use crate::retry::{self, CircuitBreaker};
use crate::review::{self, ReviewAction, ReviewPolicy};
use crate::scheduler::DagScheduler;
use crate::state::{SubtaskStateMachine, TaskStateMachine};

/// Priority given to review and correction subtasks so they schedule
/// ahead of ordinary work.
const REVIEW_PRIORITY: i32 = 10;

/// A task submission.
#[derive(Debug, Clone)]
pub struct SubmitTask {
    pub description: String,
    pub requirements: Vec<String>,
    pub checkpoint_frequency: Option<CheckpointFrequency>,
    pub privacy: Option<PrivacyLevel>,
    pub preferred_tools: Vec<String>,
}

/// The orchestrator. Construct once, share via `Arc`.
pub struct Orchestrator {
    pool: PgPool,
    config: CoreConfig,
    bus: Arc<EventBus>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<DagScheduler>,
    channels: Arc<WorkerChannels>,
    checkpoints: CheckpointController,
    decomposer: Decomposer,
    pipeline: EvaluatorPipeline,
    review_policy: ReviewPolicy,
    /// Opens when the state store keeps failing; public operations then
    /// fail fast as unavailable until the cool-down elapses.
    store_breaker: CircuitBreaker,
}

impl Orchestrator {
    /// Wire up the engine from a pool, a validated config, and an
    /// optional LLM client for decomposition.
    pub fn new(
        pool: PgPool,
        config: CoreConfig,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.event_bus_replay_size));
        let channels = Arc::new(WorkerChannels::new(config.dispatch_ack_timeout));
        let registry = Arc::new(WorkerRegistry::new(
            pool.clone(),
            Arc::clone(&bus),
            config.heartbeat_loss_window,
        ));
        let scheduler = Arc::new(DagScheduler::new(
            pool.clone(),
            Arc::clone(&bus),
            Arc::clone(&channels),
            config.clone(),
        ));
        let checkpoints = CheckpointController::new(pool.clone(), Arc::clone(&bus));
        let decomposer = Decomposer::new(llm, config.llm_decomposition_timeout);
        let pipeline = evaluate::default_pipeline(&config)?;
        let review_policy = ReviewPolicy {
            max_cycles: config.peer_review_max_cycles,
            auto_fix_score_floor: config.auto_fix_score_floor,
        };

        Ok(Arc::new(Self {
            pool,
            config,
            bus,
            registry,
            scheduler,
            channels,
            checkpoints,
            decomposer,
            pipeline,
            review_policy,
            store_breaker: CircuitBreaker::new(
                retry::DEFAULT_BREAKER_THRESHOLD,
                retry::DEFAULT_BREAKER_COOLDOWN,
            ),
        }))
    }

    /// Fail fast while the store breaker is open.
    fn store_gate(&self) -> CoreResult<()> {
        if self.store_breaker.allow() {
            Ok(())
        } else {
            Err(CoreError::unavailable(
                "state store circuit breaker is open",
            ))
        }
    }

    /// Record an operation outcome against the store breaker.
    /// Infrastructure errors count as failures; domain errors (validation,
    /// conflicts, not-found) mean the store itself answered fine.
    fn note_store_result(&self, error: Option<&CoreError>) {
        match error {
            Some(e) if e.kind == ErrorKind::Infrastructure => {
                self.store_breaker.record_failure();
            }
            _ => self.store_breaker.record_success(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<WorkerChannels> {
        &self.channels
    }

    pub fn scheduler(&self) -> &Arc<DagScheduler> {
        &self.scheduler
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Submit a task: validate, persist, decompose, admit to the
    /// scheduler.
    pub async fn submit_task(self: &Arc<Self>, submit: SubmitTask) -> CoreResult<Task> {
        self.store_gate()?;
        let result = self.submit_task_inner(submit).await;
        self.note_store_result(result.as_ref().err());
        result
    }

    async fn submit_task_inner(self: &Arc<Self>, submit: SubmitTask) -> CoreResult<Task> {
        if submit.description.trim().is_empty() {
            return Err(CoreError::validation("task description must not be empty"));
        }

        let preferred_tools = serde_json::json!(submit.preferred_tools);
        let task = task_db::insert_task(
            &self.pool,
            &task_db::NewTask {
                description: &submit.description,
                checkpoint_frequency: submit
                    .checkpoint_frequency
                    .unwrap_or(self.config.checkpoint_frequency_default),
                privacy: submit.privacy.unwrap_or(PrivacyLevel::Normal),
                preferred_tools: &preferred_tools,
            },
        )
        .await?;

        TaskStateMachine::transition(
            &self.pool,
            task.id,
            TaskStatus::Pending,
            TaskStatus::Initializing,
        )
        .await?;
        self.emit_task_update(task.id, TaskStatus::Initializing);

        let specs = match self
            .decomposer
            .decompose(&submit.description, &submit.requirements, &submit.preferred_tools)
            .await
        {
            Ok(specs) => specs,
            Err(err @ DecomposeError::EmptyDescription) => {
                // Caller input was malformed; the task cannot start.
                TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Initializing,
                    TaskStatus::Failed,
                )
                .await?;
                return Err(CoreError::validation(err.to_string()));
            }
            Err(err) => {
                // The decomposer guarantees fallbacks; anything else here
                // is an engine bug surfaced as infrastructure.
                TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Initializing,
                    TaskStatus::Failed,
                )
                .await?;
                return Err(CoreError::infrastructure(format!(
                    "decomposition failed unexpectedly: {err}"
                )));
            }
        };

        self.persist_dag(task.id, &specs).await?;

        TaskStateMachine::transition(
            &self.pool,
            task.id,
            TaskStatus::Initializing,
            TaskStatus::Running,
        )
        .await?;
        self.emit_task_update(task.id, TaskStatus::Running);

        tracing::info!(
            task_id = %task.id,
            subtasks = specs.len(),
            "task admitted"
        );

        self.scheduler.admit(task.id).await?;

        self.get_task(task.id).await
    }

    /// Insert the decomposed subtasks and their dependency edges in one
    /// transaction.
    async fn persist_dag(&self, task_id: Uuid, specs: &[SubtaskSpec]) -> CoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::infrastructure(e.to_string()))?;

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let subtask = subtask_db::insert_subtask(
                &mut *tx,
                &subtask_db::NewSubtask {
                    task_id,
                    kind: SubtaskKind::Work,
                    name: &spec.name,
                    description: &spec.description,
                    recommended_tool: spec.recommended_tool.as_deref(),
                    complexity: spec.complexity,
                    priority: 0,
                    review_target: None,
                },
            )
            .await?;
            ids.push(subtask.id);
        }

        for (index, spec) in specs.iter().enumerate() {
            for &dep in &spec.depends_on {
                subtask_db::insert_dependency(&mut *tx, ids[index], ids[dep]).await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| CoreError::infrastructure(e.to_string()))?;
        Ok(())
    }

    /// Fetch a task or return not-found.
    pub async fn get_task(&self, task_id: Uuid) -> CoreResult<Task> {
        task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id} not found")))
    }

    /// Cancel a task. Idempotent: cancelling a cancelled task is a no-op;
    /// cancelling a completed or failed task is a conflict.
    pub async fn cancel_task(&self, task_id: Uuid) -> CoreResult<Task> {
        self.store_gate()?;
        let result = self.cancel_task_inner(task_id).await;
        self.note_store_result(result.as_ref().err());
        result
    }

    async fn cancel_task_inner(&self, task_id: Uuid) -> CoreResult<Task> {
        let task = self.get_task(task_id).await?;

        match task.status {
            TaskStatus::Cancelled => return Ok(task),
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(CoreError::conflict(format!(
                    "task {} is {}, cannot cancel",
                    task_id, task.status
                )));
            }
            _ => {}
        }

        // The status may move under us; retry the optimistic transition.
        let cancelled = retry::with_conflict_retry(|| {
            // Copy the shared reference so each retry future owns it.
            let this: &Self = self;
            async move {
                let current = this.get_task(task_id).await?;
                if current.status == TaskStatus::Cancelled {
                    return Ok(true);
                }
                if current.status.is_terminal() {
                    return Err(CoreError::conflict(format!(
                        "task {} is {}, cannot cancel",
                        task_id, current.status
                    )));
                }
                let rows = task_db::transition_task_status(
                    &this.pool,
                    task_id,
                    current.status,
                    TaskStatus::Cancelled,
                    None,
                    Some(Utc::now()),
                )
                .await?;
                Ok(rows > 0)
            }
        })
        .await?;

        if !cancelled {
            return Err(CoreError::conflict(format!(
                "task {task_id} kept changing during cancellation"
            )));
        }

        // Cancel outstanding subtasks and notify their workers.
        let in_flight = subtask_db::cancel_subtasks_for_task(&self.pool, task_id).await?;
        for subtask in &in_flight {
            if let Some(worker_id) = subtask.assigned_worker {
                self.channels.cancel(worker_id, subtask.id).await;
            }
            self.channels.clear_in_flight(subtask.id, subtask.attempt);
        }

        activity::insert_activity(
            &self.pool,
            &NewActivity {
                task_id: Some(task_id),
                subtask_id: None,
                worker_id: None,
                event_type: "task_cancelled".to_owned(),
                payload: serde_json::json!({ "cancelled_subtasks": in_flight.len() }),
            },
        )
        .await?;
        self.emit_task_update(task_id, TaskStatus::Cancelled);

        self.get_task(task_id).await
    }

    // -----------------------------------------------------------------------
    // Worker channel ingestion
    // -----------------------------------------------------------------------

    /// Route one message from the worker channel.
    pub async fn handle_worker_message(self: &Arc<Self>, message: WorkerMessage) -> CoreResult<()> {
        match message {
            WorkerMessage::Register {
                worker_id,
                machine_name,
                capabilities,
                residency,
            } => {
                self.store_gate()?;
                let result = self
                    .registry
                    .register(worker_id, &machine_name, &capabilities, residency)
                    .await;
                self.note_store_result(result.as_ref().err());
                result?;
                // A new worker may unblock starved ready subtasks.
                self.pump_running_tasks().await;
                Ok(())
            }
            WorkerMessage::Heartbeat {
                worker_id,
                resources,
            } => {
                self.store_gate()?;
                let result = self.registry.heartbeat(worker_id, resources).await;
                self.note_store_result(result.as_ref().err());
                result
            }
            WorkerMessage::TaskResult {
                subtask_id,
                attempt,
                status,
                output,
                error,
                fatal,
            } => {
                self.on_task_result(subtask_id, attempt, status, output, error, fatal)
                    .await
            }
        }
    }

    /// Apply a worker-reported result. Idempotent on `(subtask, attempt)`:
    /// stale attempts and results for already-terminal subtasks are
    /// dropped without effect.
    pub async fn on_task_result(
        self: &Arc<Self>,
        subtask_id: Uuid,
        attempt: i32,
        status: ResultStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        fatal: bool,
    ) -> CoreResult<()> {
        self.store_gate()?;
        let result = self
            .apply_task_result(subtask_id, attempt, status, output, error, fatal)
            .await;
        self.note_store_result(result.as_ref().err());
        result
    }

    async fn apply_task_result(
        self: &Arc<Self>,
        subtask_id: Uuid,
        attempt: i32,
        status: ResultStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        fatal: bool,
    ) -> CoreResult<()> {
        let subtask = subtask_db::get_subtask(&self.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} not found")))?;

        self.channels.clear_in_flight(subtask_id, attempt);

        if attempt != subtask.attempt {
            tracing::debug!(
                subtask_id = %subtask_id,
                reported = attempt,
                current = subtask.attempt,
                "dropping result for stale attempt"
            );
            return Ok(());
        }
        if !subtask.status.is_active() {
            // Re-applied result or a subtask reclaimed meanwhile.
            return Ok(());
        }

        // Workers report results only at the end; mark the run started if
        // the start message was never seen.
        if subtask.status == SubtaskStatus::Assigned {
            SubtaskStateMachine::start(&self.pool, subtask_id).await?;
        }

        match status {
            ResultStatus::Completed => {
                let output = output.unwrap_or_else(|| serde_json::json!({}));
                let outcome = self.scheduler.on_subtask_complete(subtask_id, &output).await?;
                self.after_completion(outcome.subtask).await?;
            }
            ResultStatus::Failed => {
                let reason = error.unwrap_or_else(|| "worker reported failure".to_owned());
                let outcome = self.scheduler.on_subtask_failed(subtask_id, &reason).await?;
                self.after_failure(outcome.subtask, fatal).await?;
            }
        }

        let task_id = subtask.task_id;
        self.scheduler.pump(task_id).await?;
        self.maybe_finish_task(task_id).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Post-completion pipeline
    // -----------------------------------------------------------------------

    async fn after_completion(self: &Arc<Self>, subtask: Subtask) -> CoreResult<()> {
        match subtask.kind {
            SubtaskKind::Work => self.after_work_completed(subtask).await,
            SubtaskKind::Review => self.after_review_completed(subtask).await,
            SubtaskKind::Correction => self.after_correction_completed(subtask).await,
        }
    }

    /// Work subtask done: evaluate, consult the review policy, then the
    /// checkpoint policy.
    async fn after_work_completed(self: &Arc<Self>, subtask: Subtask) -> CoreResult<()> {
        let score = self.evaluate_subtask(&subtask).await?;

        // Peer-review policy. An exhausted cycle budget escalates to a
        // human instead of spinning another review.
        if self.review_policy.should_review(subtask.complexity, score) {
            if self.review_policy.cycles_exhausted(subtask.review_cycles) {
                self.checkpoints
                    .raise(subtask.task_id, CheckpointReason::ReviewEscalation)
                    .await?;
            } else {
                self.spawn_review(&subtask).await?;
            }
        }

        // Low-score trigger.
        if let Some(score) = score
            && checkpoint::low_score_trigger(score)
        {
            self.checkpoints
                .raise(subtask.task_id, CheckpointReason::LowScore)
                .await?;
        }

        // Frequency trigger. The just-completed subtask counts as still
        // remaining so "one remains" fires on the final completion,
        // before the completion gate.
        let (total, remaining_after) =
            subtask_db::count_work(&self.pool, subtask.task_id).await?;
        let completed = total - remaining_after;
        if checkpoint::frequency_trigger(
            self.task_frequency(subtask.task_id).await?,
            completed,
            total,
            remaining_after + 1,
        ) {
            self.checkpoints
                .raise(subtask.task_id, CheckpointReason::Frequency)
                .await?;
        }

        Ok(())
    }

    /// Run the evaluator pipeline and persist the outcome.
    async fn evaluate_subtask(&self, subtask: &Subtask) -> CoreResult<Option<f64>> {
        let Some(outcome) = self.pipeline.run(subtask).await else {
            return Ok(None);
        };

        let dimension_scores = serde_json::json!(outcome.dimension_scores);
        let details = serde_json::json!({
            "issues": outcome.issues,
            "suggestions": outcome.suggestions,
        });
        evaluation_db::insert_evaluation(
            &self.pool,
            &evaluation_db::NewEvaluation {
                subtask_id: subtask.id,
                dimension_scores: &dimension_scores,
                overall: outcome.overall,
                details: &details,
            },
        )
        .await?;
        subtask_db::set_score(&self.pool, subtask.id, outcome.overall).await?;

        tracing::debug!(
            subtask_id = %subtask.id,
            overall = outcome.overall,
            "subtask evaluated"
        );

        Ok(Some(outcome.overall))
    }

    /// Spawn a review subtask for a completed work subtask.
    async fn spawn_review(&self, original: &Subtask) -> CoreResult<()> {
        let description = review::build_review_prompt(original);
        let review_subtask = subtask_db::insert_subtask(
            &self.pool,
            &subtask_db::NewSubtask {
                task_id: original.task_id,
                kind: SubtaskKind::Review,
                name: &format!("review-{}", original.name),
                description: &description,
                recommended_tool: original.recommended_tool.as_deref(),
                complexity: 2,
                priority: REVIEW_PRIORITY,
                review_target: Some(original.id),
            },
        )
        .await?;

        review_db::insert_review(
            &self.pool,
            &review_db::NewReview {
                subtask_id: original.id,
                review_subtask_id: review_subtask.id,
                reviewer_worker: None,
                author_worker: original.assigned_worker,
            },
        )
        .await?;

        // A review has no dependencies; promote it and let the pump at
        // the end of result handling dispatch it.
        self.scheduler.admit(original.task_id).await?;

        tracing::info!(
            subtask_id = %original.id,
            review_subtask_id = %review_subtask.id,
            cycle = original.review_cycles,
            "peer review spawned"
        );

        Ok(())
    }

    /// Review subtask done: parse the verdict and act on it.
    async fn after_review_completed(self: &Arc<Self>, review_subtask: Subtask) -> CoreResult<()> {
        let Some(record) =
            review_db::get_by_review_subtask(&self.pool, review_subtask.id).await?
        else {
            tracing::error!(
                review_subtask_id = %review_subtask.id,
                "review subtask has no review record"
            );
            return Ok(());
        };

        if let Some(reviewer) = review_subtask.assigned_worker {
            review_db::set_reviewer(&self.pool, record.id, reviewer).await?;
        }

        let original = subtask_db::get_subtask(&self.pool, record.subtask_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("reviewed subtask {} not found", record.subtask_id))
            })?;

        let verdict = review_subtask
            .output
            .as_ref()
            .and_then(review::parse_verdict);

        let Some(verdict) = verdict else {
            // An unreadable verdict goes to a human.
            review_db::record_verdict(
                &self.pool,
                record.id,
                0.0,
                &serde_json::json!([]),
                ReviewDecision::Escalate,
            )
            .await?;
            self.checkpoints
                .raise(original.task_id, CheckpointReason::PeerReviewIssues)
                .await?;
            return Ok(());
        };

        let issues = serde_json::json!(verdict.issues);
        let action = self.review_policy.decide(&verdict, original.review_cycles);

        match action {
            ReviewAction::Accept => {
                review_db::record_verdict(
                    &self.pool,
                    record.id,
                    verdict.score,
                    &issues,
                    ReviewDecision::Approved,
                )
                .await?;
                activity::insert_activity(
                    &self.pool,
                    &NewActivity {
                        task_id: Some(original.task_id),
                        subtask_id: Some(original.id),
                        worker_id: review_subtask.assigned_worker,
                        event_type: "review_accepted".to_owned(),
                        payload: serde_json::json!({ "score": verdict.score }),
                    },
                )
                .await?;
            }
            ReviewAction::Correct => {
                review_db::record_verdict(
                    &self.pool,
                    record.id,
                    verdict.score,
                    &issues,
                    ReviewDecision::NeedsRevision,
                )
                .await?;
                let guidance = verdict
                    .suggested_fix
                    .clone()
                    .unwrap_or_else(|| "Address the issues raised by the review.".to_owned());
                self.spawn_correction(&original, None, CorrectionCategory::Bug, &guidance)
                    .await?;
            }
            ReviewAction::Checkpoint => {
                review_db::record_verdict(
                    &self.pool,
                    record.id,
                    verdict.score,
                    &issues,
                    ReviewDecision::Escalate,
                )
                .await?;
                self.checkpoints
                    .raise(original.task_id, CheckpointReason::PeerReviewIssues)
                    .await?;
            }
        }

        Ok(())
    }

    /// Spawn a correction subtask targeting the original author.
    async fn spawn_correction(
        &self,
        original: &Subtask,
        checkpoint_id: Option<Uuid>,
        category: CorrectionCategory,
        guidance: &str,
    ) -> CoreResult<()> {
        let rows = subtask_db::begin_correcting(&self.pool, original.id).await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "subtask {} is not completed; cannot correct",
                original.id
            )));
        }

        correction_db::insert_correction(
            &self.pool,
            &correction_db::NewCorrection {
                checkpoint_id,
                subtask_id: original.id,
                category,
                guidance,
                retry_index: original.review_cycles,
                learning_mode: false,
            },
        )
        .await?;

        let description = review::build_correction_prompt(original, guidance);
        let correction_subtask = subtask_db::insert_subtask(
            &self.pool,
            &subtask_db::NewSubtask {
                task_id: original.task_id,
                kind: SubtaskKind::Correction,
                name: &format!("correct-{}", original.name),
                description: &description,
                recommended_tool: original.recommended_tool.as_deref(),
                complexity: original.complexity,
                priority: REVIEW_PRIORITY,
                review_target: Some(original.id),
            },
        )
        .await?;

        self.scheduler.admit(original.task_id).await?;

        tracing::info!(
            subtask_id = %original.id,
            correction_subtask_id = %correction_subtask.id,
            "correction spawned"
        );

        Ok(())
    }

    /// Correction subtask done: fold the output back into the original
    /// and re-enter the review loop with the cycle count incremented.
    async fn after_correction_completed(
        self: &Arc<Self>,
        correction_subtask: Subtask,
    ) -> CoreResult<()> {
        let Some(original_id) = correction_subtask.review_target else {
            tracing::error!(
                subtask_id = %correction_subtask.id,
                "correction subtask has no target"
            );
            return Ok(());
        };

        let output = correction_subtask
            .output
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        subtask_db::finish_correcting(&self.pool, original_id, &output).await?;
        subtask_db::bump_review_cycles(&self.pool, original_id).await?;

        // Resolve the pending correction record for this target.
        let corrections = correction_db::list_for_subtask(&self.pool, original_id).await?;
        if let Some(pending) = corrections
            .iter()
            .rev()
            .find(|c| c.outcome == CorrectionOutcome::Pending)
        {
            correction_db::resolve_correction(&self.pool, pending.id, CorrectionOutcome::Success)
                .await?;
        }

        let original = subtask_db::get_subtask(&self.pool, original_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("corrected subtask {original_id} not found"))
            })?;

        if self.review_policy.cycles_exhausted(original.review_cycles) {
            // The cycle budget is spent; a human decides.
            self.checkpoints
                .raise(original.task_id, CheckpointReason::ReviewEscalation)
                .await?;
        } else {
            self.spawn_review(&original).await?;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    /// A subtask failed. Fatal failures and exhausted budgets fail the
    /// task once everything else drains; transient failures schedule a
    /// backoff retry.
    async fn after_failure(self: &Arc<Self>, subtask: Subtask, fatal: bool) -> CoreResult<()> {
        let retries_left = !fatal && subtask.retries < self.config.retry_max_attempts as i32;

        if retries_left {
            let delay = retry::subtask_backoff(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                subtask.retries as u32,
            );
            tracing::info!(
                subtask_id = %subtask.id,
                retries = subtask.retries,
                delay_secs = delay.as_secs(),
                "scheduling subtask retry"
            );
            self.schedule_retry(subtask.id, subtask.task_id, delay);
        } else {
            tracing::warn!(
                subtask_id = %subtask.id,
                fatal,
                retries = subtask.retries,
                "subtask failed permanently"
            );
            activity::insert_activity(
                &self.pool,
                &NewActivity {
                    task_id: Some(subtask.task_id),
                    subtask_id: Some(subtask.id),
                    worker_id: subtask.assigned_worker,
                    event_type: "subtask_failed".to_owned(),
                    payload: serde_json::json!({
                        "fatal": fatal,
                        "retries": subtask.retries,
                        "error": subtask.error,
                    }),
                },
            )
            .await?;
        }

        Ok(())
    }

    /// Requeue a failed subtask after its backoff delay.
    fn schedule_retry(self: &Arc<Self>, subtask_id: Uuid, task_id: Uuid, delay: Duration) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = async {
                SubtaskStateMachine::retry(
                    &orchestrator.pool,
                    subtask_id,
                    orchestrator.config.retry_max_attempts,
                )
                .await?;
                orchestrator.scheduler.pump(task_id).await?;
                Ok::<_, CoreError>(())
            }
            .await;

            if let Err(error) = result {
                tracing::warn!(
                    subtask_id = %subtask_id,
                    %error,
                    "retry requeue failed"
                );
                // The task may have been cancelled or the subtask raced a
                // reclaim; the drain check keeps the task consistent.
                let _ = orchestrator.maybe_finish_task(task_id).await;
            }
        });
    }

    // -----------------------------------------------------------------------
    // Completion / failure gates
    // -----------------------------------------------------------------------

    /// Complete or fail the task when its subtasks have drained.
    pub async fn maybe_finish_task(&self, task_id: Uuid) -> CoreResult<()> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Ok(());
        }

        let progress = task_db::get_task_progress(&self.pool, task_id).await?;
        if !progress.is_drained() {
            return Ok(());
        }

        // Retries still pending keep failed subtasks out of the drain
        // condition via their scheduled requeue; a failed subtask that
        // still has budget is not a task failure yet.
        if progress.failed > 0 {
            let subtasks = subtask_db::list_subtasks_for_task(&self.pool, task_id).await?;
            let budget_left = subtasks.iter().any(|s| {
                s.status == SubtaskStatus::Failed
                    && s.error.as_deref() != Some("task cancelled")
                    && s.retries < self.config.retry_max_attempts as i32
            });
            if budget_left {
                return Ok(());
            }

            TaskStateMachine::transition(
                &self.pool,
                task_id,
                TaskStatus::Running,
                TaskStatus::Failed,
            )
            .await?;
            self.bus.publish(
                EventKind::TaskFailed,
                Some(task_id),
                serde_json::json!({ "failed_subtasks": progress.failed }),
            );
            return Ok(());
        }

        TaskStateMachine::transition(
            &self.pool,
            task_id,
            TaskStatus::Running,
            TaskStatus::Completed,
        )
        .await?;
        self.bus.publish(
            EventKind::TaskComplete,
            Some(task_id),
            serde_json::json!({ "progress": progress.percent() }),
        );
        tracing::info!(task_id = %task_id, "task completed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoint decisions
    // -----------------------------------------------------------------------

    /// Approve a checkpoint and resume scheduling.
    pub async fn approve_checkpoint(
        self: &Arc<Self>,
        checkpoint_id: Uuid,
        notes: Option<&str>,
    ) -> CoreResult<conductor_db::models::Checkpoint> {
        self.store_gate()?;
        let result = self.approve_checkpoint_inner(checkpoint_id, notes).await;
        self.note_store_result(result.as_ref().err());
        result
    }

    async fn approve_checkpoint_inner(
        self: &Arc<Self>,
        checkpoint_id: Uuid,
        notes: Option<&str>,
    ) -> CoreResult<conductor_db::models::Checkpoint> {
        let checkpoint = self.checkpoints.approve(checkpoint_id, notes).await?;
        self.scheduler.pump(checkpoint.task_id).await?;
        self.maybe_finish_task(checkpoint.task_id).await?;
        Ok(checkpoint)
    }

    /// Reject a checkpoint; the task fails.
    pub async fn reject_checkpoint(
        &self,
        checkpoint_id: Uuid,
        notes: Option<&str>,
    ) -> CoreResult<conductor_db::models::Checkpoint> {
        self.store_gate()?;
        let result = self.reject_checkpoint_inner(checkpoint_id, notes).await;
        self.note_store_result(result.as_ref().err());
        result
    }

    async fn reject_checkpoint_inner(
        &self,
        checkpoint_id: Uuid,
        notes: Option<&str>,
    ) -> CoreResult<conductor_db::models::Checkpoint> {
        let checkpoint = self.checkpoints.reject(checkpoint_id, notes).await?;

        // Cancel whatever was still outstanding.
        let in_flight =
            subtask_db::cancel_subtasks_for_task(&self.pool, checkpoint.task_id).await?;
        for subtask in &in_flight {
            if let Some(worker_id) = subtask.assigned_worker {
                self.channels.cancel(worker_id, subtask.id).await;
            }
            self.channels.clear_in_flight(subtask.id, subtask.attempt);
        }

        Ok(checkpoint)
    }

    /// Submit corrective guidance against a subtask inside a pending
    /// checkpoint. The correction re-enters the scheduler targeted at the
    /// original author; the task resumes.
    pub async fn correct_checkpoint(
        self: &Arc<Self>,
        checkpoint_id: Uuid,
        subtask_id: Uuid,
        category: CorrectionCategory,
        guidance: &str,
    ) -> CoreResult<conductor_db::models::Checkpoint> {
        self.store_gate()?;
        let result = self
            .correct_checkpoint_inner(checkpoint_id, subtask_id, category, guidance)
            .await;
        self.note_store_result(result.as_ref().err());
        result
    }

    async fn correct_checkpoint_inner(
        self: &Arc<Self>,
        checkpoint_id: Uuid,
        subtask_id: Uuid,
        category: CorrectionCategory,
        guidance: &str,
    ) -> CoreResult<conductor_db::models::Checkpoint> {
        if guidance.trim().is_empty() {
            return Err(CoreError::validation("correction guidance must not be empty"));
        }

        let subtask = subtask_db::get_subtask(&self.pool, subtask_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subtask {subtask_id} not found")))?;
        let checkpoint = checkpoint_db::get_checkpoint(&self.pool, checkpoint_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("checkpoint {checkpoint_id} not found"))
            })?;

        if subtask.task_id != checkpoint.task_id {
            return Err(CoreError::validation(format!(
                "subtask {subtask_id} does not belong to checkpoint {checkpoint_id}'s task"
            )));
        }
        if subtask.status != SubtaskStatus::Completed {
            return Err(CoreError::conflict(format!(
                "subtask {} is {}, only completed subtasks can be corrected",
                subtask_id, subtask.status
            )));
        }

        // Conflict for decided checkpoints happens here, before any side
        // effects on the subtask.
        let checkpoint = self.checkpoints.mark_corrected(checkpoint_id, None).await?;

        self.spawn_correction(&subtask, Some(checkpoint_id), category, guidance)
            .await?;
        self.scheduler.pump(checkpoint.task_id).await?;
        Ok(checkpoint)
    }

    // -----------------------------------------------------------------------
    // Background maintenance
    // -----------------------------------------------------------------------

    /// Run the background loops until cancelled: the worker liveness
    /// sweeper, the execution-timeout sweep, and a periodic pump that
    /// retries starved ready subtasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let sweeper = {
            let orchestrator = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let registry = Arc::clone(orchestrator.registry());
                registry
                    .run_sweeper(cancel, |lost| {
                        let orchestrator = Arc::clone(&orchestrator);
                        async move {
                            for worker_id in lost {
                                orchestrator.handle_worker_loss(worker_id).await;
                            }
                        }
                    })
                    .await;
            })
        };

        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pump_running_tasks().await;
                    if let Err(error) = self.sweep_stuck_subtasks().await {
                        tracing::error!(%error, "stuck-subtask sweep failed");
                    }
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }

        let _ = sweeper.await;
    }

    /// Reclaim and re-dispatch after a worker loss.
    pub async fn handle_worker_loss(self: &Arc<Self>, worker_id: Uuid) {
        self.channels.detach(worker_id).await;

        match self.scheduler.on_worker_lost(worker_id).await {
            Ok(reclaimed) => {
                let mut task_ids: Vec<Uuid> =
                    reclaimed.iter().map(|s| s.task_id).collect();
                task_ids.sort();
                task_ids.dedup();
                for task_id in task_ids {
                    if let Err(error) = self.scheduler.pump(task_id).await {
                        tracing::error!(task_id = %task_id, %error, "re-pump after worker loss failed");
                    }
                }
            }
            Err(error) => {
                tracing::error!(worker_id = %worker_id, %error, "worker-loss reclaim failed");
            }
        }
    }

    /// Pump every running task once.
    async fn pump_running_tasks(&self) {
        let running = match task_db::list_tasks(&self.pool, Some(TaskStatus::Running), 500, 0).await
        {
            Ok(tasks) => tasks,
            Err(error) => {
                tracing::error!(%error, "failed to list running tasks for pump");
                return;
            }
        };
        for task in running {
            if let Err(error) = self.scheduler.pump(task.id).await {
                tracing::error!(task_id = %task.id, %error, "periodic pump failed");
            }
        }
    }

    /// Fail running subtasks that exceeded the execution timeout; they
    /// re-enter through the transient-retry path.
    async fn sweep_stuck_subtasks(self: &Arc<Self>) -> CoreResult<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.subtask_execution_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let stuck = subtask_db::list_stuck_running(&self.pool, cutoff).await?;

        for subtask in stuck {
            tracing::warn!(
                subtask_id = %subtask.id,
                "subtask exceeded execution timeout"
            );
            if let Some(worker_id) = subtask.assigned_worker {
                self.channels.cancel(worker_id, subtask.id).await;
            }
            self.channels.clear_in_flight(subtask.id, subtask.attempt);
            let outcome = self
                .scheduler
                .on_subtask_failed(subtask.id, "execution timeout exceeded")
                .await?;
            self.after_failure(outcome.subtask, false).await?;
            self.maybe_finish_task(subtask.task_id).await?;
        }
        Ok(())
    }

    async fn task_frequency(&self, task_id: Uuid) -> CoreResult<CheckpointFrequency> {
        Ok(self.get_task(task_id).await?.checkpoint_frequency)
    }

    fn emit_task_update(&self, task_id: Uuid, status: TaskStatus) {
        self.bus.publish(
            EventKind::TaskUpdate,
            Some(task_id),
            serde_json::json!({ "status": status }),
        );
    }
}
