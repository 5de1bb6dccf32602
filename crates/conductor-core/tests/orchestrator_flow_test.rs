//! End-to-end orchestration tests: submit -> decompose -> dispatch ->
//! evaluate -> review -> checkpoint -> complete, driven through an
//! in-process worker channel against a containerized PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use conductor_core::CoreConfig;
use conductor_core::dispatch::{CoreMessage, ResourceSnapshot, ResultStatus, WorkerMessage};
use conductor_core::events::{EventKind, Topic};
use conductor_core::orchestrator::{Orchestrator, SubmitTask};
use conductor_db::models::{
    CheckpointFrequency, CheckpointReason, ReviewDecision, SubtaskKind, SubtaskStatus,
    TaskStatus, WorkerResidency, WorkerStatus,
};
use conductor_db::queries::activity as activity_db;
use conductor_db::queries::checkpoints as checkpoint_db;
use conductor_db::queries::reviews as review_db;
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::workers as worker_db;

use conductor_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

struct TestWorker {
    id: Uuid,
    rx: mpsc::Receiver<CoreMessage>,
}

async fn spawn_worker(
    orchestrator: &Arc<Orchestrator>,
    machine: &str,
    tools: &[&str],
) -> TestWorker {
    let id = Uuid::new_v4();
    let rx = orchestrator.channels().attach(id).await;
    orchestrator
        .handle_worker_message(WorkerMessage::Register {
            worker_id: id,
            machine_name: machine.to_owned(),
            capabilities: tools.iter().map(|t| t.to_string()).collect(),
            residency: WorkerResidency::Remote,
        })
        .await
        .expect("registration should succeed");
    TestWorker { id, rx }
}

/// Receive the next execute message, failing the test after a timeout.
async fn next_execute(worker: &mut TestWorker) -> (Uuid, i32) {
    let message = tokio::time::timeout(Duration::from_secs(10), worker.rx.recv())
        .await
        .expect("timed out waiting for a dispatch")
        .expect("worker channel closed");
    match message {
        CoreMessage::ExecuteTask {
            subtask_id,
            attempt,
            ..
        } => (subtask_id, attempt),
        other => panic!("expected execute_task, got {other:?}"),
    }
}

/// True when no dispatch arrives within a short grace period.
async fn channel_quiet(worker: &mut TestWorker) -> bool {
    tokio::time::timeout(Duration::from_millis(300), worker.rx.recv())
        .await
        .is_err()
}

fn work_output() -> serde_json::Value {
    serde_json::json!({
        "files": ["src/lib.rs"],
        "text": "implemented as described",
        "usage": { "tokens": 1200 },
    })
}

fn verdict_output(score: f64, auto_fix: bool, severities: &[&str]) -> serde_json::Value {
    let issues: Vec<serde_json::Value> = severities
        .iter()
        .map(|severity| serde_json::json!({ "severity": severity, "description": "issue" }))
        .collect();
    serde_json::json!({
        "files": [],
        "text": "review done",
        "verdict": {
            "score": score,
            "issues": issues,
            "auto_fix_feasible": auto_fix,
            "suggested_fix": if auto_fix { Some("apply the fix") } else { None },
        },
    })
}

async fn complete(
    orchestrator: &Arc<Orchestrator>,
    subtask_id: Uuid,
    attempt: i32,
    output: serde_json::Value,
) {
    orchestrator
        .on_task_result(
            subtask_id,
            attempt,
            ResultStatus::Completed,
            Some(output),
            None,
            false,
        )
        .await
        .expect("result should apply");
}

// ---------------------------------------------------------------------------
// Scenario: full lifecycle with one worker and a low-frequency checkpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_task_lifecycle_with_checkpoint() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let mut worker = spawn_worker(&orchestrator, "builder-1", &["claude", "gemini"]).await;

    let mut events = orchestrator.bus().subscribe(Topic::All);

    let task = orchestrator
        .submit_task(SubmitTask {
            description: "Build user authentication".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::Low),
            privacy: None,
            preferred_tools: vec!["claude".to_owned()],
        })
        .await
        .expect("submission should succeed");

    assert_eq!(task.status, TaskStatus::Running);
    let subtasks = subtask_db::list_subtasks_for_task(&pool, task.id).await.unwrap();
    assert_eq!(subtasks.len(), 6, "auth template yields six subtasks");

    // Drive every dispatch to completion. Work subtasks return artifacts;
    // review subtasks return clean verdicts. When the channel goes quiet,
    // either the checkpoint fired or the task finished.
    let mut completed = 0;
    loop {
        let received =
            tokio::time::timeout(Duration::from_millis(500), worker.rx.recv()).await;
        match received {
            Ok(Some(CoreMessage::ExecuteTask {
                subtask_id,
                attempt,
                ..
            })) => {
                let subtask =
                    subtask_db::get_subtask(&pool, subtask_id).await.unwrap().unwrap();
                let output = match subtask.kind {
                    SubtaskKind::Review => verdict_output(9.2, false, &[]),
                    _ => work_output(),
                };
                complete(&orchestrator, subtask_id, attempt, output).await;
                completed += 1;
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("worker channel closed unexpectedly"),
            Err(_) => {
                let current = orchestrator.get_task(task.id).await.unwrap();
                match current.status {
                    TaskStatus::CheckpointPending => {
                        let checkpoint = checkpoint_db::pending_for_task(&pool, task.id)
                            .await
                            .unwrap()
                            .expect("a pending checkpoint should exist");
                        assert_eq!(checkpoint.reason, CheckpointReason::Frequency);
                        orchestrator
                            .approve_checkpoint(checkpoint.id, Some("ship it"))
                            .await
                            .expect("approval should succeed");
                    }
                    TaskStatus::Completed => break,
                    other => {
                        panic!("task idle in unexpected state {other} after {completed} results")
                    }
                }
            }
        }
    }

    let final_task = orchestrator.get_task(task.id).await.unwrap();
    assert_eq!(final_task.status, TaskStatus::Completed);
    assert_eq!(final_task.progress, 100);

    // Exactly one checkpoint was raised for the whole run.
    let checkpoints = checkpoint_db::list_for_task(&pool, task.id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);

    // The event stream saw the checkpoint and the completion.
    let mut saw_checkpoint = false;
    let mut saw_complete = false;
    while let Ok(event) = events.receiver.try_recv() {
        match event.kind {
            EventKind::CheckpointReady => saw_checkpoint = true,
            EventKind::TaskComplete => saw_complete = true,
            _ => {}
        }
    }
    assert!(saw_checkpoint, "checkpoint-ready event should be published");
    assert!(saw_complete, "task-complete event should be published");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: recommended tool drives worker selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recommended_tool_prefers_matching_worker() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();

    let mut claude_worker = spawn_worker(&orchestrator, "claude-box", &["claude"]).await;
    let mut gemini_worker = spawn_worker(&orchestrator, "gemini-box", &["gemini"]).await;

    // The template seeds recommended_tool from the first preferred tool.
    let task = orchestrator
        .submit_task(SubmitTask {
            description: "Refactor the storage layer".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::Low),
            privacy: None,
            preferred_tools: vec!["gemini".to_owned(), "claude".to_owned()],
        })
        .await
        .unwrap();

    let (subtask_id, _) = next_execute(&mut gemini_worker).await;
    let subtask = subtask_db::get_subtask(&pool, subtask_id).await.unwrap().unwrap();
    assert_eq!(subtask.task_id, task.id);
    assert_eq!(subtask.recommended_tool.as_deref(), Some("gemini"));
    assert_eq!(subtask.assigned_worker, Some(gemini_worker.id));

    assert!(
        channel_quiet(&mut claude_worker).await,
        "the half-match worker must not receive the dispatch"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: worker loss reclaims and re-dispatches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_loss_reclaims_and_redispatches() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let mut lost_worker = spawn_worker(&orchestrator, "doomed", &["claude"]).await;

    let task = orchestrator
        .submit_task(SubmitTask {
            description: "Refactor the storage layer".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::Low),
            privacy: None,
            preferred_tools: vec!["claude".to_owned()],
        })
        .await
        .unwrap();

    let (subtask_id, attempt) = next_execute(&mut lost_worker).await;
    assert_eq!(attempt, 1);

    // The worker goes dark: mark offline (as the liveness sweep would)
    // and run the loss path.
    worker_db::set_worker_status(&pool, lost_worker.id, WorkerStatus::Offline)
        .await
        .unwrap();
    orchestrator.handle_worker_loss(lost_worker.id).await;

    let reclaimed = subtask_db::get_subtask(&pool, subtask_id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, SubtaskStatus::Ready);
    assert_eq!(reclaimed.retries, 1);
    assert!(reclaimed.assigned_worker.is_none());

    // Nobody can take it: the starvation is recorded.
    let activity = activity_db::list_for_task(&pool, task.id).await.unwrap();
    assert!(
        activity.iter().any(|a| a.event_type == "subtask_reclaimed"),
        "reclaim should be logged"
    );
    assert!(
        activity.iter().any(|a| a.event_type == "no_eligible_workers"),
        "starvation should be logged"
    );

    // A replacement worker picks it up on registration.
    let mut replacement = spawn_worker(&orchestrator, "replacement", &["claude"]).await;
    let (redispatched_id, attempt) = next_execute(&mut replacement).await;
    assert_eq!(redispatched_id, subtask_id);
    assert_eq!(attempt, 2, "re-dispatch uses a fresh attempt index");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: review -> correction -> re-review loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_correction_cycle_accepts_on_second_pass() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let mut worker = spawn_worker(&orchestrator, "solo", &["claude"]).await;

    // No template keyword: single-subtask fallback at complexity 3, which
    // always triggers peer review.
    let task = orchestrator
        .submit_task(SubmitTask {
            description: "Catalogue the lunar sample archive".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::Low),
            privacy: None,
            preferred_tools: vec!["claude".to_owned()],
        })
        .await
        .unwrap();

    // 1. The work subtask completes; a review follows and the
    //    single-subtask checkpoint fires.
    let (work_id, attempt) = next_execute(&mut worker).await;
    complete(&orchestrator, work_id, attempt, work_output()).await;

    let (review_id, attempt) = next_execute(&mut worker).await;
    let review_subtask = subtask_db::get_subtask(&pool, review_id).await.unwrap().unwrap();
    assert_eq!(review_subtask.kind, SubtaskKind::Review);

    // 2. The review finds fixable problems: score 6.5, auto-fix feasible,
    //    nothing critical, cycle count 0 -> a correction is spawned.
    complete(
        &orchestrator,
        review_id,
        attempt,
        verdict_output(6.5, true, &["medium"]),
    )
    .await;

    let original = subtask_db::get_subtask(&pool, work_id).await.unwrap().unwrap();
    assert_eq!(original.status, SubtaskStatus::Correcting);

    // 3. The frequency checkpoint is pending; approve to let the
    //    correction dispatch.
    let checkpoint = checkpoint_db::pending_for_task(&pool, task.id)
        .await
        .unwrap()
        .expect("frequency checkpoint should be pending");
    orchestrator.approve_checkpoint(checkpoint.id, None).await.unwrap();

    let (correction_id, attempt) = next_execute(&mut worker).await;
    let correction = subtask_db::get_subtask(&pool, correction_id).await.unwrap().unwrap();
    assert_eq!(correction.kind, SubtaskKind::Correction);
    assert_eq!(correction.review_target, Some(work_id));

    // 4. The correction lands; the cycle count increments and a second
    //    review is spawned.
    complete(
        &orchestrator,
        correction_id,
        attempt,
        serde_json::json!({ "files": ["src/lib.rs"], "text": "fixed" }),
    )
    .await;

    let original = subtask_db::get_subtask(&pool, work_id).await.unwrap().unwrap();
    assert_eq!(original.status, SubtaskStatus::Completed);
    assert_eq!(original.review_cycles, 1);
    assert_eq!(original.output.as_ref().unwrap()["text"], "fixed");

    let (second_review_id, attempt) = next_execute(&mut worker).await;
    assert_ne!(second_review_id, review_id);

    // 5. The second review is clean: the original is accepted and the
    //    task runs to completion.
    complete(
        &orchestrator,
        second_review_id,
        attempt,
        verdict_output(9.0, false, &[]),
    )
    .await;

    let reviews = review_db::list_for_subtask(&pool, work_id).await.unwrap();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0].decision, Some(ReviewDecision::NeedsRevision));
    assert_eq!(reviews[1].decision, Some(ReviewDecision::Approved));

    let final_task = orchestrator.get_task(task.id).await.unwrap();
    assert_eq!(final_task.status, TaskStatus::Completed);
    assert_eq!(final_task.progress, 100);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: the cycle ceiling escalates to a human
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_review_cycles_escalate() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let mut worker = spawn_worker(&orchestrator, "solo", &["claude"]).await;

    let task = orchestrator
        .submit_task(SubmitTask {
            description: "Transcribe the weather balloon logs".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::Low),
            privacy: None,
            preferred_tools: vec!["claude".to_owned()],
        })
        .await
        .unwrap();

    let (work_id, attempt) = next_execute(&mut worker).await;
    complete(&orchestrator, work_id, attempt, work_output()).await;

    // Approve the single-subtask frequency checkpoint up front.
    let checkpoint = checkpoint_db::pending_for_task(&pool, task.id)
        .await
        .unwrap()
        .expect("frequency checkpoint expected");
    orchestrator.approve_checkpoint(checkpoint.id, None).await.unwrap();

    // Three full review -> correction cycles, each review demanding a
    // fixable revision.
    for cycle in 0..3 {
        let (review_id, attempt) = next_execute(&mut worker).await;
        let review = subtask_db::get_subtask(&pool, review_id).await.unwrap().unwrap();
        assert_eq!(review.kind, SubtaskKind::Review, "cycle {cycle}");
        complete(
            &orchestrator,
            review_id,
            attempt,
            verdict_output(6.5, true, &["medium"]),
        )
        .await;

        let (correction_id, attempt) = next_execute(&mut worker).await;
        let correction = subtask_db::get_subtask(&pool, correction_id).await.unwrap().unwrap();
        assert_eq!(correction.kind, SubtaskKind::Correction, "cycle {cycle}");
        complete(
            &orchestrator,
            correction_id,
            attempt,
            serde_json::json!({ "files": ["src/lib.rs"], "text": format!("attempt {cycle}") }),
        )
        .await;
    }

    // The third correction spent the budget: no fourth review, a
    // review-escalation checkpoint instead.
    assert!(channel_quiet(&mut worker).await, "no further review may be dispatched");

    let original = subtask_db::get_subtask(&pool, work_id).await.unwrap().unwrap();
    assert_eq!(original.review_cycles, 3);

    let escalation = checkpoint_db::pending_for_task(&pool, task.id)
        .await
        .unwrap()
        .expect("escalation checkpoint expected");
    assert_eq!(escalation.reason, CheckpointReason::ReviewEscalation);

    let current = orchestrator.get_task(task.id).await.unwrap();
    assert_eq!(current.status, TaskStatus::CheckpointPending);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: idempotent result application
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reapplied_results_are_noops() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let mut worker = spawn_worker(&orchestrator, "solo", &["claude"]).await;

    let _task = orchestrator
        .submit_task(SubmitTask {
            description: "Index the telescope imagery".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::High),
            privacy: None,
            preferred_tools: vec!["claude".to_owned()],
        })
        .await
        .unwrap();

    let (subtask_id, attempt) = next_execute(&mut worker).await;
    complete(&orchestrator, subtask_id, attempt, work_output()).await;

    let after_first = subtask_db::get_subtask(&pool, subtask_id).await.unwrap().unwrap();
    assert_eq!(after_first.status, SubtaskStatus::Completed);

    // Same attempt again: dropped without effect.
    orchestrator
        .on_task_result(
            subtask_id,
            attempt,
            ResultStatus::Completed,
            Some(serde_json::json!({ "text": "should not overwrite" })),
            None,
            false,
        )
        .await
        .expect("replay must be a no-op, not an error");

    // Stale attempt index: also dropped.
    orchestrator
        .on_task_result(
            subtask_id,
            attempt - 1,
            ResultStatus::Failed,
            None,
            Some("stale".to_owned()),
            false,
        )
        .await
        .expect("stale attempt must be a no-op");

    let reloaded = subtask_db::get_subtask(&pool, subtask_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SubtaskStatus::Completed);
    assert_eq!(
        reloaded.output.as_ref().unwrap()["text"],
        "implemented as described"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: identical heartbeats do not duplicate worker events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_heartbeats_do_not_duplicate_events() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let worker = spawn_worker(&orchestrator, "steady", &["claude"]).await;

    let mut events = orchestrator.bus().subscribe(Topic::Workers);
    // Drain anything from registration.
    while events.receiver.try_recv().is_ok() {}

    let snapshot = ResourceSnapshot {
        cpu_pct: 10.0,
        mem_pct: 20.0,
        disk_pct: 30.0,
    };

    orchestrator
        .handle_worker_message(WorkerMessage::Heartbeat {
            worker_id: worker.id,
            resources: snapshot,
        })
        .await
        .unwrap();
    orchestrator
        .handle_worker_message(WorkerMessage::Heartbeat {
            worker_id: worker.id,
            resources: snapshot,
        })
        .await
        .unwrap();

    let mut worker_updates = 0;
    while let Ok(event) = events.receiver.try_recv() {
        if event.kind == EventKind::WorkerUpdate {
            worker_updates += 1;
        }
    }
    assert_eq!(
        worker_updates, 1,
        "the unchanged second heartbeat must not emit another event"
    );

    // The TTL refresh still happened: the worker remains live.
    assert!(orchestrator.registry().is_live(worker.id).await);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario: correction against a decided checkpoint is a conflict
// ---------------------------------------------------------------------------

#[tokio::test]
async fn correction_against_approved_checkpoint_conflicts() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None).unwrap();
    let mut worker = spawn_worker(&orchestrator, "solo", &["claude"]).await;

    let task = orchestrator
        .submit_task(SubmitTask {
            description: "Summarize the maintenance reports".to_owned(),
            requirements: vec![],
            checkpoint_frequency: Some(CheckpointFrequency::Low),
            privacy: None,
            preferred_tools: vec!["claude".to_owned()],
        })
        .await
        .unwrap();

    let (work_id, attempt) = next_execute(&mut worker).await;
    complete(&orchestrator, work_id, attempt, work_output()).await;

    let checkpoint = checkpoint_db::pending_for_task(&pool, task.id)
        .await
        .unwrap()
        .expect("checkpoint expected");
    orchestrator.approve_checkpoint(checkpoint.id, None).await.unwrap();

    // Approving again is a no-op.
    orchestrator
        .approve_checkpoint(checkpoint.id, None)
        .await
        .expect("double approval is idempotent");

    // Rejecting a decided checkpoint is a conflict.
    let err = orchestrator
        .reject_checkpoint(checkpoint.id, None)
        .await
        .expect_err("rejecting an approved checkpoint must fail");
    assert_eq!(err.kind, conductor_core::ErrorKind::Conflict);

    // Corrections are only accepted while pending review.
    let err = orchestrator
        .correct_checkpoint(
            checkpoint.id,
            work_id,
            conductor_db::models::CorrectionCategory::Incomplete,
            "please add the appendix",
        )
        .await
        .expect_err("correction against a decided checkpoint must fail");
    assert_eq!(err.kind, conductor_core::ErrorKind::Conflict);

    pool.close().await;
    drop_test_db(&db_name).await;
}
