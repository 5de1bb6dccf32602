//! The `conductor status` command: task overview tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::queries::checkpoints as checkpoint_db;
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::tasks as task_db;

/// Show all tasks, or one task's subtasks in detail.
pub async fn run_status(pool: &PgPool, task_id: Option<&str>) -> Result<()> {
    match task_id {
        Some(raw) => {
            let id = Uuid::parse_str(raw).with_context(|| format!("invalid task ID: {raw}"))?;
            show_task(pool, id).await
        }
        None => list_all(pool).await,
    }
}

async fn list_all(pool: &PgPool) -> Result<()> {
    let tasks = task_db::list_tasks(pool, None, 100, 0).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:>8}  DESCRIPTION",
        "ID", "STATUS", "PROGRESS"
    );
    for task in &tasks {
        let description: String = task.description.chars().take(48).collect();
        println!(
            "{:<38} {:<20} {:>7}%  {}",
            task.id, task.status.to_string(), task.progress, description
        );
    }
    Ok(())
}

async fn show_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task {}", task.id);
    println!("  status:    {}", task.status);
    println!("  progress:  {}%", task.progress);
    println!("  frequency: {}", task.checkpoint_frequency);
    println!("  privacy:   {}", task.privacy);
    println!("  created:   {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    let subtasks = subtask_db::list_subtasks_for_task(pool, task_id).await?;
    println!("{:<38} {:<12} {:<10} {:<6} NAME", "ID", "STATUS", "KIND", "RETRY");
    for subtask in &subtasks {
        println!(
            "{:<38} {:<12} {:<10} {:<6} {}",
            subtask.id,
            subtask.status.to_string(),
            subtask.kind.to_string(),
            subtask.retries,
            subtask.name
        );
    }

    if let Some(checkpoint) = checkpoint_db::latest_for_task(pool, task_id).await? {
        println!();
        println!(
            "Latest checkpoint: {} ({}, {})",
            checkpoint.id, checkpoint.reason, checkpoint.status
        );
    }

    Ok(())
}
